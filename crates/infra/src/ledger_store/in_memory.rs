use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::NaiveDate;
use uuid::Uuid;

use stockledger_core::{
    ExpectedVersion, FacilityId, MovementDraftId, OrderableId, PhysicalInventoryId, ProgramId,
    StockCardId, SubDraftId,
};
use stockledger_events::EventEnvelope;
use stockledger_stock::{
    LedgerRecord, Location, LocationCode, LocationRef, LocationSnapshot, MovementDraft,
    PhysicalInventory, PhysicalInventorySubDraft, StockCard, StockCardHistory, StockCardKey,
    StockOnHandSnapshot,
};

use super::r#trait::{
    DraftWrite, LedgerBatch, LedgerStore, LocationRows, SnapshotWrite, StoreError, StreamAppend,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    cards: HashMap<StockCardId, StockCard>,
    card_keys: HashMap<StockCardKey, StockCardId>,
    streams: HashMap<StockCardId, Vec<EventEnvelope<LedgerRecord>>>,
    extensions: HashMap<StockCardId, HashMap<Uuid, LocationRef>>,
    stock_snapshots: HashMap<StockCardId, Vec<StockOnHandSnapshot>>,
    location_snapshots: HashMap<StockCardId, BTreeMap<(LocationCode, NaiveDate), LocationSnapshot>>,
    drafts: HashMap<MovementDraftId, MovementDraft>,
    physical_inventories: HashMap<PhysicalInventoryId, PhysicalInventory>,
    sub_drafts: HashMap<SubDraftId, PhysicalInventorySubDraft>,
    locations: BTreeMap<(FacilityId, LocationCode), Location>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Not optimized for performance: a commit stages its
/// writes on a copy of every table and swaps it in once all checks passed.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(f(&tables))
    }
}

fn stream_version(stream: &[EventEnvelope<LedgerRecord>]) -> u64 {
    stream.last().map(|e| e.sequence_number()).unwrap_or(0)
}

impl Tables {
    fn apply(&mut self, batch: LedgerBatch) -> Result<(), StoreError> {
        for card in batch.stock_cards {
            self.insert_card(card)?;
        }
        for append in batch.streams {
            self.append(append)?;
        }
        for write in batch.snapshots {
            self.write_snapshots(write)?;
        }
        for write in batch.drafts {
            self.write_draft(write)?;
        }
        for (inventory, expected) in batch.physical_inventories {
            self.write_physical_inventory(inventory, expected)?;
        }
        for (sub_draft, expected) in batch.sub_drafts {
            self.write_sub_draft(sub_draft, expected)?;
        }
        for location in batch.locations {
            let key = (location.facility_id, location.code.clone());
            if self.locations.contains_key(&key) {
                return Err(StoreError::Duplicate(format!(
                    "location {} already exists at facility {}",
                    location.code, location.facility_id
                )));
            }
            self.locations.insert(key, location);
        }
        Ok(())
    }

    fn insert_card(&mut self, card: StockCard) -> Result<(), StoreError> {
        match self.card_keys.get(&card.key()) {
            Some(existing) if *existing == card.id => Ok(()),
            Some(_) => Err(StoreError::Duplicate(format!(
                "stock card already exists for {}",
                card.key()
            ))),
            None => {
                self.card_keys.insert(card.key(), card.id);
                self.cards.insert(card.id, card);
                Ok(())
            }
        }
    }

    fn append(&mut self, append: StreamAppend) -> Result<(), StoreError> {
        if !self.cards.contains_key(&append.stock_card_id) {
            return Err(StoreError::Backend(format!(
                "append to unknown stock card {}",
                append.stock_card_id
            )));
        }

        let stream = self.streams.entry(append.stock_card_id).or_default();
        let current = stream_version(stream);
        if !append.expected_version.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "stock card {}: expected {:?}, found {current}",
                append.stock_card_id, append.expected_version
            )));
        }

        let records = append
            .events
            .into_iter()
            .map(LedgerRecord::Stock)
            .chain(append.movements.into_iter().map(LedgerRecord::Movement));
        let mut next = current + 1;
        for record in records {
            stream.push(EventEnvelope::new(append.stock_card_id, next, record));
            next += 1;
        }

        let extensions = self.extensions.entry(append.stock_card_id).or_default();
        for extension in append.extensions {
            if extensions.contains_key(&extension.ledger_event_id) {
                return Err(StoreError::Duplicate(format!(
                    "event {} already has a location",
                    extension.ledger_event_id
                )));
            }
            extensions.insert(extension.ledger_event_id, extension.location);
        }
        Ok(())
    }

    fn write_snapshots(&mut self, write: SnapshotWrite) -> Result<(), StoreError> {
        if !self.cards.contains_key(&write.stock_card_id) {
            return Err(StoreError::Backend(format!(
                "snapshots for unknown stock card {}",
                write.stock_card_id
            )));
        }
        self.stock_snapshots
            .insert(write.stock_card_id, write.stock_on_hand);

        let rows = self.location_snapshots.entry(write.stock_card_id).or_default();
        let incoming = match write.locations {
            LocationRows::Upsert(incoming) => incoming,
            LocationRows::Replace(incoming) => {
                rows.clear();
                incoming
            }
        };
        for row in incoming {
            rows.insert((row.location_code.clone(), row.occurred_date), row);
        }
        Ok(())
    }

    fn write_draft(&mut self, write: DraftWrite) -> Result<(), StoreError> {
        match write {
            DraftWrite::Create(draft) => {
                let taken = self.drafts.values().any(|d| {
                    d.program_id == draft.program_id && d.facility_id == draft.facility_id
                });
                if taken {
                    return Err(StoreError::DuplicateDraft {
                        program_id: draft.program_id,
                        facility_id: draft.facility_id,
                    });
                }
                self.drafts.insert(draft.id, draft);
            }
            DraftWrite::Update {
                draft,
                expected_version,
            } => {
                let stored = self.drafts.get(&draft.id).ok_or(StoreError::DraftNotFound {
                    program_id: draft.program_id,
                    facility_id: draft.facility_id,
                })?;
                expected_version
                    .check(stored.version)
                    .map_err(|e| StoreError::Concurrency(format!("draft {}: {e}", draft.id)))?;
                self.drafts.insert(draft.id, draft);
            }
            DraftWrite::Delete(draft) => {
                let stored = self.drafts.get(&draft.id).ok_or(StoreError::DraftNotFound {
                    program_id: draft.program_id,
                    facility_id: draft.facility_id,
                })?;
                if stored.version != draft.version {
                    return Err(StoreError::Concurrency(format!(
                        "draft {} changed since it was read (version {} != {})",
                        draft.id, stored.version, draft.version
                    )));
                }
                self.drafts.remove(&draft.id);
            }
        }
        Ok(())
    }

    fn write_physical_inventory(
        &mut self,
        inventory: PhysicalInventory,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        match self.physical_inventories.get(&inventory.id) {
            Some(stored) => {
                expected.check(stored.version).map_err(|e| {
                    StoreError::Concurrency(format!("physical inventory {}: {e}", inventory.id))
                })?;
            }
            None => {
                if let ExpectedVersion::Exact(v) = expected {
                    return Err(StoreError::Concurrency(format!(
                        "physical inventory {} expected at version {v} but does not exist",
                        inventory.id
                    )));
                }
                let open = self.physical_inventories.values().any(|p| {
                    p.is_draft()
                        && p.program_id == inventory.program_id
                        && p.facility_id == inventory.facility_id
                });
                if open {
                    return Err(StoreError::DuplicatePhysicalInventory {
                        program_id: inventory.program_id,
                        facility_id: inventory.facility_id,
                    });
                }
            }
        }
        self.physical_inventories.insert(inventory.id, inventory);
        Ok(())
    }

    fn write_sub_draft(
        &mut self,
        sub_draft: PhysicalInventorySubDraft,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        match self.sub_drafts.get(&sub_draft.id) {
            Some(stored) => {
                expected
                    .check(stored.version)
                    .map_err(|e| StoreError::Concurrency(format!("sub-draft {}: {e}", sub_draft.id)))?;
            }
            None => {
                let taken = self.sub_drafts.values().any(|s| {
                    s.physical_inventory_id == sub_draft.physical_inventory_id
                        && s.number == sub_draft.number
                });
                if taken {
                    return Err(StoreError::Duplicate(format!(
                        "sub-draft #{} already exists for physical inventory {}",
                        sub_draft.number, sub_draft.physical_inventory_id
                    )));
                }
            }
        }
        self.sub_drafts.insert(sub_draft.id, sub_draft);
        Ok(())
    }

    fn history(&self, stock_card_id: StockCardId) -> Option<StockCardHistory> {
        let card = self.cards.get(&stock_card_id)?;
        let mut history = StockCardHistory::new(*card);

        if let Some(stream) = self.streams.get(&stock_card_id) {
            for envelope in stream {
                match envelope.payload() {
                    LedgerRecord::Stock(e) => history.events.push(e.clone()),
                    LedgerRecord::Movement(m) => history.movements.push(m.clone()),
                }
            }
            history.version = stream_version(stream);
        }
        if let Some(extensions) = self.extensions.get(&stock_card_id) {
            history.extensions = extensions.clone();
        }
        if let Some(rows) = self.stock_snapshots.get(&stock_card_id) {
            history.stock_snapshots = rows.clone();
        }
        if let Some(rows) = self.location_snapshots.get(&stock_card_id) {
            history.location_snapshots = rows.values().cloned().collect();
            history
                .location_snapshots
                .sort_by(|a, b| (a.occurred_date, &a.location_code).cmp(&(b.occurred_date, &b.location_code)));
        }
        Some(history)
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn stock_card(&self, id: StockCardId) -> Result<Option<StockCard>, StoreError> {
        self.read(|t| t.cards.get(&id).copied())
    }

    fn find_stock_card(&self, key: &StockCardKey) -> Result<Option<StockCard>, StoreError> {
        self.read(|t| t.card_keys.get(key).and_then(|id| t.cards.get(id)).copied())
    }

    fn stock_cards(
        &self,
        facility_id: FacilityId,
        program_id: Option<ProgramId>,
        orderable_id: Option<OrderableId>,
    ) -> Result<Vec<StockCard>, StoreError> {
        self.read(|t| {
            let mut cards: Vec<StockCard> = t
                .cards
                .values()
                .filter(|c| c.facility_id == facility_id)
                .filter(|c| program_id.is_none_or(|p| c.program_id == p))
                .filter(|c| orderable_id.is_none_or(|o| c.orderable_id == o))
                .copied()
                .collect();
            cards.sort_by_key(|c| c.id);
            cards
        })
    }

    fn history(&self, stock_card_id: StockCardId) -> Result<Option<StockCardHistory>, StoreError> {
        self.read(|t| t.history(stock_card_id))
    }

    fn draft(&self, id: MovementDraftId) -> Result<Option<MovementDraft>, StoreError> {
        self.read(|t| t.drafts.get(&id).cloned())
    }

    fn draft_for_scope(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<MovementDraft>, StoreError> {
        self.read(|t| {
            t.drafts
                .values()
                .find(|d| d.program_id == program_id && d.facility_id == facility_id)
                .cloned()
        })
    }

    fn physical_inventory(
        &self,
        id: PhysicalInventoryId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        self.read(|t| t.physical_inventories.get(&id).cloned())
    }

    fn open_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        self.read(|t| {
            t.physical_inventories
                .values()
                .find(|p| p.is_draft() && p.program_id == program_id && p.facility_id == facility_id)
                .cloned()
        })
    }

    fn sub_draft(&self, id: SubDraftId) -> Result<Option<PhysicalInventorySubDraft>, StoreError> {
        self.read(|t| t.sub_drafts.get(&id).cloned())
    }

    fn sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> Result<Vec<PhysicalInventorySubDraft>, StoreError> {
        self.read(|t| {
            let mut subs: Vec<PhysicalInventorySubDraft> = t
                .sub_drafts
                .values()
                .filter(|s| s.physical_inventory_id == physical_inventory_id)
                .cloned()
                .collect();
            subs.sort_by_key(|s| s.number);
            subs
        })
    }

    fn location(
        &self,
        facility_id: FacilityId,
        code: &LocationCode,
    ) -> Result<Option<Location>, StoreError> {
        self.read(|t| t.locations.get(&(facility_id, code.clone())).cloned())
    }

    fn locations(&self, facility_id: FacilityId) -> Result<Vec<Location>, StoreError> {
        self.read(|t| {
            t.locations
                .values()
                .filter(|l| l.facility_id == facility_id)
                .cloned()
                .collect()
        })
    }

    fn commit(&self, batch: LedgerBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        let mut staged = tables.clone();
        staged.apply(batch)?;
        *tables = staged;
        Ok(())
    }
}
