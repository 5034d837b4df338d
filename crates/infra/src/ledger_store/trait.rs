use std::sync::Arc;

use thiserror::Error;

use stockledger_core::{
    ExpectedVersion, FacilityId, MovementDraftId, OrderableId, PhysicalInventoryId, ProgramId,
    StockCardId, SubDraftId,
};
use stockledger_stock::{
    LedgerError, Location, LocationCode, LocationEventExtension, LocationMovement,
    LocationSnapshot, MovementDraft, PhysicalInventory, PhysicalInventorySubDraft, StockCard,
    StockCardHistory, StockCardKey, StockEvent, StockOnHandSnapshot,
};

/// Ledger store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// ledger rule violations, which services raise before anything is written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("no outstanding movement draft for program {program_id} at facility {facility_id}")]
    DraftNotFound {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error("a movement draft already exists for program {program_id} at facility {facility_id}")]
    DuplicateDraft {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error("a physical inventory is already open for program {program_id} at facility {facility_id}")]
    DuplicatePhysicalInventory {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error("duplicate row: {0}")]
    Duplicate(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("row (de)serialization failed: {0}")]
    Serialization(String),
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) | StoreError::Duplicate(msg) => LedgerError::Concurrency(msg),
            StoreError::DraftNotFound {
                program_id,
                facility_id,
            } => LedgerError::MovementDraftNotFound {
                program_id,
                facility_id,
            },
            StoreError::DuplicateDraft {
                program_id,
                facility_id,
            } => LedgerError::DraftAlreadyExists {
                program_id,
                facility_id,
            },
            StoreError::DuplicatePhysicalInventory {
                program_id,
                facility_id,
            } => LedgerError::PhysicalInventoryAlreadyExists {
                program_id,
                facility_id,
            },
            StoreError::Backend(msg) | StoreError::Serialization(msg) => LedgerError::Storage(msg),
        }
    }
}

/// Entries appended to one stock-card stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub stock_card_id: StockCardId,
    /// Stream version the writer read; the append fails if it moved.
    pub expected_version: ExpectedVersion,
    pub events: Vec<StockEvent>,
    pub movements: Vec<LocationMovement>,
    pub extensions: Vec<LocationEventExtension>,
}

impl StreamAppend {
    pub fn new(stock_card_id: StockCardId, expected_version: ExpectedVersion) -> Self {
        Self {
            stock_card_id,
            expected_version,
            events: Vec::new(),
            movements: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// Number of stream entries (events plus movements) this append adds.
    pub fn len(&self) -> u64 {
        (self.events.len() + self.movements.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.movements.is_empty()
    }
}

/// How a batch changes the location snapshot series of a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationRows {
    /// Insert or overwrite rows keyed by `(location, date)`; others are kept.
    Upsert(Vec<LocationSnapshot>),
    /// Drop every row of the card and store these instead.
    Replace(Vec<LocationSnapshot>),
}

/// Derived rows for one stock card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub stock_card_id: StockCardId,
    /// Full stock-on-hand series; replaces the stored one.
    pub stock_on_hand: Vec<StockOnHandSnapshot>,
    pub locations: LocationRows,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftWrite {
    /// Fails with `DuplicateDraft` if the scope already has a draft.
    Create(MovementDraft),
    /// Stores `draft`; the stored row must still be at `expected_version`.
    Update {
        draft: MovementDraft,
        expected_version: ExpectedVersion,
    },
    /// Consumes the draft; fails with `DraftNotFound` if it is already gone.
    Delete(MovementDraft),
}

/// Every write of one request. Committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerBatch {
    pub stock_cards: Vec<StockCard>,
    pub streams: Vec<StreamAppend>,
    pub snapshots: Vec<SnapshotWrite>,
    pub drafts: Vec<DraftWrite>,
    /// Upserts guarded by the version the writer read (`Any` for new rows).
    pub physical_inventories: Vec<(PhysicalInventory, ExpectedVersion)>,
    pub sub_drafts: Vec<(PhysicalInventorySubDraft, ExpectedVersion)>,
    pub locations: Vec<Location>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stock_cards.is_empty()
            && self.streams.iter().all(StreamAppend::is_empty)
            && self.snapshots.is_empty()
            && self.drafts.is_empty()
            && self.physical_inventories.is_empty()
            && self.sub_drafts.is_empty()
            && self.locations.is_empty()
    }
}

/// Durable home of the ledger: append-only streams per stock card, their
/// derived snapshot series, and the mutable draft tables.
///
/// ## Streams
///
/// Each stock card owns one stream holding both its stock-card events and its
/// location movements. The stream version is the number of entries appended so
/// far; writers pass the version they read as `ExpectedVersion` and the commit
/// fails with `Concurrency` if another writer got there first.
///
/// ## Atomicity
///
/// `commit` applies a whole [`LedgerBatch`] or nothing. Implementations check
/// every precondition before the first write becomes visible.
///
/// ## Reads
///
/// Reads return `Ok(None)` / empty collections for unknown keys; NotFound
/// decisions belong to the caller.
pub trait LedgerStore: Send + Sync {
    fn stock_card(&self, id: StockCardId) -> Result<Option<StockCard>, StoreError>;

    fn find_stock_card(&self, key: &StockCardKey) -> Result<Option<StockCard>, StoreError>;

    /// Stock cards of a facility, optionally narrowed to one program and/or product.
    fn stock_cards(
        &self,
        facility_id: FacilityId,
        program_id: Option<ProgramId>,
        orderable_id: Option<OrderableId>,
    ) -> Result<Vec<StockCard>, StoreError>;

    /// Full history of one card. `None` if the card does not exist.
    fn history(&self, stock_card_id: StockCardId) -> Result<Option<StockCardHistory>, StoreError>;

    fn draft(&self, id: MovementDraftId) -> Result<Option<MovementDraft>, StoreError>;

    fn draft_for_scope(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<MovementDraft>, StoreError>;

    fn physical_inventory(
        &self,
        id: PhysicalInventoryId,
    ) -> Result<Option<PhysicalInventory>, StoreError>;

    /// The physical inventory of a scope that is still in `DRAFT`, if any.
    fn open_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<PhysicalInventory>, StoreError>;

    fn sub_draft(&self, id: SubDraftId) -> Result<Option<PhysicalInventorySubDraft>, StoreError>;

    /// Sub-drafts of one physical inventory, ordered by number.
    fn sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> Result<Vec<PhysicalInventorySubDraft>, StoreError>;

    fn location(
        &self,
        facility_id: FacilityId,
        code: &LocationCode,
    ) -> Result<Option<Location>, StoreError>;

    fn locations(&self, facility_id: FacilityId) -> Result<Vec<Location>, StoreError>;

    fn commit(&self, batch: LedgerBatch) -> Result<(), StoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn stock_card(&self, id: StockCardId) -> Result<Option<StockCard>, StoreError> {
        (**self).stock_card(id)
    }

    fn find_stock_card(&self, key: &StockCardKey) -> Result<Option<StockCard>, StoreError> {
        (**self).find_stock_card(key)
    }

    fn stock_cards(
        &self,
        facility_id: FacilityId,
        program_id: Option<ProgramId>,
        orderable_id: Option<OrderableId>,
    ) -> Result<Vec<StockCard>, StoreError> {
        (**self).stock_cards(facility_id, program_id, orderable_id)
    }

    fn history(&self, stock_card_id: StockCardId) -> Result<Option<StockCardHistory>, StoreError> {
        (**self).history(stock_card_id)
    }

    fn draft(&self, id: MovementDraftId) -> Result<Option<MovementDraft>, StoreError> {
        (**self).draft(id)
    }

    fn draft_for_scope(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<MovementDraft>, StoreError> {
        (**self).draft_for_scope(program_id, facility_id)
    }

    fn physical_inventory(
        &self,
        id: PhysicalInventoryId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        (**self).physical_inventory(id)
    }

    fn open_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        (**self).open_physical_inventory(program_id, facility_id)
    }

    fn sub_draft(&self, id: SubDraftId) -> Result<Option<PhysicalInventorySubDraft>, StoreError> {
        (**self).sub_draft(id)
    }

    fn sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> Result<Vec<PhysicalInventorySubDraft>, StoreError> {
        (**self).sub_drafts(physical_inventory_id)
    }

    fn location(
        &self,
        facility_id: FacilityId,
        code: &LocationCode,
    ) -> Result<Option<Location>, StoreError> {
        (**self).location(facility_id, code)
    }

    fn locations(&self, facility_id: FacilityId) -> Result<Vec<Location>, StoreError> {
        (**self).locations(facility_id)
    }

    fn commit(&self, batch: LedgerBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }
}
