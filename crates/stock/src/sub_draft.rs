//! Physical inventories split into independently editable sub-drafts.
//!
//! The `(orderable, lot)` pairs of the sub-drafts of one physical inventory
//! form a partition: no pair is claimed by two sub-drafts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DomainError, FacilityId, LotId, OrderableId, PhysicalInventoryId, ProgramId, SubDraftId,
    UserId, Versioned,
};

use crate::error::{LedgerError, LedgerResult};
use crate::location::LocationRef;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubDraftStatus {
    NotYetStarted,
    Draft,
    Submitted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperateType {
    Save,
    Submit,
}

/// One counted `(orderable, lot)` line. `quantity` stays `None` until counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalInventoryLine {
    pub orderable_id: OrderableId,
    pub lot_id: Option<LotId>,
    pub quantity: Option<i64>,
    pub location: Option<LocationRef>,
}

impl PhysicalInventoryLine {
    pub fn product_key(&self) -> (OrderableId, Option<LotId>) {
        (self.orderable_id, self.lot_id)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhysicalInventoryStatus {
    Draft,
    Completed,
}

/// A bulk count for one `(program, facility)` scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalInventory {
    pub id: PhysicalInventoryId,
    pub program_id: ProgramId,
    pub facility_id: FacilityId,
    pub status: PhysicalInventoryStatus,
    pub occurred_date: Option<NaiveDate>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl PhysicalInventory {
    pub fn new(program_id: ProgramId, facility_id: FacilityId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: PhysicalInventoryId::new(),
            program_id,
            facility_id,
            status: PhysicalInventoryStatus::Draft,
            occurred_date: None,
            version: 0,
            created_at,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == PhysicalInventoryStatus::Draft
    }

    pub fn complete(&mut self, occurred_date: NaiveDate) -> LedgerResult<()> {
        if !self.is_draft() {
            return Err(DomainError::invariant("physical inventory is already completed").into());
        }
        self.status = PhysicalInventoryStatus::Completed;
        self.occurred_date = Some(occurred_date);
        self.version += 1;
        Ok(())
    }
}

impl Versioned for PhysicalInventory {
    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalInventorySubDraft {
    pub id: SubDraftId,
    pub physical_inventory_id: PhysicalInventoryId,
    /// 1-based position within the physical inventory.
    pub number: u32,
    pub status: SubDraftStatus,
    pub operator_id: Option<UserId>,
    pub line_items: Vec<PhysicalInventoryLine>,
    pub version: u64,
}

impl PhysicalInventorySubDraft {
    pub fn new(physical_inventory_id: PhysicalInventoryId, number: u32) -> Self {
        Self {
            id: SubDraftId::new(),
            physical_inventory_id,
            number,
            status: SubDraftStatus::NotYetStarted,
            operator_id: None,
            line_items: Vec::new(),
            version: 0,
        }
    }

    pub fn ensure_operable(&self) -> LedgerResult<()> {
        match self.status {
            SubDraftStatus::NotYetStarted | SubDraftStatus::Draft => Ok(()),
            SubDraftStatus::Submitted => Err(LedgerError::CannotOperate {
                status: self.status,
            }),
        }
    }

    /// Saves or submits `lines`. The partition check against siblings is the
    /// caller's job (see [`check_partition`]).
    pub fn apply_update(
        &mut self,
        lines: Vec<PhysicalInventoryLine>,
        operate: OperateType,
        operator_id: UserId,
    ) -> LedgerResult<()> {
        self.ensure_operable()?;

        let mut seen = BTreeSet::new();
        for line in &lines {
            if !seen.insert(line.product_key()) {
                return Err(DomainError::validation(format!(
                    "orderable {} appears twice in sub-draft {}",
                    line.orderable_id, self.number
                ))
                .into());
            }
            match line.quantity {
                Some(q) if q < 0 => {
                    return Err(DomainError::validation("counted quantity cannot be negative").into());
                }
                None if operate == OperateType::Submit => {
                    return Err(DomainError::validation(format!(
                        "orderable {} has no counted quantity",
                        line.orderable_id
                    ))
                    .into());
                }
                _ => {}
            }
        }

        self.line_items = lines;
        self.operator_id = Some(operator_id);
        self.status = match operate {
            OperateType::Save => SubDraftStatus::Draft,
            OperateType::Submit => SubDraftStatus::Submitted,
        };
        self.version += 1;
        Ok(())
    }

    /// Empties the sub-draft; identity and number are kept.
    pub fn clear(&mut self) -> LedgerResult<()> {
        self.ensure_operable()?;
        self.line_items.clear();
        self.operator_id = None;
        self.status = SubDraftStatus::NotYetStarted;
        self.version += 1;
        Ok(())
    }

    pub fn product_keys(&self) -> BTreeSet<(OrderableId, Option<LotId>)> {
        self.line_items.iter().map(|l| l.product_key()).collect()
    }
}

impl Versioned for PhysicalInventorySubDraft {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Fails if any of `lines` is already claimed by a sibling of `target`.
pub fn check_partition(
    target: SubDraftId,
    lines: &[PhysicalInventoryLine],
    siblings: &[PhysicalInventorySubDraft],
) -> LedgerResult<()> {
    for sibling in siblings.iter().filter(|s| s.id != target) {
        let claimed = sibling.product_keys();
        if let Some(line) = lines.iter().find(|l| claimed.contains(&l.product_key())) {
            return Err(LedgerError::InventoryConflict {
                orderable_id: line.orderable_id,
                lot_id: line.lot_id,
                sub_draft_number: sibling.number,
            });
        }
    }
    Ok(())
}

/// Number for the next sub-draft, or `TooManySubDrafts` once `max` exist.
pub fn next_sub_draft_number(
    existing: &[PhysicalInventorySubDraft],
    max: usize,
) -> LedgerResult<u32> {
    if existing.len() >= max {
        return Err(LedgerError::TooManySubDrafts { max });
    }
    Ok(existing.iter().map(|s| s.number).max().unwrap_or(0) + 1)
}

/// Union of the line items of every sub-draft, once all are submitted and
/// still disjoint.
pub fn merge_submitted(
    sub_drafts: &[PhysicalInventorySubDraft],
) -> LedgerResult<Vec<PhysicalInventoryLine>> {
    let pending = sub_drafts
        .iter()
        .filter(|s| s.status != SubDraftStatus::Submitted)
        .count();
    if pending > 0 {
        return Err(LedgerError::SubDraftsNotSubmitted { pending });
    }

    let mut merged: BTreeMap<(OrderableId, Option<LotId>), PhysicalInventoryLine> = BTreeMap::new();
    for sub_draft in sub_drafts {
        for line in &sub_draft.line_items {
            if merged.insert(line.product_key(), line.clone()).is_some() {
                return Err(LedgerError::InventoryConflict {
                    orderable_id: line.orderable_id,
                    lot_id: line.lot_id,
                    sub_draft_number: sub_draft.number,
                });
            }
        }
    }
    Ok(merged.into_values().collect())
}
