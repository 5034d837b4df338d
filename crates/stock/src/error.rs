//! Ledger error taxonomy surfaced to callers.
//!
//! Every variant is terminal for the request that produced it: nothing here is
//! retried internally and no ledger write happens once one is raised.

use chrono::NaiveDate;
use thiserror::Error;

use stockledger_core::{
    DomainError, FacilityId, LotId, MovementDraftId, OrderableId, PhysicalInventoryId, ProgramId,
    StockCardId, SubDraftId,
};

use crate::sub_draft::SubDraftStatus;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("stock card not found: {0}")]
    StockCardNotFound(String),

    #[error("no outstanding movement draft for program {program_id} at facility {facility_id}")]
    MovementDraftNotFound {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error("movement draft not found: {0}")]
    DraftIdNotFound(MovementDraftId),

    #[error("physical inventory sub-draft not found: {0}")]
    SubDraftNotFound(SubDraftId),

    #[error("physical inventory not found: {0}")]
    PhysicalInventoryNotFound(PhysicalInventoryId),

    #[error("location not found: {0}")]
    LocationNotFound(String),

    #[error("a movement draft already exists for program {program_id} at facility {facility_id}")]
    DraftAlreadyExists {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error("a physical inventory is already in progress for program {program_id} at facility {facility_id}")]
    PhysicalInventoryAlreadyExists {
        program_id: ProgramId,
        facility_id: FacilityId,
    },

    #[error(
        "quantity {requested} exceeds stock on hand {available} at location {location_code} (stock card {stock_card_id})"
    )]
    QuantityExceedsStockOnHand {
        stock_card_id: StockCardId,
        location_code: String,
        requested: i64,
        available: i64,
    },

    #[error("stock on hand would become {stock_on_hand} on {occurred_date} (stock card {stock_card_id}, location {location_code:?})")]
    NegativeStockOnHand {
        stock_card_id: StockCardId,
        location_code: Option<String>,
        occurred_date: NaiveDate,
        stock_on_hand: i64,
    },

    #[error("physical inventory already has the maximum of {max} sub-drafts")]
    TooManySubDrafts { max: usize },

    #[error("product {orderable_id} lot {lot_id:?} is already claimed by sub-draft #{sub_draft_number}")]
    InventoryConflict {
        orderable_id: OrderableId,
        lot_id: Option<LotId>,
        sub_draft_number: u32,
    },

    #[error("sub-draft cannot be operated in status {status:?}")]
    CannotOperate { status: SubDraftStatus },

    #[error("{pending} sub-draft(s) are not submitted yet")]
    SubDraftsNotSubmitted { pending: usize },

    #[error(
        "location balances ({location_total}) do not reconcile with stock on hand ({stock_on_hand}) on {occurred_date} (stock card {stock_card_id})"
    )]
    ReconciliationMismatch {
        stock_card_id: StockCardId,
        occurred_date: NaiveDate,
        stock_on_hand: i64,
        location_total: i64,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    /// True for the NotFound family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::StockCardNotFound(_)
                | LedgerError::MovementDraftNotFound { .. }
                | LedgerError::DraftIdNotFound(_)
                | LedgerError::SubDraftNotFound(_)
                | LedgerError::PhysicalInventoryNotFound(_)
                | LedgerError::LocationNotFound(_)
        )
    }
}
