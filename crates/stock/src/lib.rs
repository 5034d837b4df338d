//! Stock ledger domain (pure, deterministic).
//!
//! Business rules for stock cards, per-location balances, movement drafts and
//! physical-inventory sub-drafts. No IO, no storage: callers hand in history and
//! persist whatever these functions return.

pub mod draft;
pub mod error;
pub mod history;
pub mod location;
pub mod reconcile;
pub mod record;
pub mod replay;
pub mod stock_card;
pub mod sub_draft;

pub use draft::{DraftLine, MovementDraft, MovementLine, MovementRequest, check_source_availability};
pub use error::{LedgerError, LedgerResult};
pub use history::StockCardHistory;
pub use location::{
    Location, LocationBalances, LocationCode, LocationEventExtension, LocationMovement, LocationRef,
    LocationSnapshot,
};
pub use reconcile::check_reconciliation;
pub use record::LedgerRecord;
pub use replay::{ReplayInput, ReplayKey, replay, replay_event, replay_movements};
pub use stock_card::{
    AdjustmentDirection, EntryKind, StockCard, StockCardKey, StockEvent, StockOnHandSnapshot,
    StockReason, calculate_stock_on_hand, running_balances, stock_on_hand_at,
};
pub use sub_draft::{
    OperateType, PhysicalInventory, PhysicalInventoryLine, PhysicalInventoryStatus,
    PhysicalInventorySubDraft, SubDraftStatus, check_partition, merge_submitted, next_sub_draft_number,
};
