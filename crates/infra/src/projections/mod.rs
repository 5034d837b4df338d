//! Read models built from the ledger.
//!
//! Projections only read: they are disposable and rebuildable from the
//! streams at any time.

pub mod offline_movements;

pub use offline_movements::{
    EventTime, LotMovement, LotStock, MovementDetail, MovementType, OfflineProjectionBuilder,
    OfflineQuery, OfflineStatement, PeriodSummary, ProductMovement, ProductStock, StocksOnHand,
};
