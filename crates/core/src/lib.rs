//! `stockledger-core`: identifiers, errors and versioning shared by the ledger crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{ExpectedVersion, Versioned};
pub use error::{DomainError, DomainResult};
pub use id::{
    FacilityId, LotId, MovementDraftId, OrderableId, PhysicalInventoryId, ProgramId, StockCardId,
    SubDraftId, UserId,
};
