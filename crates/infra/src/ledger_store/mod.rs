//! Ledger store boundary.
//!
//! One trait for every persisted table of the ledger, with an in-memory
//! implementation for tests/dev and a Postgres one for deployments.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PostgresLedgerStore, SCHEMA_SQL};
pub use r#trait::{
    DraftWrite, LedgerBatch, LedgerStore, LocationRows, SnapshotWrite, StoreError, StreamAppend,
};
