//! Infrastructure layer: ledger storage, write-path services, read models,
//! configuration.

pub mod config;
pub mod ledger_store;
pub mod location_import;
pub mod projections;
pub mod reference;
pub mod services;


pub use config::LedgerConfig;
pub use ledger_store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};
pub use location_import::{ImportError, LocationImporter};
pub use projections::OfflineProjectionBuilder;
pub use reference::{InMemoryReferenceData, LotInfo, ProductInfo, ReferenceData};
pub use services::LedgerContext;
