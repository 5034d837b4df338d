//! Write paths and queries of the stock ledger.
//!
//! Every operation follows the same unit of work:
//!
//! ```text
//! read (store) -> decide (pure domain) -> plan derived rows -> commit(LedgerBatch)
//! ```
//!
//! Nothing is written until the whole request has been validated; a rejected
//! request leaves the store untouched.

#[cfg(test)]
pub(crate) mod fixtures;
pub mod movement_drafts;
pub mod refresh;
pub mod stock_cards;
pub mod stock_events;
pub mod sub_drafts;

use stockledger_core::{FacilityId, StockCardId};
use stockledger_stock::{LedgerError, LedgerResult, LocationRef, StockCardHistory};

use crate::config::LedgerConfig;
use crate::ledger_store::LedgerStore;
use crate::reference::ReferenceData;

pub use movement_drafts::MovementDraftManager;
pub use refresh::{RebuildReport, SnapshotRefresher};
pub use stock_cards::{StockCardLine, StockCardQueries, StockCardSummary};
pub use stock_events::{StockEventLine, StockEventProcessor, StockEventReceipt, StockEventRequest};
pub use sub_drafts::SubDraftPartitioner;

/// Collaborators shared by every service.
#[derive(Debug, Clone)]
pub struct LedgerContext<S, R> {
    pub store: S,
    pub reference: R,
    pub config: LedgerConfig,
}

impl<S, R> LedgerContext<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(store: S, reference: R, config: LedgerConfig) -> Self {
        Self {
            store,
            reference,
            config,
        }
    }

    /// Location for events recorded without one: the facility's own default,
    /// else the configured fallback.
    pub fn default_location(&self, facility_id: FacilityId) -> LedgerResult<LocationRef> {
        match self.reference.default_location(facility_id) {
            Some(location) => Ok(location.to_ref()),
            None => self.config.default_location(),
        }
    }

    pub(crate) fn history(&self, stock_card_id: StockCardId) -> LedgerResult<StockCardHistory> {
        self.store
            .history(stock_card_id)?
            .ok_or_else(|| LedgerError::StockCardNotFound(stock_card_id.to_string()))
    }
}
