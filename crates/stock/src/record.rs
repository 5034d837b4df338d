use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::StockCardId;
use stockledger_events::Event;

use crate::location::LocationMovement;
use crate::stock_card::StockEvent;

/// One entry of a stock-card stream: either granularity of ledger fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", content = "data", rename_all = "snake_case")]
pub enum LedgerRecord {
    Stock(StockEvent),
    Movement(LocationMovement),
}

impl LedgerRecord {
    pub fn stock_card_id(&self) -> StockCardId {
        match self {
            LedgerRecord::Stock(e) => e.stock_card_id,
            LedgerRecord::Movement(m) => m.stock_card_id,
        }
    }
}

impl Event for LedgerRecord {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerRecord::Stock(e) => e.event_type(),
            LedgerRecord::Movement(m) => m.event_type(),
        }
    }

    fn version(&self) -> u32 {
        match self {
            LedgerRecord::Stock(e) => Event::version(e),
            LedgerRecord::Movement(m) => Event::version(m),
        }
    }

    fn occurred_date(&self) -> NaiveDate {
        match self {
            LedgerRecord::Stock(e) => e.occurred_date,
            LedgerRecord::Movement(m) => m.occurred_date,
        }
    }

    fn processed_at(&self) -> DateTime<Utc> {
        match self {
            LedgerRecord::Stock(e) => e.processed_at,
            LedgerRecord::Movement(m) => m.processed_at,
        }
    }
}
