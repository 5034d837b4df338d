use std::collections::HashMap;

use chrono::NaiveDate;
use uuid::Uuid;

use stockledger_events::Event;

use crate::location::{
    LocationBalances, LocationEventExtension, LocationMovement, LocationRef, LocationSnapshot,
};
use crate::replay::ReplayKey;
use crate::stock_card::{StockCard, StockEvent, StockOnHandSnapshot};

/// Everything the ledger holds for one stock card, as read in one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockCardHistory {
    pub card: StockCard,
    pub events: Vec<StockEvent>,
    pub movements: Vec<LocationMovement>,
    pub extensions: HashMap<Uuid, LocationRef>,
    pub stock_snapshots: Vec<StockOnHandSnapshot>,
    pub location_snapshots: Vec<LocationSnapshot>,
    /// Stream version: number of events plus movements appended so far.
    pub version: u64,
}

impl StockCardHistory {
    pub fn new(card: StockCard) -> Self {
        Self {
            card,
            events: Vec::new(),
            movements: Vec::new(),
            extensions: HashMap::new(),
            stock_snapshots: Vec::new(),
            location_snapshots: Vec::new(),
            version: 0,
        }
    }

    pub fn extension_map(&self) -> HashMap<Uuid, LocationRef> {
        self.extensions.clone()
    }

    pub fn add_extension(&mut self, extension: LocationEventExtension) {
        self.extensions
            .insert(extension.ledger_event_id, extension.location);
    }

    /// Latest business date of any recorded event or movement.
    pub fn last_date(&self) -> Option<NaiveDate> {
        let events = self.events.iter().map(|e| e.occurred_date);
        let movements = self.movements.iter().map(|m| m.occurred_date);
        events.chain(movements).max()
    }

    /// Timeline position of the newest recorded event or movement.
    pub fn last_key(&self) -> Option<ReplayKey> {
        let events = self.events.iter().map(|e| e.replay_key());
        let movements = self.movements.iter().map(|m| m.replay_key());
        events.chain(movements).max()
    }

    pub fn location_balances(&self) -> LocationBalances {
        LocationBalances::from_snapshots(&self.location_snapshots)
    }

    /// Current stock-card balance (latest snapshot, zero for an empty card).
    pub fn stock_on_hand(&self) -> i64 {
        self.stock_snapshots
            .iter()
            .max_by_key(|s| s.occurred_date)
            .map(|s| s.stock_on_hand)
            .unwrap_or(0)
    }
}
