use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{
    DomainError, DomainResult, FacilityId, LotId, OrderableId, ProgramId, StockCardId, UserId,
};
use stockledger_events::Event;

use crate::error::{LedgerError, LedgerResult};

/// Natural key of a stock card. Lot-less products (kits) use `lot_id: None`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockCardKey {
    pub facility_id: FacilityId,
    pub program_id: ProgramId,
    pub orderable_id: OrderableId,
    pub lot_id: Option<LotId>,
}

impl core::fmt::Display for StockCardKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "facility={} program={} orderable={} lot={}",
            self.facility_id,
            self.program_id,
            self.orderable_id,
            self.lot_id.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string())
        )
    }
}

/// Identity of one trackable stock line. Immutable once created.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockCard {
    pub id: StockCardId,
    pub facility_id: FacilityId,
    pub program_id: ProgramId,
    pub orderable_id: OrderableId,
    pub lot_id: Option<LotId>,
}

impl StockCard {
    pub fn new(id: StockCardId, key: StockCardKey) -> Self {
        Self {
            id,
            facility_id: key.facility_id,
            program_id: key.program_id,
            orderable_id: key.orderable_id,
            lot_id: key.lot_id,
        }
    }

    pub fn key(&self) -> StockCardKey {
        StockCardKey {
            facility_id: self.facility_id,
            program_id: self.program_id,
            orderable_id: self.orderable_id,
            lot_id: self.lot_id,
        }
    }
}

/// Sign/semantics of a stock-card level event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Debit,
    Credit,
    PhysicalCount,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentDirection {
    Increase,
    Decrease,
}

/// Why stock changed. Closed set: adding a category is a compile-time decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockReason {
    Receive { source: Option<String> },
    Issue { destination: Option<String> },
    Adjustment {
        direction: AdjustmentDirection,
        reason: String,
    },
    PhysicalInventory,
}

impl StockReason {
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            StockReason::Receive { .. } => EntryKind::Credit,
            StockReason::Issue { .. } => EntryKind::Debit,
            StockReason::Adjustment {
                direction: AdjustmentDirection::Increase,
                ..
            } => EntryKind::Credit,
            StockReason::Adjustment {
                direction: AdjustmentDirection::Decrease,
                ..
            } => EntryKind::Debit,
            StockReason::PhysicalInventory => EntryKind::PhysicalCount,
        }
    }

    /// Counterparty or reason text, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            StockReason::Receive { source } => source.as_deref(),
            StockReason::Issue { destination } => destination.as_deref(),
            StockReason::Adjustment { reason, .. } => Some(reason.as_str()),
            StockReason::PhysicalInventory => None,
        }
    }
}

/// Stock-card granularity ledger event (immutable, appended).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEvent {
    pub id: Uuid,
    pub stock_card_id: StockCardId,
    /// Always non-negative; `reason` determines the sign.
    pub quantity: i64,
    pub reason: StockReason,
    pub occurred_date: NaiveDate,
    pub processed_at: DateTime<Utc>,
    pub actor_id: Option<UserId>,
    pub signature: Option<String>,
}

impl StockEvent {
    pub fn new(
        stock_card_id: StockCardId,
        quantity: i64,
        reason: StockReason,
        occurred_date: NaiveDate,
        processed_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity < 0 {
            return Err(DomainError::invalid_quantity(quantity, "stock event quantity cannot be negative"));
        }
        if let StockReason::Adjustment { reason, .. } = &reason {
            if reason.trim().is_empty() {
                return Err(DomainError::validation("adjustment reason cannot be empty"));
            }
        }
        Ok(Self {
            id: Uuid::now_v7(),
            stock_card_id,
            quantity,
            reason,
            occurred_date,
            processed_at,
            actor_id: None,
            signature: None,
        })
    }

    pub fn with_actor(mut self, actor_id: UserId, signature: Option<String>) -> Self {
        self.actor_id = Some(actor_id);
        self.signature = signature;
        self
    }

    pub fn kind(&self) -> EntryKind {
        self.reason.entry_kind()
    }

    /// Balance after applying this event to `balance`.
    ///
    /// Fails with [`DomainError::InvalidQuantity`] when the result leaves the
    /// `i64` range.
    pub fn apply_to(&self, balance: i64) -> DomainResult<i64> {
        let next = match self.kind() {
            EntryKind::Credit => balance.checked_add(self.quantity),
            EntryKind::Debit => balance.checked_sub(self.quantity),
            EntryKind::PhysicalCount => Some(self.quantity),
        };
        next.ok_or_else(|| DomainError::invalid_quantity(self.quantity, "balance overflows i64"))
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self.kind() {
            EntryKind::Credit => "stock.event.credited",
            EntryKind::Debit => "stock.event.debited",
            EntryKind::PhysicalCount => "stock.event.counted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_date(&self) -> NaiveDate {
        self.occurred_date
    }

    fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }
}

/// Memoized stock-card balance after every event up to and including `occurred_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOnHandSnapshot {
    pub stock_card_id: StockCardId,
    pub occurred_date: NaiveDate,
    pub stock_on_hand: i64,
}

/// Events in replay order paired with the running stock-card balance after each.
///
/// Fails on the first event that would take the balance below zero.
pub fn running_balances(events: &[StockEvent]) -> LedgerResult<Vec<(&StockEvent, i64)>> {
    let mut ordered: Vec<&StockEvent> = events.iter().collect();
    ordered.sort_by_key(|e| (e.replay_key(), e.id));

    let mut balance = 0i64;
    let mut out = Vec::with_capacity(ordered.len());
    for event in ordered {
        balance = event.apply_to(balance)?;
        if balance < 0 {
            return Err(LedgerError::NegativeStockOnHand {
                stock_card_id: event.stock_card_id,
                location_code: None,
                occurred_date: event.occurred_date,
                stock_on_hand: balance,
            });
        }
        out.push((event, balance));
    }
    Ok(out)
}

/// Stock-card snapshot series, one row per date (the last event of a date wins).
pub fn calculate_stock_on_hand(
    stock_card_id: StockCardId,
    events: &[StockEvent],
) -> LedgerResult<Vec<StockOnHandSnapshot>> {
    let mut rows: Vec<StockOnHandSnapshot> = Vec::new();
    for (event, balance) in running_balances(events)? {
        match rows.last_mut() {
            Some(last) if last.occurred_date == event.occurred_date => last.stock_on_hand = balance,
            _ => rows.push(StockOnHandSnapshot {
                stock_card_id,
                occurred_date: event.occurred_date,
                stock_on_hand: balance,
            }),
        }
    }
    Ok(rows)
}

/// Carried-forward stock on hand at `date`; zero before the first event.
pub fn stock_on_hand_at(snapshots: &[StockOnHandSnapshot], date: NaiveDate) -> i64 {
    snapshots
        .iter()
        .filter(|s| s.occurred_date <= date)
        .max_by_key(|s| s.occurred_date)
        .map(|s| s.stock_on_hand)
        .unwrap_or(0)
}
