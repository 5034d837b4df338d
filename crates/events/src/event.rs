use chrono::{DateTime, NaiveDate, Utc};

/// A ledger fact.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
///
/// Two clocks matter: the business date the stock actually moved
/// (`occurred_date`) and the instant the ledger recorded it (`processed_at`).
/// Replay orders by `(occurred_date, processed_at)`.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "stock.event.recorded").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Business date of the movement.
    fn occurred_date(&self) -> NaiveDate;

    /// When the ledger recorded the event.
    fn processed_at(&self) -> DateTime<Utc>;

    /// Chronological replay key.
    fn replay_key(&self) -> (NaiveDate, DateTime<Utc>) {
        (self.occurred_date(), self.processed_at())
    }
}
