//! Keeps the derived snapshot series of a stock card in step with its stream.
//!
//! Write paths call [`plan_card`] with the entries they are about to append.
//! When the new entries land after everything already recorded, only the new
//! location rows are replayed on top of the latest stored balances; otherwise
//! the card is replayed from empty state. Either way the stock-card series is
//! recomputed in full and the reconciliation guard runs before anything is
//! committed.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use stockledger_core::{ExpectedVersion, FacilityId, StockCardId};
use stockledger_events::Event;
use stockledger_stock::{
    LedgerResult, LocationEventExtension, LocationMovement, LocationRef,
    LocationSnapshot, ReplayInput, StockCardHistory, StockEvent, StockOnHandSnapshot,
    calculate_stock_on_hand, check_reconciliation, replay, replay_event, replay_movements,
};

use crate::ledger_store::{LedgerBatch, LedgerStore, LocationRows, SnapshotWrite, StreamAppend};
use crate::reference::ReferenceData;

use super::LedgerContext;

/// Entries a request appends to one stock card.
#[derive(Debug, Clone)]
pub(crate) struct CardChanges {
    pub history: StockCardHistory,
    pub events: Vec<StockEvent>,
    pub movements: Vec<LocationMovement>,
    pub extensions: Vec<LocationEventExtension>,
}

impl CardChanges {
    pub fn new(history: StockCardHistory) -> Self {
        Self {
            history,
            events: Vec::new(),
            movements: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

/// Writes for one stock card, ready to go into a [`LedgerBatch`].
#[derive(Debug, Clone)]
pub(crate) struct CardPlan {
    pub append: StreamAppend,
    pub snapshots: SnapshotWrite,
    pub stock_on_hand: i64,
}

impl CardPlan {
    pub fn add_to(self, batch: &mut LedgerBatch) {
        batch.streams.push(self.append);
        batch.snapshots.push(self.snapshots);
    }
}

/// Validates `changes` against the card's history and derives its new rows.
pub(crate) fn plan_card(
    changes: CardChanges,
    default_location: &LocationRef,
) -> LedgerResult<CardPlan> {
    let CardChanges {
        history,
        events,
        movements,
        extensions,
    } = changes;
    let card_id = history.card.id;

    let mut merged = history.clone();
    merged.events.extend(events.iter().cloned());
    merged.movements.extend(movements.iter().cloned());
    for extension in &extensions {
        merged.add_extension(extension.clone());
    }

    let stock_rows = calculate_stock_on_hand(card_id, &merged.events)?;

    let locations = match fast_path(&history, &events, &movements) {
        FastPath::Event(event) => {
            let stock_on_hand = StockOnHandSnapshot {
                stock_card_id: card_id,
                occurred_date: event.occurred_date,
                stock_on_hand: stock_rows.last().map(|s| s.stock_on_hand).unwrap_or(0),
            };
            let latest = history.location_balances().latest();
            let extensions = merged.extension_map();
            LocationRows::Upsert(replay_event(ReplayInput {
                event,
                stock_on_hand: &stock_on_hand,
                movements: &merged.movements,
                reflected_through: history.last_key(),
                extensions: &extensions,
                latest: &latest,
                default_location,
            })?)
        }
        FastPath::Movements => {
            let latest = history.location_balances().latest();
            LocationRows::Upsert(replay_movements(card_id, &latest, &movements)?)
        }
        FastPath::None => LocationRows::Replace(replay(&merged, default_location)?),
    };

    let location_rows = match &locations {
        LocationRows::Upsert(rows) => merge_rows(&history.location_snapshots, rows),
        LocationRows::Replace(rows) => rows.clone(),
    };
    check_reconciliation(card_id, &stock_rows, &location_rows)?;

    debug!(
        stock_card_id = %card_id,
        stock_rows = stock_rows.len(),
        location_rows = match &locations {
            LocationRows::Upsert(rows) | LocationRows::Replace(rows) => rows.len(),
        },
        incremental = matches!(locations, LocationRows::Upsert(_)),
        "replayed stock card"
    );

    let stock_on_hand = stock_rows.last().map(|s| s.stock_on_hand).unwrap_or(0);
    let mut append = StreamAppend::new(card_id, ExpectedVersion::Exact(history.version));
    append.events = events;
    append.movements = movements;
    append.extensions = extensions;

    Ok(CardPlan {
        append,
        snapshots: SnapshotWrite {
            stock_card_id: card_id,
            stock_on_hand: stock_rows,
            locations,
        },
        stock_on_hand,
    })
}

enum FastPath<'a> {
    Event(&'a StockEvent),
    Movements,
    None,
}

/// Incremental replay is only equivalent to a full one when the new entries
/// sort after every recorded entry on the `(occurred_date, processed_at)`
/// timeline.
fn fast_path<'a>(
    history: &StockCardHistory,
    events: &'a [StockEvent],
    movements: &[LocationMovement],
) -> FastPath<'a> {
    let last = history.last_key();

    match (events, movements.is_empty()) {
        ([event], true) => {
            if last.is_none_or(|last| event.replay_key() > last) {
                FastPath::Event(event)
            } else {
                FastPath::None
            }
        }
        ([], false) => {
            let first = movements.iter().map(|m| m.replay_key()).min();
            let ordered = first.is_some_and(|first| last.is_none_or(|last| first > last));
            if ordered {
                FastPath::Movements
            } else {
                FastPath::None
            }
        }
        _ => FastPath::None,
    }
}

/// Stored rows overlaid with `incoming`, in `(date, location)` order.
fn merge_rows(stored: &[LocationSnapshot], incoming: &[LocationSnapshot]) -> Vec<LocationSnapshot> {
    let mut rows = BTreeMap::new();
    for row in stored.iter().chain(incoming) {
        rows.insert((row.occurred_date, row.location_code.clone()), row.clone());
    }
    rows.into_values().collect()
}

/// Outcome of recomputing one card's snapshots from its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub stock_card_id: StockCardId,
    pub stock_rows: usize,
    pub location_rows: usize,
    /// Whether the stored rows differed from the recomputed ones.
    pub changed: bool,
}

/// Recomputes derived snapshot series from the append-only streams.
#[derive(Debug, Clone)]
pub struct SnapshotRefresher<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> SnapshotRefresher<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    /// Replays one card from empty state and replaces its stored snapshots.
    #[instrument(skip(self), fields(stock_card_id = %stock_card_id), err)]
    pub fn rebuild_snapshots(&self, stock_card_id: StockCardId) -> LedgerResult<RebuildReport> {
        let history = self.ctx.history(stock_card_id)?;
        let default_location = self.ctx.default_location(history.card.facility_id)?;

        let stock_rows = calculate_stock_on_hand(stock_card_id, &history.events)?;
        let location_rows = replay(&history, &default_location)?;
        check_reconciliation(stock_card_id, &stock_rows, &location_rows)?;

        let changed = stock_rows != history.stock_snapshots
            || location_rows != history.location_snapshots;
        let report = RebuildReport {
            stock_card_id,
            stock_rows: stock_rows.len(),
            location_rows: location_rows.len(),
            changed,
        };

        // The empty append pins the stream version read above.
        let mut batch = LedgerBatch::new();
        batch.streams.push(StreamAppend::new(
            stock_card_id,
            ExpectedVersion::Exact(history.version),
        ));
        batch.snapshots.push(SnapshotWrite {
            stock_card_id,
            stock_on_hand: stock_rows,
            locations: LocationRows::Replace(location_rows),
        });
        self.ctx.store.commit(batch)?;

        if changed {
            info!(stock_card_id = %stock_card_id, "replaced drifted snapshots");
        }
        Ok(report)
    }

    /// Rebuilds every stock card of a facility.
    #[instrument(skip(self), fields(facility_id = %facility_id), err)]
    pub fn rebuild_facility(&self, facility_id: FacilityId) -> LedgerResult<Vec<RebuildReport>> {
        let cards = self.ctx.store.stock_cards(facility_id, None, None)?;
        let reports = cards
            .iter()
            .map(|card| self.rebuild_snapshots(card.id))
            .collect::<LedgerResult<Vec<_>>>()?;
        info!(
            facility_id = %facility_id,
            cards = reports.len(),
            changed = reports.iter().filter(|r| r.changed).count(),
            "rebuilt facility snapshots"
        );
        Ok(reports)
    }
}
