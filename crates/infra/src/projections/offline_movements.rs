//! Offline movement statement: a compact, period-grouped read model for
//! disconnected clients.
//!
//! Built on demand from the ledger and never written back. Location transfers
//! do not change product totals, so they only show up in the per-location
//! balances of [`LotStock`].

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use stockledger_core::{FacilityId, LotId, OrderableId, ProgramId};
use stockledger_stock::{
    AdjustmentDirection, LedgerResult, LocationSnapshot, StockCardHistory, StockReason,
    running_balances, stock_on_hand_at,
};

use crate::ledger_store::LedgerStore;
use crate::reference::ReferenceData;
use crate::services::LedgerContext;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Issue,
    Receive,
    Adjustment,
    PhysicalInventory,
}

impl From<&StockReason> for MovementType {
    fn from(reason: &StockReason) -> Self {
        match reason {
            StockReason::Receive { .. } => MovementType::Receive,
            StockReason::Issue { .. } => MovementType::Issue,
            StockReason::Adjustment { .. } => MovementType::Adjustment,
            StockReason::PhysicalInventory => MovementType::PhysicalInventory,
        }
    }
}

/// Replay position of a ledger event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    pub occurred_date: NaiveDate,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementDetail {
    /// Signed change of stock on hand; a physical count contributes the
    /// difference to the balance it replaced.
    pub quantity: i64,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotMovement {
    pub lot_id: Option<LotId>,
    pub lot_code: Option<String>,
    pub movement_detail: MovementDetail,
    /// Lot balance after the movement.
    pub stock_on_hand: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMovement {
    pub orderable_id: OrderableId,
    pub product_code: String,
    pub event_time: EventTime,
    pub movement_detail: MovementDetail,
    pub lot_movements: Vec<LotMovement>,
    /// Product balance (all lots) after the movement.
    pub stock_on_hand: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotStock {
    /// `None` for kits.
    pub lot_id: Option<LotId>,
    pub lot_code: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub stock_on_hand: i64,
    /// Carried-forward balance per location.
    pub locations: Vec<LocationSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStock {
    pub orderable_id: OrderableId,
    pub product_code: String,
    pub is_kit: bool,
    pub stock_on_hand: i64,
    pub lots: Vec<LotStock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StocksOnHand {
    pub as_of: NaiveDate,
    pub products: Vec<ProductStock>,
}

/// Month of movements for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub orderable_id: OrderableId,
    pub product_code: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub opening: i64,
    pub received: i64,
    /// Positive quantity that left the product.
    pub issued: i64,
    /// Net signed adjustments.
    pub adjusted: i64,
    /// Net signed physical-count corrections.
    pub inventory: i64,
    pub closing: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatement {
    pub movements: Vec<ProductMovement>,
    pub stocks_on_hand: StocksOnHand,
    pub periods: Vec<PeriodSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineQuery {
    pub facility_id: FacilityId,
    pub program_id: Option<ProgramId>,
    pub orderable_id: Option<OrderableId>,
    /// Movements dated before this are left out (balances still count them).
    pub since: Option<NaiveDate>,
    pub as_of: NaiveDate,
}

/// One stock-card event seen from its product.
#[derive(Debug, Clone)]
struct Entry {
    time: EventTime,
    lot_id: Option<LotId>,
    detail: MovementDetail,
    lot_balance: i64,
}

#[derive(Debug, Clone)]
pub struct OfflineProjectionBuilder<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> OfflineProjectionBuilder<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, query), fields(facility_id = %query.facility_id, as_of = %query.as_of), err)]
    pub fn build(&self, query: &OfflineQuery) -> LedgerResult<OfflineStatement> {
        let cards = self
            .ctx
            .store
            .stock_cards(query.facility_id, query.program_id, query.orderable_id)?;

        let mut by_product: BTreeMap<OrderableId, Vec<StockCardHistory>> = BTreeMap::new();
        for card in cards {
            let history = self.ctx.history(card.id)?;
            by_product.entry(card.orderable_id).or_default().push(history);
        }

        let mut movements = Vec::new();
        let mut products = Vec::new();
        let mut periods = Vec::new();
        for (orderable_id, histories) in by_product {
            let product = self.ctx.reference.product(orderable_id);
            let product_code = product
                .as_ref()
                .map(|p| p.code.clone())
                .unwrap_or_else(|| orderable_id.to_string());

            let entries = product_entries(&histories, query.as_of)?;
            let product_movements = group_movements(&entries, orderable_id, &product_code, |lot| {
                self.lot_code(lot)
            });
            periods.extend(period_summaries(
                &entries,
                orderable_id,
                &product_code,
                query.since,
                query.as_of,
            ));
            movements.extend(
                product_movements
                    .into_iter()
                    .filter(|m| query.since.is_none_or(|s| m.event_time.occurred_date >= s)),
            );

            let lots: Vec<LotStock> = histories
                .iter()
                .map(|h| self.lot_stock(h, query.as_of))
                .collect();
            products.push(ProductStock {
                orderable_id,
                product_code,
                is_kit: product.is_some_and(|p| p.is_kit),
                stock_on_hand: lots.iter().map(|l| l.stock_on_hand).sum(),
                lots,
            });
        }
        movements.sort_by(|a, b| {
            (a.event_time, a.orderable_id).cmp(&(b.event_time, b.orderable_id))
        });

        debug!(
            movements = movements.len(),
            products = products.len(),
            periods = periods.len(),
            "built offline statement"
        );
        Ok(OfflineStatement {
            movements,
            stocks_on_hand: StocksOnHand {
                as_of: query.as_of,
                products,
            },
            periods,
        })
    }

    fn lot_code(&self, lot_id: Option<LotId>) -> Option<String> {
        lot_id.and_then(|lot| self.ctx.reference.lot(lot)).map(|l| l.code)
    }

    fn lot_stock(&self, history: &StockCardHistory, as_of: NaiveDate) -> LotStock {
        let lot = history.card.lot_id.and_then(|lot| self.ctx.reference.lot(lot));
        LotStock {
            lot_id: history.card.lot_id,
            lot_code: lot.as_ref().map(|l| l.code.clone()),
            expiration_date: lot.and_then(|l| l.expiration_date),
            stock_on_hand: stock_on_hand_at(&history.stock_snapshots, as_of),
            locations: history.location_balances().as_of(as_of),
        }
    }
}

/// Every event up to `as_of` of one product's cards, in replay order.
fn product_entries(histories: &[StockCardHistory], as_of: NaiveDate) -> LedgerResult<Vec<Entry>> {
    let mut entries = Vec::new();
    for history in histories {
        let mut previous = 0;
        for (event, balance) in running_balances(&history.events)? {
            if event.occurred_date > as_of {
                break;
            }
            entries.push(Entry {
                time: EventTime {
                    occurred_date: event.occurred_date,
                    processed_at: event.processed_at,
                },
                lot_id: history.card.lot_id,
                detail: MovementDetail {
                    quantity: balance - previous,
                    movement_type: MovementType::from(&event.reason),
                    reason: reason_text(&event.reason),
                },
                lot_balance: balance,
            });
            previous = balance;
        }
    }
    entries.sort_by_key(|e| (e.time, e.lot_id));
    Ok(entries)
}

fn reason_text(reason: &StockReason) -> Option<String> {
    match reason {
        StockReason::Adjustment { direction, reason } => {
            let direction = match direction {
                AdjustmentDirection::Increase => "increase",
                AdjustmentDirection::Decrease => "decrease",
            };
            Some(format!("{direction}: {reason}"))
        }
        other => other.detail().map(str::to_string),
    }
}

/// One [`ProductMovement`] per distinct event time.
fn group_movements<F>(
    entries: &[Entry],
    orderable_id: OrderableId,
    product_code: &str,
    lot_code: F,
) -> Vec<ProductMovement>
where
    F: Fn(Option<LotId>) -> Option<String>,
{
    let mut lot_balances: BTreeMap<Option<LotId>, i64> = BTreeMap::new();
    let mut out: Vec<ProductMovement> = Vec::new();

    for entry in entries {
        lot_balances.insert(entry.lot_id, entry.lot_balance);
        let total: i64 = lot_balances.values().sum();
        let lot_movement = LotMovement {
            lot_id: entry.lot_id,
            lot_code: lot_code(entry.lot_id),
            movement_detail: entry.detail.clone(),
            stock_on_hand: entry.lot_balance,
        };

        match out.last_mut() {
            Some(last) if last.event_time == entry.time => {
                last.movement_detail.quantity += entry.detail.quantity;
                last.lot_movements.push(lot_movement);
                last.stock_on_hand = total;
            }
            _ => out.push(ProductMovement {
                orderable_id,
                product_code: product_code.to_string(),
                event_time: entry.time,
                movement_detail: entry.detail.clone(),
                lot_movements: vec![lot_movement],
                stock_on_hand: total,
            }),
        }
    }
    out
}

/// Monthly summaries from the month of `since` (or the first event) through
/// the month of `as_of`.
fn period_summaries(
    entries: &[Entry],
    orderable_id: OrderableId,
    product_code: &str,
    since: Option<NaiveDate>,
    as_of: NaiveDate,
) -> Vec<PeriodSummary> {
    let Some(first) = since.or_else(|| entries.first().map(|e| e.time.occurred_date)) else {
        return Vec::new();
    };

    let mut lot_balances: BTreeMap<Option<LotId>, i64> = BTreeMap::new();
    let mut pending = entries.iter().peekable();
    let mut periods = Vec::new();
    let mut start = month_start(first);
    let last = month_start(as_of);

    while start <= last {
        let Some(next) = next_month(start) else {
            break;
        };
        while let Some(entry) = pending.next_if(|e| e.time.occurred_date < start) {
            lot_balances.insert(entry.lot_id, entry.lot_balance);
        }
        let opening: i64 = lot_balances.values().sum();

        let mut summary = PeriodSummary {
            orderable_id,
            product_code: product_code.to_string(),
            period_start: start,
            period_end: next.pred_opt().unwrap_or(start),
            opening,
            received: 0,
            issued: 0,
            adjusted: 0,
            inventory: 0,
            closing: opening,
        };
        while let Some(entry) = pending.next_if(|e| e.time.occurred_date < next) {
            lot_balances.insert(entry.lot_id, entry.lot_balance);
            let quantity = entry.detail.quantity;
            match entry.detail.movement_type {
                MovementType::Receive => summary.received += quantity,
                MovementType::Issue => summary.issued -= quantity,
                MovementType::Adjustment => summary.adjusted += quantity,
                MovementType::PhysicalInventory => summary.inventory += quantity,
            }
        }
        summary.closing = lot_balances.values().sum();
        periods.push(summary);
        start = next;
    }
    periods
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month(start: NaiveDate) -> Option<NaiveDate> {
    if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::LotId;

    use crate::reference::LotInfo;
    use crate::services::fixtures::{Fixture, days_ago_date, issue, receive};

    fn query(fx: &Fixture) -> OfflineQuery {
        OfflineQuery {
            facility_id: fx.facility_id,
            program_id: Some(fx.program_id),
            orderable_id: None,
            since: None,
            as_of: days_ago_date(0),
        }
    }

    #[test]
    fn empty_ledger_gives_an_empty_statement() {
        let fx = Fixture::new();
        let statement = OfflineProjectionBuilder::new(fx.ctx.clone())
            .build(&query(&fx))
            .unwrap();
        assert!(statement.movements.is_empty());
        assert!(statement.stocks_on_hand.products.is_empty());
        assert!(statement.periods.is_empty());
    }

    #[test]
    fn movements_are_signed_and_lots_grouped() {
        let fx = Fixture::new();
        let second_lot = LotId::new();
        fx.reference.add_lot(
            second_lot,
            LotInfo {
                code: "LOT-2".to_string(),
                expiration_date: None,
            },
        );

        fx.record(receive(), 50, 6, "A-01");
        fx.record_for(fx.product, Some(second_lot), receive(), 20, 6, "B-01");
        fx.record(issue(), 15, 4, "A-01");
        fx.record(StockReason::PhysicalInventory, 30, 2, "A-01");
        fx.record_for(fx.kit, None, receive(), 4, 3, "A-02");

        let statement = OfflineProjectionBuilder::new(fx.ctx.clone())
            .build(&query(&fx))
            .unwrap();

        let product: Vec<(i64, MovementType, i64)> = statement
            .movements
            .iter()
            .filter(|m| m.orderable_id == fx.product)
            .map(|m| (m.movement_detail.quantity, m.movement_detail.movement_type, m.stock_on_hand))
            .collect();
        assert_eq!(
            product,
            vec![
                (50, MovementType::Receive, 50),
                (20, MovementType::Receive, 70),
                (-15, MovementType::Issue, 55),
                (-5, MovementType::PhysicalInventory, 50),
            ]
        );

        let stocks = &statement.stocks_on_hand.products;
        let amoxicillin = stocks.iter().find(|p| p.orderable_id == fx.product).unwrap();
        assert_eq!(amoxicillin.stock_on_hand, 50);
        assert_eq!(amoxicillin.lots.len(), 2);
        let kit = stocks.iter().find(|p| p.orderable_id == fx.kit).unwrap();
        assert!(kit.is_kit);
        assert_eq!(kit.lots[0].lot_id, None);
        assert_eq!(kit.lots[0].stock_on_hand, 4);
        assert_eq!(kit.lots[0].locations[0].location_code.as_str(), "A-02");
    }

    #[test]
    fn since_trims_movements_but_not_balances() {
        let fx = Fixture::new();
        fx.record(receive(), 10, 9, "A-01");
        fx.record(issue(), 3, 1, "A-01");

        let mut q = query(&fx);
        q.since = Some(days_ago_date(5));
        let statement = OfflineProjectionBuilder::new(fx.ctx.clone()).build(&q).unwrap();

        assert_eq!(statement.movements.len(), 1);
        assert_eq!(statement.movements[0].movement_detail.quantity, -3);
        assert_eq!(statement.stocks_on_hand.products[0].stock_on_hand, 7);

        let first = &statement.periods[0];
        let last = statement.periods.last().unwrap();
        assert_eq!(last.closing, 7);
        for period in &statement.periods {
            assert_eq!(
                period.closing,
                period.opening + period.received - period.issued + period.adjusted + period.inventory
            );
        }
        assert!(first.period_start <= days_ago_date(5));
    }

    #[test]
    fn months_roll_over_the_year_end() {
        let december = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        assert_eq!(next_month(december), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(
            month_start(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
    }
}
