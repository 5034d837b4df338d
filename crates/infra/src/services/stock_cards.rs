//! Stock-card queries.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{FacilityId, OrderableId, ProgramId, StockCardId};
use stockledger_stock::{
    LedgerResult, LocationRef, LocationSnapshot, StockCard, StockCardHistory, StockReason,
    running_balances,
};

use crate::ledger_store::LedgerStore;
use crate::reference::{LotInfo, ProductInfo, ReferenceData};

use super::LedgerContext;

/// One stock-card event with the card balance right after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockCardLine {
    pub event_id: Uuid,
    pub occurred_date: NaiveDate,
    pub processed_at: DateTime<Utc>,
    pub reason: StockReason,
    pub quantity: i64,
    pub stock_on_hand: i64,
    pub location: LocationRef,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockCardSummary {
    pub card: StockCard,
    pub product: Option<ProductInfo>,
    pub lot: Option<LotInfo>,
    pub stock_on_hand: i64,
    /// Events in replay order.
    pub line_items: Vec<StockCardLine>,
    /// Latest balance of every location the card has touched.
    pub locations: Vec<LocationSnapshot>,
}

#[derive(Debug, Clone)]
pub struct StockCardQueries<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> StockCardQueries<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(stock_card_id = %id), err)]
    pub fn stock_card(&self, id: StockCardId) -> LedgerResult<StockCardSummary> {
        let history = self.ctx.history(id)?;
        self.summarize(history)
    }

    /// Every card of a product in one program at a facility (one per lot).
    #[instrument(skip(self), err)]
    pub fn stock_cards_by_product(
        &self,
        facility_id: FacilityId,
        program_id: ProgramId,
        orderable_id: OrderableId,
    ) -> LedgerResult<Vec<StockCardSummary>> {
        self.ctx
            .store
            .stock_cards(facility_id, Some(program_id), Some(orderable_id))?
            .into_iter()
            .map(|card| self.summarize(self.ctx.history(card.id)?))
            .collect()
    }

    fn summarize(&self, history: StockCardHistory) -> LedgerResult<StockCardSummary> {
        let default_location = self.ctx.default_location(history.card.facility_id)?;
        let line_items = running_balances(&history.events)?
            .into_iter()
            .map(|(event, balance)| StockCardLine {
                event_id: event.id,
                occurred_date: event.occurred_date,
                processed_at: event.processed_at,
                reason: event.reason.clone(),
                quantity: event.quantity,
                stock_on_hand: balance,
                location: history
                    .extensions
                    .get(&event.id)
                    .unwrap_or(&default_location)
                    .clone(),
                signature: event.signature.clone(),
            })
            .collect();

        let card = history.card;
        Ok(StockCardSummary {
            product: self.ctx.reference.product(card.orderable_id),
            lot: card.lot_id.and_then(|lot| self.ctx.reference.lot(lot)),
            stock_on_hand: history.stock_on_hand(),
            locations: history.location_balances().latest(),
            line_items,
            card,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fixtures::{Fixture, issue, receive};

    #[test]
    fn summary_carries_running_balance_and_locations() {
        let fx = Fixture::new();
        fx.record(receive(), 30, 5, "A-01");
        fx.record(receive(), 12, 4, "B-01");
        fx.record(issue(), 8, 2, "A-01");

        let queries = StockCardQueries::new(fx.ctx.clone());
        let summaries = queries
            .stock_cards_by_product(fx.facility_id, fx.program_id, fx.product)
            .unwrap();
        assert_eq!(summaries.len(), 1);

        let summary = queries.stock_card(summaries[0].card.id).unwrap();
        assert_eq!(summary.stock_on_hand, 34);
        assert_eq!(summary.product.as_ref().map(|p| p.code.as_str()), Some("C100"));
        assert_eq!(summary.lot.as_ref().map(|l| l.code.as_str()), Some("LOT-1"));

        let running: Vec<i64> = summary.line_items.iter().map(|l| l.stock_on_hand).collect();
        assert_eq!(running, vec![30, 42, 34]);
        assert_eq!(summary.line_items[2].location.code.as_str(), "A-01");

        let per_location: Vec<(&str, i64)> = summary
            .locations
            .iter()
            .map(|s| (s.location_code.as_str(), s.stock_on_hand))
            .collect();
        assert_eq!(per_location, vec![("A-01", 22), ("B-01", 12)]);
    }

    #[test]
    fn unknown_card_is_not_found() {
        let fx = Fixture::new();
        let queries = StockCardQueries::new(fx.ctx.clone());
        assert!(queries.stock_card(StockCardId::new()).unwrap_err().is_not_found());
    }
}
