//! Stock event documents: receipts, issues, adjustments and physical counts.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stockledger_core::{DomainError, FacilityId, LotId, OrderableId, ProgramId, StockCardId, UserId};
use stockledger_stock::{
    LedgerError, LedgerResult, LocationEventExtension, LocationRef, StockCard, StockCardHistory,
    StockCardKey, StockEvent, StockReason,
};

use crate::ledger_store::{LedgerBatch, LedgerStore};
use crate::reference::ReferenceData;

use super::refresh::{CardChanges, plan_card};
use super::LedgerContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEventLine {
    pub orderable_id: OrderableId,
    /// `None` for kits and other lot-less products.
    pub lot_id: Option<LotId>,
    pub quantity: i64,
    /// Registered location of the facility; the default location when absent.
    pub location: Option<LocationRef>,
}

/// One stock event document. Every line shares the reason and dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEventRequest {
    pub facility_id: FacilityId,
    pub program_id: ProgramId,
    pub actor_id: UserId,
    pub signature: Option<String>,
    pub occurred_date: NaiveDate,
    pub reason: StockReason,
    pub line_items: Vec<StockEventLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockEventReceipt {
    pub processed_at: DateTime<Utc>,
    pub event_ids: Vec<Uuid>,
    pub stock_card_ids: Vec<StockCardId>,
}

/// Appends stock event documents to the ledger.
#[derive(Debug, Clone)]
pub struct StockEventProcessor<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> StockEventProcessor<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    #[instrument(
        skip(self, request),
        fields(
            facility_id = %request.facility_id,
            program_id = %request.program_id,
            lines = request.line_items.len(),
        ),
        err
    )]
    pub fn record(&self, request: StockEventRequest) -> LedgerResult<StockEventReceipt> {
        let mut batch = LedgerBatch::new();
        let receipt = stage(&self.ctx, &request, Utc::now(), &mut batch)?;
        self.ctx.store.commit(batch)?;

        info!(
            facility_id = %request.facility_id,
            events = receipt.event_ids.len(),
            "recorded stock events"
        );
        Ok(receipt)
    }
}

/// Validates `request` and adds its writes to `batch` without committing.
pub(crate) fn stage<S, R>(
    ctx: &LedgerContext<S, R>,
    request: &StockEventRequest,
    processed_at: DateTime<Utc>,
    batch: &mut LedgerBatch,
) -> LedgerResult<StockEventReceipt>
where
    S: LedgerStore,
    R: ReferenceData,
{
    validate(ctx, request).inspect_err(|e| warn!(error = %e, "rejected stock event"))?;
    let default_location = ctx.default_location(request.facility_id)?;

    let mut receipt = StockEventReceipt {
        processed_at,
        event_ids: Vec::with_capacity(request.line_items.len()),
        stock_card_ids: Vec::with_capacity(request.line_items.len()),
    };

    for line in &request.line_items {
        let history = resolve_card(ctx, request, line, batch)?;
        let location = match &line.location {
            Some(location) => ctx
                .store
                .location(request.facility_id, &location.code)?
                .map(|registered| registered.to_ref())
                .ok_or_else(|| LedgerError::LocationNotFound(location.code.to_string()))?,
            None => default_location.clone(),
        };

        let event = StockEvent::new(
            history.card.id,
            line.quantity,
            request.reason.clone(),
            request.occurred_date,
            processed_at,
        )?
        .with_actor(request.actor_id, request.signature.clone());

        receipt.event_ids.push(event.id);
        receipt.stock_card_ids.push(history.card.id);

        let mut changes = CardChanges::new(history);
        changes.extensions.push(LocationEventExtension {
            ledger_event_id: event.id,
            location,
        });
        changes.events.push(event);
        plan_card(changes, &default_location)?.add_to(batch);
    }
    Ok(receipt)
}

fn validate<S, R>(ctx: &LedgerContext<S, R>, request: &StockEventRequest) -> LedgerResult<()>
where
    S: LedgerStore,
    R: ReferenceData,
{
    if request.line_items.is_empty() {
        return Err(DomainError::validation("stock event has no line items").into());
    }

    let mut seen = BTreeSet::new();
    for line in &request.line_items {
        if !seen.insert((line.orderable_id, line.lot_id)) {
            return Err(DomainError::validation(format!(
                "orderable {} lot {:?} appears twice",
                line.orderable_id, line.lot_id
            ))
            .into());
        }

        let product = ctx.reference.product(line.orderable_id).ok_or_else(|| {
            DomainError::validation(format!("unknown orderable {}", line.orderable_id))
        })?;
        match line.lot_id {
            Some(_) if product.is_kit => {
                return Err(DomainError::validation(format!(
                    "kit {} cannot carry a lot",
                    product.code
                ))
                .into());
            }
            Some(lot_id) if ctx.reference.lot(lot_id).is_none() => {
                return Err(DomainError::validation(format!("unknown lot {lot_id}")).into());
            }
            _ => {}
        }
    }
    Ok(())
}

/// Stored history of the line's stock card, or a fresh card added to `batch`.
fn resolve_card<S, R>(
    ctx: &LedgerContext<S, R>,
    request: &StockEventRequest,
    line: &StockEventLine,
    batch: &mut LedgerBatch,
) -> LedgerResult<StockCardHistory>
where
    S: LedgerStore,
    R: ReferenceData,
{
    let key = StockCardKey {
        facility_id: request.facility_id,
        program_id: request.program_id,
        orderable_id: line.orderable_id,
        lot_id: line.lot_id,
    };
    match ctx.store.find_stock_card(&key)? {
        Some(card) => ctx.history(card.id),
        None => {
            let card = StockCard::new(StockCardId::new(), key);
            batch.stock_cards.push(card);
            Ok(StockCardHistory::new(card))
        }
    }
}
