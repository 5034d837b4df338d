//! Movement Draft Manager: staging and committing location transfers.
//!
//! A draft is exclusive per `(program, facility)`. Committing a request
//! consumes the scope's draft in the same batch that appends the movements, so
//! of two racing commits only the first finds the draft.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, instrument, warn};

use stockledger_core::{ExpectedVersion, FacilityId, MovementDraftId, ProgramId, StockCardId, UserId};
use stockledger_stock::{
    DraftLine, LedgerError, LedgerResult, LocationBalances, LocationMovement, LocationRef,
    MovementDraft, MovementLine, MovementRequest, StockCard, StockCardKey,
    check_source_availability,
};

use crate::ledger_store::{DraftWrite, LedgerBatch, LedgerStore};
use crate::reference::ReferenceData;

use super::refresh::{CardChanges, plan_card};
use super::LedgerContext;

#[derive(Debug, Clone)]
pub struct MovementDraftManager<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> MovementDraftManager<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(program_id = %program_id, facility_id = %facility_id), err)]
    pub fn create_empty_draft(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
        actor_id: UserId,
    ) -> LedgerResult<MovementDraft> {
        if self.ctx.store.draft_for_scope(program_id, facility_id)?.is_some() {
            warn!("movement draft already outstanding for scope");
            return Err(LedgerError::DraftAlreadyExists {
                program_id,
                facility_id,
            });
        }

        let draft = MovementDraft::new_empty(program_id, facility_id, actor_id, Utc::now());
        let mut batch = LedgerBatch::new();
        batch.drafts.push(DraftWrite::Create(draft.clone()));
        self.ctx.store.commit(batch)?;

        info!(draft_id = %draft.id, "created movement draft");
        Ok(draft)
    }

    pub fn get_draft(&self, id: MovementDraftId) -> LedgerResult<MovementDraft> {
        self.ctx
            .store
            .draft(id)?
            .ok_or(LedgerError::DraftIdNotFound(id))
    }

    /// The outstanding draft of a scope.
    pub fn find_draft(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> LedgerResult<MovementDraft> {
        self.ctx
            .store
            .draft_for_scope(program_id, facility_id)?
            .ok_or(LedgerError::MovementDraftNotFound {
                program_id,
                facility_id,
            })
    }

    /// Replaces the draft's lines, recording each source's current balance.
    #[instrument(skip(self, lines), fields(draft_id = %id, lines = lines.len()), err)]
    pub fn update_draft(
        &self,
        id: MovementDraftId,
        lines: Vec<MovementLine>,
    ) -> LedgerResult<MovementDraft> {
        let mut draft = self.get_draft(id)?;
        let expected_version = ExpectedVersion::from(&draft);

        let mut balances: BTreeMap<StockCardId, LocationBalances> = BTreeMap::new();
        let mut draft_lines = Vec::with_capacity(lines.len());
        for line in lines {
            line.validate()?;
            let card = self.resolve_card(draft.program_id, draft.facility_id, &line)?;
            if !balances.contains_key(&card.id) {
                let history = self.ctx.history(card.id)?;
                balances.insert(card.id, history.location_balances());
            }
            let stock_on_hand_at_creation = balances
                .get(&card.id)
                .map(|b| b.latest_balance(&line.src.code))
                .unwrap_or(0);
            draft_lines.push(DraftLine {
                movement: line,
                stock_on_hand_at_creation,
            });
        }

        draft.replace_lines(draft_lines)?;
        let mut batch = LedgerBatch::new();
        batch.drafts.push(DraftWrite::Update {
            draft: draft.clone(),
            expected_version,
        });
        self.ctx.store.commit(batch)?;
        Ok(draft)
    }

    /// Discards a draft that was never committed.
    #[instrument(skip(self), fields(draft_id = %id), err)]
    pub fn delete(&self, id: MovementDraftId) -> LedgerResult<()> {
        let draft = self.get_draft(id)?;
        let mut batch = LedgerBatch::new();
        batch.drafts.push(DraftWrite::Delete(draft));
        self.ctx.store.commit(batch)?;
        info!("deleted movement draft");
        Ok(())
    }

    /// Appends one two-sided movement per line and consumes the scope's draft.
    #[instrument(
        skip(self, request),
        fields(
            program_id = %request.program_id,
            facility_id = %request.facility_id,
            lines = request.line_items.len(),
        ),
        err
    )]
    pub fn commit(&self, request: MovementRequest) -> LedgerResult<Vec<LocationMovement>> {
        request
            .validate()
            .inspect_err(|e| warn!(error = %e, "rejected movement request"))?;

        let cards = request
            .line_items
            .iter()
            .map(|line| self.resolve_card(request.program_id, request.facility_id, line))
            .collect::<LedgerResult<Vec<_>>>()?;
        let draft = self.find_draft(request.program_id, request.facility_id)?;

        let default_location = self.ctx.default_location(request.facility_id)?;
        let mut endpoints = Vec::with_capacity(request.line_items.len());
        for line in &request.line_items {
            let src = self.resolve_location(request.facility_id, &line.src, &default_location)?;
            let dest = self.resolve_location(request.facility_id, &line.dest, &default_location)?;
            endpoints.push((src, dest));
        }

        let mut changes: BTreeMap<StockCardId, CardChanges> = BTreeMap::new();
        for card in &cards {
            if !changes.contains_key(&card.id) {
                changes.insert(card.id, CardChanges::new(self.ctx.history(card.id)?));
            }
        }

        let balances: BTreeMap<StockCardId, LocationBalances> = changes
            .iter()
            .map(|(id, c)| (*id, c.history.location_balances()))
            .collect();
        let requested: Vec<(StockCardId, &MovementLine)> = cards
            .iter()
            .map(|c| c.id)
            .zip(request.line_items.iter())
            .collect();
        check_source_availability(&requested, |card, code| {
            balances.get(&card).map(|b| b.latest_balance(code)).unwrap_or(0)
        })
        .inspect_err(|e| warn!(error = %e, "rejected movement request"))?;

        let processed_at = Utc::now();
        let mut committed = Vec::with_capacity(request.line_items.len());
        for ((card, line), (src, dest)) in cards.iter().zip(&request.line_items).zip(endpoints) {
            let movement = LocationMovement::new(
                card.id,
                line.quantity,
                request.occurred_date,
                processed_at,
                Some(src),
                Some(dest),
                request.actor_id,
                request.signature.clone(),
            )?;
            committed.push(movement.clone());
            if let Some(card_changes) = changes.get_mut(&card.id) {
                card_changes.movements.push(movement);
            }
        }

        let mut batch = LedgerBatch::new();
        for card_changes in changes.into_values() {
            plan_card(card_changes, &default_location)?.add_to(&mut batch);
        }
        batch.drafts.push(DraftWrite::Delete(draft));
        self.ctx.store.commit(batch)?;

        info!(movements = committed.len(), "committed movement draft");
        Ok(committed)
    }

    fn resolve_card(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
        line: &MovementLine,
    ) -> LedgerResult<StockCard> {
        let key = StockCardKey {
            facility_id,
            program_id,
            orderable_id: line.orderable_id,
            lot_id: line.lot_id,
        };
        self.ctx
            .store
            .find_stock_card(&key)?
            .ok_or_else(|| LedgerError::StockCardNotFound(key.to_string()))
    }

    /// Registered location (with its stored area), or the default location.
    fn resolve_location(
        &self,
        facility_id: FacilityId,
        location: &LocationRef,
        default_location: &LocationRef,
    ) -> LedgerResult<LocationRef> {
        if location.code == default_location.code {
            return Ok(default_location.clone());
        }
        self.ctx
            .store
            .location(facility_id, &location.code)?
            .map(|registered| registered.to_ref())
            .ok_or_else(|| LedgerError::LocationNotFound(location.code.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::SnapshotRefresher;
    use crate::services::fixtures::{Fixture, days_ago_date, receive, shelf};

    fn transfer(fx: &Fixture, src: &str, dest: &str, quantity: i64) -> MovementLine {
        MovementLine {
            orderable_id: fx.product,
            lot_id: Some(fx.lot),
            src: shelf(src),
            dest: shelf(dest),
            quantity,
        }
    }

    fn request(fx: &Fixture, lines: Vec<MovementLine>) -> MovementRequest {
        MovementRequest {
            program_id: fx.program_id,
            facility_id: fx.facility_id,
            actor_id: fx.actor_id,
            signature: None,
            occurred_date: days_ago_date(0),
            line_items: lines,
        }
    }

    #[test]
    fn second_draft_for_a_scope_is_a_conflict_until_the_first_is_gone() {
        let fx = Fixture::new();
        let manager = MovementDraftManager::new(fx.ctx.clone());

        let first = manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();
        let err = manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap_err();
        assert!(matches!(err, LedgerError::DraftAlreadyExists { .. }));

        manager.delete(first.id).unwrap();
        assert!(manager.get_draft(first.id).unwrap_err().is_not_found());
        manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();
    }

    #[test]
    fn update_records_source_balance_at_creation() {
        let fx = Fixture::new();
        fx.record(receive(), 25, 2, "A-01");
        let manager = MovementDraftManager::new(fx.ctx.clone());
        let draft = manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();

        let updated = manager
            .update_draft(draft.id, vec![transfer(&fx, "A-01", "B-01", 10)])
            .unwrap();
        assert_eq!(updated.line_items[0].stock_on_hand_at_creation, 25);
        assert_eq!(updated.version, draft.version + 1);
        assert_eq!(manager.get_draft(draft.id).unwrap(), updated);

        let err = manager
            .update_draft(draft.id, vec![transfer(&fx, "A-01", "A-01", 1)])
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(_)));
    }

    #[test]
    fn commit_moves_stock_and_consumes_the_draft() {
        let fx = Fixture::new();
        fx.record(receive(), 25, 2, "A-01");
        let manager = MovementDraftManager::new(fx.ctx.clone());
        manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();

        let moved = manager
            .commit(request(&fx, vec![transfer(&fx, "A-01", "B-01", 10)]))
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(manager.find_draft(fx.program_id, fx.facility_id).is_err());

        let history = fx.store.history(moved[0].stock_card_id).unwrap().unwrap();
        let balances = history.location_balances();
        assert_eq!(balances.latest_balance(&shelf("A-01").code), 15);
        assert_eq!(balances.latest_balance(&shelf("B-01").code), 10);
        assert_eq!(history.stock_on_hand(), 25);

        let err = manager
            .commit(request(&fx, vec![transfer(&fx, "B-01", "A-01", 1)]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::MovementDraftNotFound { .. }));
    }

    #[test]
    fn transfer_on_the_day_of_the_receipt_is_accepted() {
        let fx = Fixture::new();
        fx.record(receive(), 25, 0, "A-01");
        let manager = MovementDraftManager::new(fx.ctx.clone());
        manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();

        let moved = manager
            .commit(request(&fx, vec![transfer(&fx, "A-01", "B-01", 10)]))
            .unwrap();

        let card_id = moved[0].stock_card_id;
        let history = fx.store.history(card_id).unwrap().unwrap();
        let balances = history.location_balances();
        assert_eq!(balances.latest_balance(&shelf("A-01").code), 15);
        assert_eq!(balances.latest_balance(&shelf("B-01").code), 10);

        let report = SnapshotRefresher::new(fx.ctx.clone())
            .rebuild_snapshots(card_id)
            .unwrap();
        assert!(!report.changed);
    }

    #[test]
    fn lines_sharing_a_source_are_checked_together() {
        let fx = Fixture::new();
        fx.record(receive(), 10, 2, "A-01");
        let manager = MovementDraftManager::new(fx.ctx.clone());
        manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();

        let err = manager
            .commit(request(
                &fx,
                vec![transfer(&fx, "A-01", "B-01", 6), transfer(&fx, "A-01", "A-02", 6)],
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::QuantityExceedsStockOnHand {
                requested: 12,
                available: 10,
                ..
            }
        ));
        assert!(manager.find_draft(fx.program_id, fx.facility_id).is_ok());
    }

    #[test]
    fn unknown_stock_card_and_location_are_not_found() {
        let fx = Fixture::new();
        let manager = MovementDraftManager::new(fx.ctx.clone());
        manager
            .create_empty_draft(fx.program_id, fx.facility_id, fx.actor_id)
            .unwrap();

        let err = manager
            .commit(request(&fx, vec![transfer(&fx, "A-01", "B-01", 1)]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::StockCardNotFound(_)));

        fx.record(receive(), 10, 2, "A-01");
        let err = manager
            .commit(request(&fx, vec![transfer(&fx, "A-01", "Q-42", 1)]))
            .unwrap_err();
        assert_eq!(err, LedgerError::LocationNotFound("Q-42".to_string()));
    }
}
