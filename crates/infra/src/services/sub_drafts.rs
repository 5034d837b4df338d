//! Sub-Draft Partitioner: physical inventories counted in disjoint parts.
//!
//! Every sub-draft write also bumps the parent physical inventory's version
//! under an exact expectation, so two sibling updates cannot both pass the
//! partition check against the same stale view.

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use stockledger_core::{
    DomainError, ExpectedVersion, FacilityId, PhysicalInventoryId, ProgramId, SubDraftId, UserId,
};
use stockledger_stock::{
    LedgerError, LedgerResult, OperateType, PhysicalInventory, PhysicalInventoryLine,
    PhysicalInventorySubDraft, StockReason, check_partition, merge_submitted,
    next_sub_draft_number,
};

use crate::ledger_store::{LedgerBatch, LedgerStore};
use crate::reference::ReferenceData;

use super::stock_events::{StockEventLine, StockEventReceipt, StockEventRequest, stage};
use super::LedgerContext;

#[derive(Debug, Clone)]
pub struct SubDraftPartitioner<S, R> {
    ctx: LedgerContext<S, R>,
}

impl<S, R> SubDraftPartitioner<S, R>
where
    S: LedgerStore,
    R: ReferenceData,
{
    pub fn new(ctx: LedgerContext<S, R>) -> Self {
        Self { ctx }
    }

    /// Opens a physical inventory; one may be open per scope.
    #[instrument(skip(self), fields(program_id = %program_id, facility_id = %facility_id), err)]
    pub fn create_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> LedgerResult<PhysicalInventory> {
        if self
            .ctx
            .store
            .open_physical_inventory(program_id, facility_id)?
            .is_some()
        {
            warn!("physical inventory already open for scope");
            return Err(LedgerError::PhysicalInventoryAlreadyExists {
                program_id,
                facility_id,
            });
        }

        let inventory = PhysicalInventory::new(program_id, facility_id, Utc::now());
        let mut batch = LedgerBatch::new();
        batch
            .physical_inventories
            .push((inventory.clone(), ExpectedVersion::Any));
        self.ctx.store.commit(batch)?;

        info!(physical_inventory_id = %inventory.id, "opened physical inventory");
        Ok(inventory)
    }

    pub fn physical_inventory(&self, id: PhysicalInventoryId) -> LedgerResult<PhysicalInventory> {
        self.ctx
            .store
            .physical_inventory(id)?
            .ok_or(LedgerError::PhysicalInventoryNotFound(id))
    }

    #[instrument(skip(self), fields(physical_inventory_id = %physical_inventory_id), err)]
    pub fn create_sub_draft(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> LedgerResult<PhysicalInventorySubDraft> {
        let inventory = self.open_inventory(physical_inventory_id)?;
        let siblings = self.ctx.store.sub_drafts(physical_inventory_id)?;
        let number = next_sub_draft_number(&siblings, self.ctx.config.max_sub_drafts)
            .inspect_err(|e| warn!(error = %e, "rejected sub-draft creation"))?;

        let sub_draft = PhysicalInventorySubDraft::new(physical_inventory_id, number);
        let mut batch = LedgerBatch::new();
        batch
            .sub_drafts
            .push((sub_draft.clone(), ExpectedVersion::Any));
        batch.physical_inventories.push(touch(inventory));
        self.ctx.store.commit(batch)?;

        info!(sub_draft_id = %sub_draft.id, number, "created sub-draft");
        Ok(sub_draft)
    }

    /// Sub-drafts of a physical inventory, by number.
    pub fn sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> LedgerResult<Vec<PhysicalInventorySubDraft>> {
        self.physical_inventory(physical_inventory_id)?;
        Ok(self.ctx.store.sub_drafts(physical_inventory_id)?)
    }

    pub fn get_sub_draft(&self, id: SubDraftId) -> LedgerResult<PhysicalInventorySubDraft> {
        self.ctx
            .store
            .sub_draft(id)?
            .ok_or(LedgerError::SubDraftNotFound(id))
    }

    /// Saves or submits the lines of one sub-draft.
    #[instrument(skip(self, lines), fields(sub_draft_id = %id, ?operate, lines = lines.len()), err)]
    pub fn update_sub_draft(
        &self,
        id: SubDraftId,
        lines: Vec<PhysicalInventoryLine>,
        operate: OperateType,
        operator_id: UserId,
    ) -> LedgerResult<PhysicalInventorySubDraft> {
        let mut sub_draft = self.get_sub_draft(id)?;
        let inventory = self.open_inventory(sub_draft.physical_inventory_id)?;
        let siblings = self.ctx.store.sub_drafts(sub_draft.physical_inventory_id)?;

        sub_draft.ensure_operable()?;
        check_partition(id, &lines, &siblings)
            .inspect_err(|e| warn!(error = %e, "rejected sub-draft update"))?;
        let expected = ExpectedVersion::from(&sub_draft);
        sub_draft
            .apply_update(lines, operate, operator_id)
            .inspect_err(|e| warn!(error = %e, "rejected sub-draft update"))?;

        self.save(sub_draft.clone(), expected, inventory)?;
        info!(status = ?sub_draft.status, "updated sub-draft");
        Ok(sub_draft)
    }

    /// Empties a sub-draft, keeping its identity and number.
    #[instrument(skip(self), fields(sub_draft_id = %id), err)]
    pub fn clear(&self, id: SubDraftId) -> LedgerResult<PhysicalInventorySubDraft> {
        let mut sub_draft = self.get_sub_draft(id)?;
        let inventory = self.open_inventory(sub_draft.physical_inventory_id)?;
        let expected = ExpectedVersion::from(&sub_draft);
        sub_draft.clear()?;

        self.save(sub_draft.clone(), expected, inventory)?;
        Ok(sub_draft)
    }

    /// Records the merged count of every submitted sub-draft as one
    /// physical-inventory stock event document and closes the inventory.
    #[instrument(
        skip(self, signature),
        fields(physical_inventory_id = %physical_inventory_id, %occurred_date),
        err
    )]
    pub fn complete(
        &self,
        physical_inventory_id: PhysicalInventoryId,
        occurred_date: NaiveDate,
        actor_id: UserId,
        signature: Option<String>,
    ) -> LedgerResult<StockEventReceipt> {
        let mut inventory = self.open_inventory(physical_inventory_id)?;
        let sub_drafts = self.ctx.store.sub_drafts(physical_inventory_id)?;
        let merged = merge_submitted(&sub_drafts)
            .inspect_err(|e| warn!(error = %e, "rejected physical inventory completion"))?;

        let line_items = merged
            .into_iter()
            .map(|line| {
                let quantity = line.quantity.ok_or_else(|| {
                    DomainError::validation(format!(
                        "orderable {} has no counted quantity",
                        line.orderable_id
                    ))
                })?;
                Ok(StockEventLine {
                    orderable_id: line.orderable_id,
                    lot_id: line.lot_id,
                    quantity,
                    location: line.location,
                })
            })
            .collect::<LedgerResult<Vec<_>>>()?;

        let request = StockEventRequest {
            facility_id: inventory.facility_id,
            program_id: inventory.program_id,
            actor_id,
            signature,
            occurred_date,
            reason: StockReason::PhysicalInventory,
            line_items,
        };

        let mut batch = LedgerBatch::new();
        let receipt = stage(&self.ctx, &request, Utc::now(), &mut batch)?;
        let expected = ExpectedVersion::from(&inventory);
        inventory.complete(occurred_date)?;
        batch.physical_inventories.push((inventory, expected));
        self.ctx.store.commit(batch)?;

        info!(events = receipt.event_ids.len(), "completed physical inventory");
        Ok(receipt)
    }

    fn open_inventory(&self, id: PhysicalInventoryId) -> LedgerResult<PhysicalInventory> {
        let inventory = self.physical_inventory(id)?;
        if !inventory.is_draft() {
            return Err(DomainError::invariant(format!("physical inventory {id} is completed")).into());
        }
        Ok(inventory)
    }

    fn save(
        &self,
        sub_draft: PhysicalInventorySubDraft,
        expected: ExpectedVersion,
        inventory: PhysicalInventory,
    ) -> LedgerResult<()> {
        let mut batch = LedgerBatch::new();
        batch.sub_drafts.push((sub_draft, expected));
        batch.physical_inventories.push(touch(inventory));
        Ok(self.ctx.store.commit(batch)?)
    }
}

/// Next version of `inventory`, guarded by the one that was read.
fn touch(mut inventory: PhysicalInventory) -> (PhysicalInventory, ExpectedVersion) {
    let expected = ExpectedVersion::from(&inventory);
    inventory.version += 1;
    (inventory, expected)
}
