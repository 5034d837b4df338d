//! Shared setup for service tests.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};

use stockledger_core::{FacilityId, LotId, OrderableId, ProgramId, UserId};
use stockledger_stock::{Location, LocationCode, LocationRef, StockReason};

use crate::config::LedgerConfig;
use crate::ledger_store::{InMemoryLedgerStore, LedgerBatch, LedgerStore};
use crate::reference::{InMemoryReferenceData, LotInfo, ProductInfo};

use super::stock_events::{StockEventLine, StockEventProcessor, StockEventRequest};
use super::LedgerContext;

pub(crate) type TestContext = LedgerContext<Arc<InMemoryLedgerStore>, Arc<InMemoryReferenceData>>;

pub(crate) struct Fixture {
    pub ctx: TestContext,
    pub store: Arc<InMemoryLedgerStore>,
    pub reference: Arc<InMemoryReferenceData>,
    pub facility_id: FacilityId,
    pub program_id: ProgramId,
    pub actor_id: UserId,
    pub product: OrderableId,
    pub lot: LotId,
    pub kit: OrderableId,
}

impl Fixture {
    /// A facility with shelves `A-01`, `A-02`, `B-01`, one lotted product and one kit.
    pub fn new() -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let reference = Arc::new(InMemoryReferenceData::new());
        let facility_id = FacilityId::new();

        let product = OrderableId::new();
        reference.add_product(
            product,
            ProductInfo {
                code: "C100".to_string(),
                name: "Amoxicillin 250mg".to_string(),
                is_kit: false,
            },
        );
        let lot = LotId::new();
        reference.add_lot(
            lot,
            LotInfo {
                code: "LOT-1".to_string(),
                expiration_date: NaiveDate::from_ymd_opt(2030, 1, 31),
            },
        );
        let kit = OrderableId::new();
        reference.add_product(
            kit,
            ProductInfo {
                code: "K200".to_string(),
                name: "Delivery kit".to_string(),
                is_kit: true,
            },
        );

        let mut batch = LedgerBatch::new();
        for code in ["A-01", "A-02", "B-01"] {
            batch.locations.push(location(facility_id, code));
        }
        store.commit(batch).unwrap();

        let ctx = LedgerContext::new(store.clone(), reference.clone(), LedgerConfig::default());
        Self {
            ctx,
            store,
            reference,
            facility_id,
            program_id: ProgramId::new(),
            actor_id: UserId::new(),
            product,
            lot,
            kit,
        }
    }

    /// Records one stock event for `(product, lot)` at `code`.
    pub fn record(&self, reason: StockReason, quantity: i64, days_ago: i64, code: &str) {
        self.record_for(self.product, Some(self.lot), reason, quantity, days_ago, code);
    }

    pub fn record_for(
        &self,
        orderable_id: OrderableId,
        lot_id: Option<LotId>,
        reason: StockReason,
        quantity: i64,
        days_ago: i64,
        code: &str,
    ) {
        StockEventProcessor::new(self.ctx.clone())
            .record(StockEventRequest {
                facility_id: self.facility_id,
                program_id: self.program_id,
                actor_id: self.actor_id,
                signature: None,
                occurred_date: days_ago_date(days_ago),
                reason,
                line_items: vec![StockEventLine {
                    orderable_id,
                    lot_id,
                    quantity,
                    location: Some(shelf(code)),
                }],
            })
            .unwrap();
    }
}

pub(crate) fn location(facility_id: FacilityId, code: &str) -> Location {
    Location {
        facility_id,
        code: LocationCode::new(code).unwrap(),
        area: area_of(code).to_string(),
        zone: "Z1".to_string(),
        rack: "R1".to_string(),
        barcode: format!("BC-{code}"),
        bin: "B1".to_string(),
        level: "L1".to_string(),
    }
}

pub(crate) fn shelf(code: &str) -> LocationRef {
    LocationRef::new(code, area_of(code)).unwrap()
}

fn area_of(code: &str) -> &'static str {
    if code.starts_with('A') { "Ambient" } else { "Bulk" }
}

pub(crate) fn days_ago_date(days: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(days)
}

pub(crate) fn receive() -> StockReason {
    StockReason::Receive { source: None }
}

pub(crate) fn issue() -> StockReason {
    StockReason::Issue { destination: None }
}
