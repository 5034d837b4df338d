use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use stockledger_core::{FacilityId, OrderableId, ProgramId, UserId};
use stockledger_infra::services::{StockEventLine, StockEventProcessor, StockEventRequest};
use stockledger_infra::{
    InMemoryLedgerStore, InMemoryReferenceData, LedgerConfig, LedgerContext, LedgerStore,
    ProductInfo,
};
use stockledger_infra::ledger_store::LedgerBatch;
use stockledger_stock::{Location, LocationCode, LocationRef, StockReason};

type Ctx = LedgerContext<Arc<InMemoryLedgerStore>, Arc<InMemoryReferenceData>>;

struct Setup {
    ctx: Ctx,
    facility_id: FacilityId,
    program_id: ProgramId,
    orderable_id: OrderableId,
    shelf: LocationRef,
}

fn setup() -> Setup {
    let store = Arc::new(InMemoryLedgerStore::new());
    let reference = Arc::new(InMemoryReferenceData::new());
    let facility_id = FacilityId::new();
    let orderable_id = OrderableId::new();
    reference.add_product(
        orderable_id,
        ProductInfo {
            code: "C100".to_string(),
            name: "Paracetamol 500mg".to_string(),
            is_kit: false,
        },
    );

    let mut batch = LedgerBatch::new();
    batch.locations.push(Location {
        facility_id,
        code: LocationCode::new("A-01").unwrap(),
        area: "Ambient".to_string(),
        zone: "Z1".to_string(),
        rack: "R1".to_string(),
        barcode: "0001".to_string(),
        bin: "B1".to_string(),
        level: "1".to_string(),
    });
    store.commit(batch).unwrap();

    Setup {
        ctx: LedgerContext::new(store, reference, LedgerConfig::default()),
        facility_id,
        program_id: ProgramId::new(),
        orderable_id,
        shelf: LocationRef::new("A-01", "Ambient").unwrap(),
    }
}

fn receipt(setup: &Setup, occurred_date: NaiveDate) -> StockEventRequest {
    StockEventRequest {
        facility_id: setup.facility_id,
        program_id: setup.program_id,
        actor_id: UserId::new(),
        signature: None,
        occurred_date,
        reason: StockReason::Receive { source: None },
        line_items: vec![StockEventLine {
            orderable_id: setup.orderable_id,
            lot_id: None,
            quantity: 5,
            location: Some(setup.shelf.clone()),
        }],
    }
}

/// Receipts recorded in date order take the incremental path; the same
/// receipts in reverse date order replay the whole card on every write.
fn bench_record(c: &mut Criterion) {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut group = c.benchmark_group("record_stock_event");

    for &n in &[50usize, 200] {
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("in_order", n), &n, |b, &n| {
            b.iter(|| {
                let setup = setup();
                let processor = StockEventProcessor::new(setup.ctx.clone());
                for day in 0..n {
                    let date = start + Duration::days(day as i64);
                    black_box(processor.record(receipt(&setup, date)).unwrap());
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("backdated", n), &n, |b, &n| {
            b.iter(|| {
                let setup = setup();
                let processor = StockEventProcessor::new(setup.ctx.clone());
                for day in (0..n).rev() {
                    let date = start + Duration::days(day as i64);
                    black_box(processor.record(receipt(&setup, date)).unwrap());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_record);
criterion_main!(benches);
