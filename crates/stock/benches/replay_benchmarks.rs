use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use stockledger_core::{FacilityId, OrderableId, ProgramId, StockCardId, UserId};
use stockledger_stock::{
    LocationBalances, LocationMovement, LocationRef, ReplayInput, StockCard, StockCardHistory,
    StockCardKey, StockEvent, StockReason, calculate_stock_on_hand, replay, replay_event,
};

const LOCATIONS: [&str; 4] = ["A-01", "A-02", "B-01", "B-02"];

/// History of `len` days: a receipt per day at a rotating location, a transfer
/// every other day, an issue every fifth day.
fn history(len: usize) -> StockCardHistory {
    let card = StockCard::new(
        StockCardId::new(),
        StockCardKey {
            facility_id: FacilityId::new(),
            program_id: ProgramId::new(),
            orderable_id: OrderableId::new(),
            lot_id: None,
        },
    );
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    let location = |i: usize| LocationRef::new(LOCATIONS[i % LOCATIONS.len()], "Main").unwrap();

    let mut history = StockCardHistory::new(card);
    for day in 0..len {
        let date = start + Duration::days(day as i64);
        let at = Utc.timestamp_opt(1_577_836_800 + day as i64 * 10, 0).unwrap();

        let receipt = StockEvent::new(card.id, 20, StockReason::Receive { source: None }, date, at).unwrap();
        history.extensions.insert(receipt.id, location(day));
        history.events.push(receipt);

        if day % 5 == 4 {
            let issue = StockEvent::new(
                card.id,
                15,
                StockReason::Issue { destination: None },
                date,
                at + Duration::seconds(1),
            )
            .unwrap();
            history.extensions.insert(issue.id, location(day));
            history.events.push(issue);
        }

        if day % 2 == 1 {
            let movement = LocationMovement::new(
                card.id,
                5,
                date + Duration::days(1),
                at + Duration::seconds(2),
                Some(location(day)),
                Some(location(day + 1)),
                UserId::new(),
                None,
            )
            .unwrap();
            history.movements.push(movement);
        }
    }
    history
}

fn bench_full_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_replay");
    let default_location = LocationRef::new("UNALLOCATED", "Unallocated").unwrap();

    for days in [10usize, 100, 1000, 5000].iter() {
        let history = history(*days);
        group.throughput(Throughput::Elements(
            (history.events.len() + history.movements.len()) as u64,
        ));
        group.bench_with_input(BenchmarkId::from_parameter(days), &history, |b, history| {
            b.iter(|| replay(black_box(history), &default_location).unwrap());
        });
    }
    group.finish();
}

fn bench_incremental_vs_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_one_event");
    let default_location = LocationRef::new("UNALLOCATED", "Unallocated").unwrap();

    let mut history = history(1000);
    let rows = replay(&history, &default_location).unwrap();
    let latest = LocationBalances::from_snapshots(&rows).latest();
    let reflected_through = history.last_key();

    let date = history.last_date().unwrap() + Duration::days(1);
    let event = StockEvent::new(
        history.card.id,
        1,
        StockReason::Receive { source: None },
        date,
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    )
    .unwrap();
    history.events.push(event.clone());
    let stock = calculate_stock_on_hand(history.card.id, &history.events).unwrap();
    let stock_on_hand = stock.last().cloned().unwrap();
    let extensions = history.extension_map();

    group.bench_function("incremental", |b| {
        b.iter(|| {
            replay_event(ReplayInput {
                event: black_box(&event),
                stock_on_hand: &stock_on_hand,
                movements: &history.movements,
                reflected_through,
                extensions: &extensions,
                latest: &latest,
                default_location: &default_location,
            })
            .unwrap()
        });
    });

    group.bench_function("full", |b| {
        b.iter(|| replay(black_box(&history), &default_location).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_full_replay, bench_incremental_vs_full);
criterion_main!(benches);
