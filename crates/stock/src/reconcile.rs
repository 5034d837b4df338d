use std::collections::BTreeSet;

use stockledger_core::StockCardId;

use crate::error::{LedgerError, LedgerResult};
use crate::location::{LocationBalances, LocationSnapshot};
use crate::stock_card::{StockOnHandSnapshot, stock_on_hand_at};

/// Checks that summed carried-forward location balances equal the stock-card
/// balance on every date either series has a row.
///
/// Between rows both series are constant, so checking row dates covers every
/// instant.
pub fn check_reconciliation(
    stock_card_id: StockCardId,
    stock: &[StockOnHandSnapshot],
    locations: &[LocationSnapshot],
) -> LedgerResult<()> {
    let balances = LocationBalances::from_snapshots(locations);
    let dates: BTreeSet<_> = stock
        .iter()
        .map(|s| s.occurred_date)
        .chain(balances.dates())
        .collect();

    for date in dates {
        let stock_on_hand = stock_on_hand_at(stock, date);
        let location_total = balances.total_at(date);
        if stock_on_hand != location_total {
            return Err(LedgerError::ReconciliationMismatch {
                stock_card_id,
                occurred_date: date,
                stock_on_hand,
                location_total,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::location::LocationCode;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, d).unwrap()
    }

    #[test]
    fn detects_a_location_total_that_drifts() {
        let card = StockCardId::new();
        let stock = vec![
            StockOnHandSnapshot {
                stock_card_id: card,
                occurred_date: day(1),
                stock_on_hand: 10,
            },
            StockOnHandSnapshot {
                stock_card_id: card,
                occurred_date: day(3),
                stock_on_hand: 4,
            },
        ];
        let row = |code: &str, d: u32, soh: i64| LocationSnapshot {
            stock_card_id: card,
            location_code: LocationCode::new(code).unwrap(),
            occurred_date: day(d),
            stock_on_hand: soh,
            area: String::new(),
        };

        let balanced = vec![row("A", 1, 10), row("A", 2, 6), row("B", 2, 4), row("B", 3, 0), row("A", 3, 4)];
        assert!(check_reconciliation(card, &stock, &balanced).is_ok());

        let drifted = vec![row("A", 1, 10), row("A", 2, 6), row("B", 2, 4), row("A", 3, 4)];
        let err = check_reconciliation(card, &stock, &drifted).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ReconciliationMismatch { stock_on_hand: 4, location_total: 8, .. }
        ));
    }
}
