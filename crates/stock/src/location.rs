//! Storage locations inside a facility and location-granularity ledger facts.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DomainError, DomainResult, FacilityId, StockCardId, UserId};
use stockledger_events::Event;

/// Code addressing a storage compartment (unique per facility).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationCode(String);

impl LocationCode {
    pub fn new(code: impl Into<String>) -> DomainResult<Self> {
        let code = code.into().trim().to_string();
        if code.is_empty() {
            return Err(DomainError::validation("location code cannot be empty"));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LocationCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addressable storage compartment. Administered externally; the ledger only
/// references it by `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub facility_id: FacilityId,
    pub code: LocationCode,
    pub area: String,
    pub zone: String,
    pub rack: String,
    pub barcode: String,
    pub bin: String,
    pub level: String,
}

impl Location {
    pub fn to_ref(&self) -> LocationRef {
        LocationRef {
            code: self.code.clone(),
            area: self.area.clone(),
        }
    }
}

/// Location code plus the area it belongs to, as carried on movements and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationRef {
    pub code: LocationCode,
    pub area: String,
}

impl LocationRef {
    pub fn new(code: impl Into<String>, area: impl Into<String>) -> DomainResult<Self> {
        Ok(Self {
            code: LocationCode::new(code)?,
            area: area.into(),
        })
    }
}

/// Transfer of stock between two locations of one stock card (immutable).
///
/// One-sided movements (only `src` or only `dest`) move stock to or from the
/// facility's unallocated pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationMovement {
    pub id: Uuid,
    pub stock_card_id: StockCardId,
    pub quantity: i64,
    pub occurred_date: NaiveDate,
    pub processed_at: DateTime<Utc>,
    pub src: Option<LocationRef>,
    pub dest: Option<LocationRef>,
    pub actor_id: UserId,
    pub signature: Option<String>,
}

impl LocationMovement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stock_card_id: StockCardId,
        quantity: i64,
        occurred_date: NaiveDate,
        processed_at: DateTime<Utc>,
        src: Option<LocationRef>,
        dest: Option<LocationRef>,
        actor_id: UserId,
        signature: Option<String>,
    ) -> DomainResult<Self> {
        if quantity <= 0 {
            return Err(DomainError::invalid_quantity(quantity, "movement quantity must be positive"));
        }
        match (&src, &dest) {
            (None, None) => {
                return Err(DomainError::validation(
                    "movement needs a source or a destination location",
                ));
            }
            (Some(s), Some(d)) if s.code == d.code => {
                return Err(DomainError::validation(
                    "source and destination locations must differ",
                ));
            }
            _ => {}
        }
        Ok(Self {
            id: Uuid::now_v7(),
            stock_card_id,
            quantity,
            occurred_date,
            processed_at,
            src,
            dest,
            actor_id,
            signature,
        })
    }
}

impl Event for LocationMovement {
    fn event_type(&self) -> &'static str {
        "stock.location.moved"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_date(&self) -> NaiveDate {
        self.occurred_date
    }

    fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }
}

/// Attaches a location to a stock-card event that is not location-aware by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEventExtension {
    pub ledger_event_id: Uuid,
    pub location: LocationRef,
}

/// Memoized per-location balance on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub stock_card_id: StockCardId,
    pub location_code: LocationCode,
    pub occurred_date: NaiveDate,
    pub stock_on_hand: i64,
    pub area: String,
}

/// Carry-forward reader over a sparse location snapshot series.
///
/// A location without a row on some date is **not** zero on that date: its
/// balance is the latest row on or before it. Only a location that has never
/// had a row reads as absent.
#[derive(Debug, Clone, Default)]
pub struct LocationBalances {
    series: BTreeMap<LocationCode, BTreeMap<NaiveDate, LocationSnapshot>>,
}

impl LocationBalances {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a LocationSnapshot>) -> Self {
        let mut series: BTreeMap<LocationCode, BTreeMap<NaiveDate, LocationSnapshot>> =
            BTreeMap::new();
        for s in snapshots {
            series
                .entry(s.location_code.clone())
                .or_default()
                .insert(s.occurred_date, s.clone());
        }
        Self { series }
    }

    /// Latest row on or before `date` for one location.
    pub fn at(&self, code: &LocationCode, date: NaiveDate) -> Option<&LocationSnapshot> {
        self.series
            .get(code)
            .and_then(|rows| rows.range(..=date).next_back())
            .map(|(_, s)| s)
    }

    pub fn balance_at(&self, code: &LocationCode, date: NaiveDate) -> i64 {
        self.at(code, date).map(|s| s.stock_on_hand).unwrap_or(0)
    }

    /// Most recent row per location, regardless of date.
    pub fn latest(&self) -> Vec<LocationSnapshot> {
        self.series
            .values()
            .filter_map(|rows| rows.values().next_back().cloned())
            .collect()
    }

    pub fn latest_balance(&self, code: &LocationCode) -> i64 {
        self.series
            .get(code)
            .and_then(|rows| rows.values().next_back())
            .map(|s| s.stock_on_hand)
            .unwrap_or(0)
    }

    /// Carried-forward row per location as of `date`.
    pub fn as_of(&self, date: NaiveDate) -> Vec<LocationSnapshot> {
        self.series
            .keys()
            .filter_map(|code| self.at(code, date).cloned())
            .collect()
    }

    pub fn total_at(&self, date: NaiveDate) -> i64 {
        self.as_of(date).iter().map(|s| s.stock_on_hand).sum()
    }

    /// Every date on which some location has a row.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .series
            .values()
            .flat_map(|rows| rows.keys().copied())
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn row(card: StockCardId, code: &str, d: u32, soh: i64) -> LocationSnapshot {
        LocationSnapshot {
            stock_card_id: card,
            location_code: LocationCode::new(code).unwrap(),
            occurred_date: day(d),
            stock_on_hand: soh,
            area: "Main".into(),
        }
    }

    #[test]
    fn movement_requires_an_endpoint_and_distinct_locations() {
        let card = StockCardId::new();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = LocationRef::new("A-01", "Main").unwrap();

        let none = LocationMovement::new(card, 5, day(1), now, None, None, UserId::new(), None);
        assert!(none.is_err());

        let same = LocationMovement::new(
            card,
            5,
            day(1),
            now,
            Some(a.clone()),
            Some(a.clone()),
            UserId::new(),
            None,
        );
        assert!(same.is_err());

        let one_sided = LocationMovement::new(card, 5, day(1), now, None, Some(a), UserId::new(), None);
        assert!(one_sided.is_ok());
    }

    #[test]
    fn blank_location_code_is_rejected() {
        assert!(LocationCode::new("  ").is_err());
        assert_eq!(LocationCode::new(" B-2 ").unwrap().as_str(), "B-2");
    }

    #[test]
    fn missing_rows_carry_forward_instead_of_reading_zero() {
        let card = StockCardId::new();
        let rows = vec![row(card, "A", 1, 10), row(card, "B", 2, 5), row(card, "A", 4, 3)];
        let balances = LocationBalances::from_snapshots(&rows);
        let a = LocationCode::new("A").unwrap();

        assert_eq!(balances.balance_at(&a, day(3)), 10);
        assert_eq!(balances.balance_at(&a, day(4)), 3);
        assert!(balances.at(&a, NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()).is_none());
        assert_eq!(balances.total_at(day(3)), 15);
        assert_eq!(balances.total_at(day(5)), 8);
        assert_eq!(balances.dates(), vec![day(1), day(2), day(4)]);
    }
}
