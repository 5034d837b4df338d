//! Strongly-typed identifiers used across the ledger.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id($name, e.to_string()))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_id!(
    /// Facility owning stock cards and locations.
    FacilityId,
    "FacilityId"
);
uuid_id!(
    /// Program (supply chain) a stock card belongs to.
    ProgramId,
    "ProgramId"
);
uuid_id!(
    /// Orderable product in the external catalog.
    OrderableId,
    "OrderableId"
);
uuid_id!(LotId, "LotId");
uuid_id!(
    /// Ledger identity of one (facility, program, product, lot) line.
    StockCardId,
    "StockCardId"
);
uuid_id!(
    /// Actor identity used for signatures on recorded events.
    UserId,
    "UserId"
);
uuid_id!(MovementDraftId, "MovementDraftId");
uuid_id!(PhysicalInventoryId, "PhysicalInventoryId");
uuid_id!(SubDraftId, "SubDraftId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_display() {
        let id = StockCardId::new();
        let parsed: StockCardId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_failure_names_the_id_type() {
        let err = "not-a-uuid".parse::<FacilityId>().unwrap_err();
        match err {
            DomainError::InvalidId { kind, .. } => assert_eq!(kind, "FacilityId"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
