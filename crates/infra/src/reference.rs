//! Read-only reference data the ledger consumes but does not own.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockledger_core::{FacilityId, LotId, OrderableId};
use stockledger_stock::Location;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub code: String,
    pub name: String,
    /// Kits carry no lots; their stock cards use `lot_id: None`.
    pub is_kit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotInfo {
    pub code: String,
    pub expiration_date: Option<NaiveDate>,
}

/// Product catalog, lot registry and facility catalog lookups.
pub trait ReferenceData: Send + Sync {
    fn product(&self, orderable_id: OrderableId) -> Option<ProductInfo>;

    fn lot(&self, lot_id: LotId) -> Option<LotInfo>;

    /// Location that receives events of a facility recorded without one.
    fn default_location(&self, facility_id: FacilityId) -> Option<Location>;
}

impl<S> ReferenceData for Arc<S>
where
    S: ReferenceData + ?Sized,
{
    fn product(&self, orderable_id: OrderableId) -> Option<ProductInfo> {
        (**self).product(orderable_id)
    }

    fn lot(&self, lot_id: LotId) -> Option<LotInfo> {
        (**self).lot(lot_id)
    }

    fn default_location(&self, facility_id: FacilityId) -> Option<Location> {
        (**self).default_location(facility_id)
    }
}

#[derive(Debug, Default)]
struct Catalog {
    products: HashMap<OrderableId, ProductInfo>,
    lots: HashMap<LotId, LotInfo>,
    default_locations: HashMap<FacilityId, Location>,
}

/// In-memory reference data for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReferenceData {
    inner: RwLock<Catalog>,
}

impl InMemoryReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, orderable_id: OrderableId, info: ProductInfo) {
        if let Ok(mut catalog) = self.inner.write() {
            catalog.products.insert(orderable_id, info);
        }
    }

    pub fn add_lot(&self, lot_id: LotId, info: LotInfo) {
        if let Ok(mut catalog) = self.inner.write() {
            catalog.lots.insert(lot_id, info);
        }
    }

    pub fn set_default_location(&self, location: Location) {
        if let Ok(mut catalog) = self.inner.write() {
            catalog.default_locations.insert(location.facility_id, location);
        }
    }
}

impl ReferenceData for InMemoryReferenceData {
    fn product(&self, orderable_id: OrderableId) -> Option<ProductInfo> {
        let catalog = self.inner.read().ok()?;
        catalog.products.get(&orderable_id).cloned()
    }

    fn lot(&self, lot_id: LotId) -> Option<LotInfo> {
        let catalog = self.inner.read().ok()?;
        catalog.lots.get(&lot_id).cloned()
    }

    fn default_location(&self, facility_id: FacilityId) -> Option<Location> {
        let catalog = self.inner.read().ok()?;
        catalog.default_locations.get(&facility_id).cloned()
    }
}
