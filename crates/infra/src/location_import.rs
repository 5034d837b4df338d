//! CSV import of facility storage locations.
//!
//! The whole file is validated before anything is written: a missing header,
//! a short row, an empty or repeated code fails the import with no locations
//! created.

use std::collections::{BTreeSet, HashMap};

use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;
use tracing::{info, instrument, warn};

use stockledger_core::FacilityId;
use stockledger_stock::{LedgerError, Location, LocationCode};

use crate::ledger_store::{LedgerBatch, LedgerStore};

/// Columns every import file carries, matched case-insensitively in any order.
pub const REQUIRED_HEADERS: [&str; 7] = [
    "locationCode",
    "area",
    "zone",
    "rack",
    "barcode",
    "bin",
    "level",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("missing required header(s): {}", .0.join(", "))]
    MissingHeaders(Vec<String>),

    #[error("line {line}: expected {expected} fields, found {found}")]
    ShortRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: location code is empty")]
    EmptyCode { line: u64 },

    #[error("line {line}: location code {code} appears more than once")]
    DuplicateCode { line: u64, code: String },

    #[error("location {0} is already registered at this facility")]
    AlreadyRegistered(String),

    #[error("malformed csv: {0}")]
    Csv(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<csv::Error> for ImportError {
    fn from(value: csv::Error) -> Self {
        ImportError::Csv(value.to_string())
    }
}

/// Parses an import file into locations of `facility_id`.
pub fn parse_locations(
    facility_id: FacilityId,
    csv_text: &str,
) -> Result<Vec<Location>, ImportError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let columns = header_columns(reader.headers()?)?;
    let expected = reader.headers()?.len();
    let field = |record: &StringRecord, name: &str| -> String {
        columns
            .get(name)
            .and_then(|idx| record.get(*idx))
            .unwrap_or_default()
            .to_string()
    };

    let mut seen = BTreeSet::new();
    let mut locations = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.len() < expected {
            return Err(ImportError::ShortRow {
                line,
                expected,
                found: record.len(),
            });
        }

        let raw_code = field(&record, "locationcode");
        let code = LocationCode::new(raw_code).map_err(|_| ImportError::EmptyCode { line })?;
        if !seen.insert(code.clone()) {
            return Err(ImportError::DuplicateCode {
                line,
                code: code.to_string(),
            });
        }

        locations.push(Location {
            facility_id,
            code,
            area: field(&record, "area"),
            zone: field(&record, "zone"),
            rack: field(&record, "rack"),
            barcode: field(&record, "barcode"),
            bin: field(&record, "bin"),
            level: field(&record, "level"),
        });
    }
    Ok(locations)
}

/// Column index of every required header, keyed by its lowercase name.
fn header_columns(headers: &StringRecord) -> Result<HashMap<String, usize>, ImportError> {
    let present: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim().to_lowercase(), idx))
        .collect();

    let missing: Vec<String> = REQUIRED_HEADERS
        .iter()
        .filter(|h| !present.contains_key(&h.to_lowercase()))
        .map(|h| h.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingHeaders(missing));
    }
    Ok(present)
}

/// Registers the locations of an import file in one commit.
#[derive(Debug, Clone)]
pub struct LocationImporter<S> {
    store: S,
}

impl<S> LocationImporter<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self, csv_text), fields(facility_id = %facility_id), err)]
    pub fn import(
        &self,
        facility_id: FacilityId,
        csv_text: &str,
    ) -> Result<Vec<Location>, ImportError> {
        let locations = parse_locations(facility_id, csv_text)
            .inspect_err(|e| warn!(error = %e, "rejected location import"))?;

        let registered: BTreeSet<LocationCode> = self
            .store
            .locations(facility_id)
            .map_err(LedgerError::from)?
            .into_iter()
            .map(|l| l.code)
            .collect();
        if let Some(taken) = locations.iter().find(|l| registered.contains(&l.code)) {
            return Err(ImportError::AlreadyRegistered(taken.code.to_string()));
        }

        let mut batch = LedgerBatch::new();
        batch.locations = locations.clone();
        self.store.commit(batch).map_err(LedgerError::from)?;

        info!(locations = locations.len(), "imported locations");
        Ok(locations)
    }
}
