//! Configuration loading and representation.

use tracing::warn;

use stockledger_observability::{LogFormat, LoggingConfig};
use stockledger_stock::{LedgerResult, LocationRef};

pub const DEFAULT_MAX_SUB_DRAFTS: usize = 10;
pub const DEFAULT_LOCATION_CODE: &str = "UNALLOCATED";
pub const DEFAULT_AREA: &str = "Unallocated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Sub-draft cap per physical inventory.
    pub max_sub_drafts: usize,
    /// Fallback location when the facility catalog has none.
    pub default_location_code: String,
    pub default_area: String,
    pub database_url: Option<String>,
    pub logging: LoggingConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_sub_drafts: DEFAULT_MAX_SUB_DRAFTS,
            default_location_code: DEFAULT_LOCATION_CODE.to_string(),
            default_area: DEFAULT_AREA.to_string(),
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Invalid values are logged and
    /// replaced by their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("STOCKLEDGER_MAX_SUB_DRAFTS") {
            match raw.trim().parse::<usize>() {
                Ok(max) if max > 0 => config.max_sub_drafts = max,
                _ => warn!(
                    value = %raw,
                    "STOCKLEDGER_MAX_SUB_DRAFTS is not a positive integer; using {DEFAULT_MAX_SUB_DRAFTS}"
                ),
            }
        }

        if let Some(raw) = lookup("STOCKLEDGER_DEFAULT_LOCATION") {
            if raw.trim().is_empty() {
                warn!("STOCKLEDGER_DEFAULT_LOCATION is empty; using {DEFAULT_LOCATION_CODE}");
            } else {
                config.default_location_code = raw.trim().to_string();
            }
        }

        if let Some(raw) = lookup("STOCKLEDGER_DEFAULT_AREA") {
            config.default_area = raw.trim().to_string();
        }

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        if let Some(raw) = lookup("STOCKLEDGER_LOG_LEVEL") {
            if !raw.trim().is_empty() {
                config.logging.level = raw.trim().to_string();
            }
        }

        if let Some(raw) = lookup("STOCKLEDGER_LOG_FORMAT") {
            match raw.parse::<LogFormat>() {
                Ok(format) => config.logging.format = format,
                Err(e) => warn!("{e}; using json"),
            }
        }

        config
    }

    pub fn default_location(&self) -> LedgerResult<LocationRef> {
        Ok(LocationRef::new(
            self.default_location_code.as_str(),
            self.default_area.as_str(),
        )?)
    }
}
