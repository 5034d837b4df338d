//! Operator commands against the Postgres ledger.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tracing::info;

use stockledger_core::FacilityId;
use stockledger_infra::services::SnapshotRefresher;
use stockledger_infra::{
    InMemoryReferenceData, LedgerConfig, LedgerContext, LocationImporter, PostgresLedgerStore,
};

#[derive(Debug, Parser)]
#[command(name = "stockledger-admin")]
#[command(about = "Maintenance commands for the stock ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the ledger tables if they do not exist.
    Migrate,
    /// Recompute every snapshot series of a facility from its stream.
    ///
    /// Events recorded without a location replay onto `--default-location`,
    /// so it must name the facility's catalogued default.
    RebuildSnapshots {
        #[arg(long = "facility")]
        facility_id: FacilityId,
        #[arg(long = "default-location")]
        default_location: String,
        #[arg(long = "default-area")]
        default_area: Option<String>,
    },
    /// Register the locations listed in a CSV file.
    ImportLocations {
        #[arg(long = "facility")]
        facility_id: FacilityId,
        #[arg(long = "file")]
        path: PathBuf,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::from_env();
    stockledger_observability::init(&config.logging);

    let Some(database_url) = config.database_url.clone() else {
        bail!("DATABASE_URL must be set");
    };
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresLedgerStore::new(pool));

    match cli.command {
        Command::Migrate => {
            store.apply_schema().await?;
            info!("ledger schema applied");
        }
        Command::RebuildSnapshots {
            facility_id,
            default_location,
            default_area,
        } => {
            let config = with_default_location(config, default_location, default_area);
            info!(
                facility_id = %facility_id,
                default_location = %config.default_location_code,
                "rebuilding snapshots"
            );
            let ctx = LedgerContext::new(store, Arc::new(InMemoryReferenceData::new()), config);
            let reports = SnapshotRefresher::new(ctx).rebuild_facility(facility_id)?;
            let repaired = reports.iter().filter(|r| r.changed).count();
            info!(cards = reports.len(), repaired, "snapshots rebuilt");
        }
        Command::ImportLocations { facility_id, path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let locations = LocationImporter::new(store).import(facility_id, &text)?;
            info!(count = locations.len(), "locations imported");
        }
    }
    Ok(())
}

/// No catalog is loaded here, so the replay default comes from the config.
fn with_default_location(
    mut config: LedgerConfig,
    code: String,
    area: Option<String>,
) -> LedgerConfig {
    config.default_location_code = code;
    if let Some(area) = area {
        config.default_area = area;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_requires_the_default_location() {
        let facility = FacilityId::new().to_string();
        let args = ["stockledger-admin", "rebuild-snapshots", "--facility", facility.as_str()];
        let err = Cli::try_parse_from(args).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn rebuild_default_location_reaches_the_config() {
        let facility = FacilityId::new().to_string();
        let cli = Cli::try_parse_from([
            "stockledger-admin",
            "rebuild-snapshots",
            "--facility",
            facility.as_str(),
            "--default-location",
            "RECEIVING",
            "--default-area",
            "Dock",
        ])
        .unwrap();
        let Command::RebuildSnapshots {
            default_location,
            default_area,
            ..
        } = cli.command
        else {
            panic!("expected rebuild-snapshots");
        };

        let config = with_default_location(LedgerConfig::default(), default_location, default_area);
        let location = config.default_location().unwrap();
        assert_eq!(location.code.as_str(), "RECEIVING");
        assert_eq!(location.area, "Dock");
    }
}
