use std::path::{Path, PathBuf};

use canopy::{
    AlertLedger, BaselineBuilder, BaselineStore, CanopyError, DetectionConfig, DetectionRequest, PipelineBuilder,
};
use clap::{Parser, Subcommand, ValueEnum};
use cli::{load_config, policy_mismatch, BaselineManifest, CliError, DetectionManifest, Manifest};
use color_eyre::eyre::Result;
use schemars::schema_for;
use tracing::{info, warn};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or extend) a baseline snapshot from historical index rasters
    BuildBaseline {
        /// Path to the TOML or JSON baseline manifest
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Detect vegetation loss in new scenes and append alerts to the ledger
    Detect {
        /// Path to the TOML or JSON detection manifest
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Print summary statistics for an alert GeoJSON file
    Summarize {
        /// Path to the alert GeoJSON
        #[arg(short, long)]
        alerts: PathBuf,
    },
    /// Print a JSON schema
    Schema {
        #[arg(value_enum, default_value = "config")]
        target: SchemaTarget,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemaTarget {
    Config,
    BaselineManifest,
    DetectionManifest,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::BuildBaseline { manifest } => build_baseline(manifest)?,
        Commands::Detect { manifest } => detect(manifest)?,
        Commands::Summarize { alerts } => summarize(alerts)?,
        Commands::Schema { target } => print_schema(*target)?,
    }

    Ok(())
}

fn build_baseline(manifest_path: &Path) -> Result<()> {
    let manifest = BaselineManifest::from_file(manifest_path)?;
    let config = load_config(manifest.config.as_deref())?;
    let corpus = manifest.load_corpus()?;
    info!("Loaded {} historical scenes", corpus.len());

    let grid = corpus
        .first()
        .map(|scene| scene.raster.grid().clone())
        .ok_or(CliError::EmptyCorpus)?;
    let mut builder = BaselineBuilder::new(grid).policy(config.history);
    let months = manifest.months()?;
    if !months.is_empty() {
        builder = builder.months(months);
    }
    let built = builder.build(&corpus)?;

    let store = match &manifest.extend {
        Some(existing) => {
            let mut store = BaselineStore::load(existing)?;
            store.absorb(&built.snapshot())?;
            info!("Extended baseline {} to version {}", existing, store.version());
            store
        }
        None => built,
    };

    store.save(&manifest.output)?;
    info!("✅ Baseline written to {}", manifest.output);
    Ok(())
}

fn detect(manifest_path: &Path) -> Result<()> {
    let manifest = DetectionManifest::from_file(manifest_path)?;
    let config = load_config(manifest.config.as_deref())?;
    let pipeline = PipelineBuilder::from_config(&config).build();
    info!("{}", pipeline.info());

    let store = BaselineStore::load(&manifest.baseline)?;
    let snapshot = store.snapshot();
    if let Some(mismatch) = policy_mismatch(config.history, snapshot.policy()) {
        warn!("History policy mismatch: {}", mismatch);
    }
    let period = manifest.period()?;
    let drought = manifest.drought_series();
    let scenes = manifest.load_scenes()?;

    let mut ledger = AlertLedger::load(&manifest.alerts)?;
    if ledger.crs().is_some_and(|crs| crs != snapshot.grid().crs) {
        warn!(
            "Ledger CRS {:?} differs from baseline CRS {}; rewriting with the baseline CRS",
            ledger.crs(),
            snapshot.grid().crs
        );
    }
    ledger.set_crs(snapshot.grid().crs.clone());

    // Run every scene before touching the ledger file so a failure leaves it unchanged
    let mut published = 0;
    let mut skipped = 0;
    for scene in scenes {
        let drought_state = drought.state_or_normal(scene.date);
        let request = DetectionRequest {
            scene,
            period,
            drought: drought_state,
        };
        let outcome = match pipeline.run(&snapshot, &request) {
            Ok(outcome) => outcome,
            Err(e @ CanopyError::InsufficientClearSky { .. }) => {
                warn!("Skipping scene {}: {}", request.scene.date, e);
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let fresh = ledger.record(outcome.alerts);
        info!(
            "{}: {} alerts ({} new), drought {}",
            request.scene.date,
            outcome.summary.total_alerts,
            fresh.len(),
            outcome.drought.severity
        );
        published += fresh.len();
    }

    ledger.save(&manifest.alerts)?;
    info!(
        "✅ {} new alerts, {} total in {} ({} cloudy scenes skipped)",
        published,
        ledger.len(),
        manifest.alerts,
        skipped
    );
    println!("{}", serde_json::to_string_pretty(&ledger.summary())?);
    Ok(())
}

fn summarize(alerts_path: &Path) -> Result<()> {
    let ledger = AlertLedger::load(alerts_path)?;
    if ledger.is_empty() {
        warn!("No alerts found in {}", alerts_path.display());
    }
    println!("{}", serde_json::to_string_pretty(&ledger.summary())?);
    Ok(())
}

fn print_schema(target: SchemaTarget) -> Result<()> {
    let schema = match target {
        SchemaTarget::Config => DetectionConfig::schema(),
        SchemaTarget::BaselineManifest => schema_for!(BaselineManifest),
        SchemaTarget::DetectionManifest => schema_for!(DetectionManifest),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
