use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "posrec")]
#[command(
    version,
    about = "Reconcile brokerage positions CSV exports into a portfolio workbook"
)]
#[command(
    long_about = "Finds the newest positions CSV in the object store, maps account \
labels to canonical workbook columns, and writes aggregated quantity and cost \
figures into each ticker sheet of the template, producing an updated workbook \
and a machine-readable run report."
)]
pub struct Cli {
    /// Root directory of the filesystem object store
    #[arg(long = "store-root", global = true, default_value = ".")]
    pub store_root: PathBuf,

    /// Path of the SQLite mapping database (default: <store-root>/.posrec/mappings.db)
    #[arg(long = "mapping-db", global = true)]
    pub mapping_db: Option<PathBuf>,

    /// TOML config file (otherwise configuration comes from the environment)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Output results in JSON format
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one reconciliation (auto-detects input keys unless given)
    Run {
        /// Exact CSV key, skipping auto-detection
        #[arg(long = "csv-key")]
        csv_key: Option<String>,

        /// Exact template key, skipping auto-detection
        #[arg(long = "template-key")]
        template_key: Option<String>,

        /// Exact output key (default: timestamped under the output prefix)
        #[arg(long = "output-key")]
        output_key: Option<String>,

        /// Dataset the override table is scoped to
        #[arg(long = "dataset-id")]
        dataset_id: Option<String>,
    },

    /// Upsert account-label overrides into the durable mapping store
    ApplyMapping {
        /// Dataset the overrides are scoped to
        #[arg(long = "dataset-id")]
        dataset_id: Option<String>,

        /// JSON file with [{"raw_label": ..., "canonical_code": ...}]
        #[arg(long = "file")]
        file: Option<PathBuf>,

        /// Inline overrides as RAW=CODE pairs
        pairs: Vec<String>,
    },

    /// Show which input keys a run would pick, without running
    Resolve,
}
