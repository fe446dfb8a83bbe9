mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use cli::{Cli, Commands};
use posrec::config::EngineConfig;
use posrec::engine::{MappingEntry, ReconciliationEngine, RunRequest};
use posrec::storage::{LocalDirStore, SqliteMappingStore};

fn main() -> Result<()> {
    // Initialize logging; stdout stays clean for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::from_env()?,
    };

    let default_dataset = config.dataset_id.clone();
    let objects = LocalDirStore::new(&cli.store_root);
    let mapping_db = cli
        .mapping_db
        .clone()
        .unwrap_or_else(|| cli.store_root.join(".posrec").join("mappings.db"));
    let mappings = SqliteMappingStore::open(mapping_db)?;
    let engine = ReconciliationEngine::new(config, &objects, &mappings)?;

    match cli.command {
        Commands::Run {
            csv_key,
            template_key,
            output_key,
            dataset_id,
        } => {
            let request = RunRequest {
                csv_key,
                template_key,
                output_key,
                dataset_id,
            };
            let outcome = engine.run(&request)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Output workbook: {}", outcome.output_key);
                println!("Run report:      {}", outcome.report_key);
                println!(
                    "Rows read: {}, writes made: {}",
                    outcome.totals.rows_read, outcome.totals.writes_made
                );
            }
            Ok(())
        }

        Commands::ApplyMapping {
            dataset_id,
            file,
            pairs,
        } => {
            let mut entries = Vec::new();
            if let Some(path) = file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {:?}", path))?;
                let from_file: Vec<MappingEntry> = serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse {:?}", path))?;
                entries.extend(from_file);
            }
            for pair in &pairs {
                let (raw, code) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected RAW=CODE, got {pair:?}"))?;
                entries.push(MappingEntry {
                    raw_label: raw.trim().to_string(),
                    canonical_code: code.trim().to_string(),
                });
            }
            if entries.is_empty() {
                return Err(anyhow!("no mappings given (use --file or RAW=CODE pairs)"));
            }

            let dataset = dataset_id.unwrap_or(default_dataset);
            let applied = engine.apply_mapping(&dataset, &entries)?;
            if cli.json {
                println!("{}", serde_json::json!({ "count_applied": applied }));
            } else {
                println!("Applied {applied} mapping(s) to dataset {dataset}");
            }
            Ok(())
        }

        Commands::Resolve => {
            let resolved = engine.resolve_inputs(&RunRequest::default())?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "csv_key": resolved.csv_key,
                        "template_key": resolved.template_key,
                    })
                );
            } else {
                println!("CSV:      {}", resolved.csv_key);
                println!("Template: {}", resolved.template_key);
            }
            Ok(())
        }
    }
}
