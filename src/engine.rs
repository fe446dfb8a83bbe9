//! Reconciliation engine
//!
//! Composes resolver, aggregator, template writer and report builder into
//! one synchronous run: Resolving -> Aggregating -> Writing -> Reporting.
//! A run is single-shot with no internal retries; fatal errors abort
//! before anything is persisted, so a failed run leaves storage exactly
//! as it found it.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{ReconcileError, Result};
use crate::mapping::{AccountNormalizer, MapMethod};
use crate::positions;
use crate::report::{ReportInputs, ReportTotals, RunReport, RunReportBuilder};
use crate::resolver::{self, ExplicitKeys, ResolvedInputs};
use crate::storage::{MappingStore, ObjectStore};
use crate::workbook;

/// Caller choices for one run; every field optional.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub csv_key: Option<String>,
    pub template_key: Option<String>,
    pub output_key: Option<String>,
    pub dataset_id: Option<String>,
}

/// What a successful run returns to the transport.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub output_key: String,
    pub report_key: String,
    pub totals: ReportTotals,
}

/// One override entry for the apply-mapping entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingEntry {
    pub raw_label: String,
    pub canonical_code: String,
}

pub struct ReconciliationEngine<'a> {
    config: EngineConfig,
    objects: &'a dyn ObjectStore,
    mappings: &'a dyn MappingStore,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        config: EngineConfig,
        objects: &'a dyn ObjectStore,
        mappings: &'a dyn MappingStore,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            objects,
            mappings,
        })
    }

    /// Run one reconciliation. Non-fatal problems (unmapped accounts,
    /// unmatched tickers, bad rows) land in the report; fatal ones abort
    /// with a typed error and persist nothing.
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let started = Utc::now();
        let run_id = format!("run-{}", started.format("%Y%m%d-%H%M%S"));
        info!("Starting reconciliation {}", run_id);

        // Resolving
        let resolved = self.resolve_inputs(request)?;
        let csv_bytes = self.must_get(&resolved.csv_key)?;
        let template_bytes = self.must_get(&resolved.template_key)?;

        // Aggregating
        let dataset_id = request
            .dataset_id
            .as_deref()
            .unwrap_or(&self.config.dataset_id);
        let overrides = self
            .mappings
            .load_all(dataset_id)
            .context("failed to load account overrides")?;
        info!(
            "Loaded {} overrides for dataset {:?}",
            overrides.len(),
            dataset_id
        );
        let normalizer = AccountNormalizer::new(&self.config, overrides);
        let aggregated = positions::aggregate(&csv_bytes, &normalizer, self.config.cost_mode)?;

        // Writing
        let outcome = workbook::write(&template_bytes, &aggregated.aggregates, &self.config)?;

        // Reporting
        let mut warnings = aggregated.warnings;
        for (ticker, code) in &outcome.unmatched_columns {
            warnings.push(format!(
                "sheet for {ticker}: no header column for account {code}"
            ));
        }
        let skipped_accounts: BTreeSet<String> = aggregated
            .mappings
            .iter()
            .filter(|m| m.method == MapMethod::Unmapped)
            .map(|m| m.raw_label.clone())
            .collect();

        let report = RunReportBuilder::new(
            run_id.clone(),
            started,
            ReportInputs {
                csv_key: resolved.csv_key.clone(),
                template_key: resolved.template_key.clone(),
            },
        )
        .cost_mode(self.config.cost_mode.as_str())
        .writes(outcome.writes)
        .skipped_accounts(skipped_accounts)
        .skipped_tickers(outcome.skipped_tickers)
        .warnings(warnings)
        .rows_read(aggregated.rows_read)
        .build();

        let final_bytes = workbook::patch::write_sheet(
            &outcome.workbook_bytes,
            RunReport::SHEET_NAME,
            &report.sheet_rows(),
            RunReport::FROZEN_ROWS,
        )?;

        // Nothing is persisted until both artifacts are ready
        let (output_key, report_key) = self.output_keys(request, started);
        self.objects
            .put(&report_key, &report.to_json()?)
            .context("failed to store run report")?;
        self.objects
            .put(&output_key, &final_bytes)
            .context("failed to store output workbook")?;

        info!(
            "{} done: {} writes, {} rows read, output {}",
            run_id, report.totals.writes_made, report.totals.rows_read, output_key
        );
        Ok(RunOutcome {
            output_key,
            report_key,
            totals: report.totals,
        })
    }

    /// Which keys a run with this request would read (scan only).
    pub fn resolve_inputs(&self, request: &RunRequest) -> Result<ResolvedInputs> {
        let listing = self
            .objects
            .list(&self.config.source_prefix)
            .context("failed to list source objects")?;
        resolver::resolve(
            &listing,
            &self.config,
            &ExplicitKeys {
                csv_key: request.csv_key.clone(),
                template_key: request.template_key.clone(),
            },
        )
    }

    /// Upsert override mappings for a dataset. Takes effect on the next
    /// run; never applied retroactively within a run.
    pub fn apply_mapping(&self, dataset_id: &str, entries: &[MappingEntry]) -> Result<usize> {
        for entry in entries {
            self.mappings
                .put(dataset_id, &entry.raw_label, &entry.canonical_code)
                .with_context(|| format!("failed to apply mapping for {:?}", entry.raw_label))?;
        }
        info!(
            "Applied {} mapping overrides to dataset {:?}",
            entries.len(),
            dataset_id
        );
        Ok(entries.len())
    }

    fn must_get(&self, key: &str) -> Result<Vec<u8>> {
        match self.objects.get(key)? {
            Some(bytes) => Ok(bytes),
            None => Err(anyhow!(ReconcileError::InputNotFound(format!(
                "object {key} does not exist"
            )))),
        }
    }

    fn output_keys(&self, request: &RunRequest, started: DateTime<Utc>) -> (String, String) {
        let ts = started.format("%Y%m%d-%H%M%S");
        let output_key = request.output_key.clone().unwrap_or_else(|| {
            format!(
                "{}portfolio-updated-{ts}.xlsx",
                join_prefix(&self.config.output_prefix)
            )
        });
        let report_key = format!(
            "{}reports/{ts}-report.json",
            join_prefix(&self.config.output_prefix)
        );
        (output_key, report_key)
    }
}

fn join_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
