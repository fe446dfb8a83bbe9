//! Run report
//!
//! The auditable record of one reconciliation run: every write with its
//! previous value, every skipped account and ticker, every warning.
//! Serialized as JSON for durable storage and rendered as a RunReport
//! worksheet appended to the output workbook.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::Result;
use crate::workbook::patch::{column_letters, SheetCell};

/// One materialized cell write. Only ever created for a (ticker, account)
/// pair that resolved to both an existing sheet and a header column.
#[derive(Debug, Clone, Serialize)]
pub struct WriteTarget {
    pub sheet_name: String,
    /// 1-based, as shown in the workbook.
    pub row: u32,
    pub column: u32,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Decimal,
}

impl WriteTarget {
    pub fn cell_ref(&self) -> String {
        format!("{}{}", column_letters(self.column), self.row)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportInputs {
    pub csv_key: String,
    pub template_key: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReportTotals {
    pub rows_read: usize,
    pub writes_made: usize,
}

/// Immutable once built; one per run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub inputs: ReportInputs,
    pub cost_mode: String,
    pub writes: Vec<WriteTarget>,
    pub skipped_accounts: BTreeSet<String>,
    pub skipped_tickers: BTreeSet<String>,
    pub warnings: Vec<String>,
    pub totals: ReportTotals,
}

impl RunReport {
    pub const SHEET_NAME: &'static str = "RunReport";
    /// Metadata block height; the write table scrolls beneath it.
    pub const FROZEN_ROWS: u32 = 8;

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Render the report as worksheet rows: metadata block, write table,
    /// then skip and warning sections.
    pub fn sheet_rows(&self) -> Vec<Vec<SheetCell>> {
        let text = |s: &str| SheetCell::Text(s.to_string());
        let num = |n: usize| SheetCell::Number(n.to_string());

        let mut rows = vec![
            vec![
                text("RunReport generated (UTC)"),
                text(&self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            ],
            vec![text("Run ID"), text(&self.run_id)],
            vec![text("Source CSV"), text(&self.inputs.csv_key)],
            vec![text("Template XLSX"), text(&self.inputs.template_key)],
            vec![text("Cost Mode"), text(&self.cost_mode)],
            vec![text("CSV Rows Read"), num(self.totals.rows_read)],
            vec![text("Writes Made"), num(self.totals.writes_made)],
            vec![],
            vec![
                text("Sheet"),
                text("Cell"),
                text("Previous"),
                text("Written"),
            ],
        ];

        for write in &self.writes {
            let previous = match &write.previous_value {
                None => String::new(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
            };
            rows.push(vec![
                text(&write.sheet_name),
                text(&write.cell_ref()),
                text(&previous),
                SheetCell::Number(write.new_value.to_string()),
            ]);
        }

        if !self.skipped_tickers.is_empty() {
            rows.push(vec![]);
            rows.push(vec![text("Skipped Tickers (no matching sheet)")]);
            for ticker in &self.skipped_tickers {
                rows.push(vec![text(ticker)]);
            }
        }

        if !self.skipped_accounts.is_empty() {
            rows.push(vec![]);
            rows.push(vec![text("Skipped Accounts (unmapped)")]);
            for account in &self.skipped_accounts {
                rows.push(vec![text(account)]);
            }
        }

        if !self.warnings.is_empty() {
            rows.push(vec![]);
            rows.push(vec![text("Warnings")]);
            for warning in &self.warnings {
                rows.push(vec![text(warning)]);
            }
        }

        rows
    }
}

/// Accumulates the pieces of a report as the run progresses.
pub struct RunReportBuilder {
    run_id: String,
    timestamp: DateTime<Utc>,
    inputs: ReportInputs,
    cost_mode: String,
    writes: Vec<WriteTarget>,
    skipped_accounts: BTreeSet<String>,
    skipped_tickers: BTreeSet<String>,
    warnings: Vec<String>,
    rows_read: usize,
}

impl RunReportBuilder {
    pub fn new(run_id: String, timestamp: DateTime<Utc>, inputs: ReportInputs) -> Self {
        Self {
            run_id,
            timestamp,
            inputs,
            cost_mode: String::new(),
            writes: Vec::new(),
            skipped_accounts: BTreeSet::new(),
            skipped_tickers: BTreeSet::new(),
            warnings: Vec::new(),
            rows_read: 0,
        }
    }

    pub fn cost_mode(mut self, mode: &str) -> Self {
        self.cost_mode = mode.to_string();
        self
    }

    pub fn writes(mut self, writes: Vec<WriteTarget>) -> Self {
        self.writes = writes;
        self
    }

    pub fn skipped_accounts(mut self, accounts: BTreeSet<String>) -> Self {
        self.skipped_accounts = accounts;
        self
    }

    pub fn skipped_tickers(mut self, tickers: BTreeSet<String>) -> Self {
        self.skipped_tickers = tickers;
        self
    }

    pub fn warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn rows_read(mut self, rows: usize) -> Self {
        self.rows_read = rows;
        self
    }

    pub fn build(self) -> RunReport {
        let totals = ReportTotals {
            rows_read: self.rows_read,
            writes_made: self.writes.len(),
        };
        RunReport {
            run_id: self.run_id,
            timestamp: self.timestamp,
            inputs: self.inputs,
            cost_mode: self.cost_mode,
            writes: self.writes,
            skipped_accounts: self.skipped_accounts,
            skipped_tickers: self.skipped_tickers,
            warnings: self.warnings,
            totals,
        }
    }
}
