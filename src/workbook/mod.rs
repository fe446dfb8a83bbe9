//! Template workbook writing
//!
//! Locates each aggregate's target cells inside the template (sheet by
//! ticker symbol, column by canonical account code in the header row,
//! rows fixed by configuration) and produces updated workbook bytes.
//! Reading goes through calamine; writing is a targeted archive patch so
//! everything outside the addressed cells survives byte-for-byte.

pub mod patch;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use anyhow::anyhow;
use calamine::{Data, DataType, Range, Reader, Xlsx};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ReconcileError, Result};
use crate::mapping::normalize_label;
use crate::positions::AggregatePosition;
use crate::report::WriteTarget;
use patch::CellEdit;

/// Result of one template-writing pass.
#[derive(Debug)]
pub struct WriteOutcome {
    pub workbook_bytes: Vec<u8>,
    pub writes: Vec<WriteTarget>,
    /// Tickers with no matching sheet in the template.
    pub skipped_tickers: BTreeSet<String>,
    /// (ticker, canonical code) pairs whose sheet exists but whose header
    /// row has no column for the code.
    pub unmatched_columns: Vec<(String, String)>,
}

/// Ticker symbol a sheet name stands for: the leading token before any
/// space, parenthesis, dash or colon, upper-cased. "AVGO(AT1)" -> "AVGO".
pub fn sheet_symbol(name: &str) -> String {
    name.trim()
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | '-' | ':'))
        .next()
        .unwrap_or("")
        .to_uppercase()
}

/// Write every aggregate into its ticker sheet.
///
/// A missing sheet or header column is a recorded skip, never fatal; only
/// unreadable template bytes abort.
pub fn write(
    template_bytes: &[u8],
    aggregates: &[AggregatePosition],
    config: &EngineConfig,
) -> Result<WriteOutcome> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(template_bytes.to_vec())).map_err(|e| {
            anyhow!(ReconcileError::TemplateUnreadable(format!(
                "failed to open template workbook: {e}"
            )))
        })?;

    let sheet_names = workbook.sheet_names().to_vec();
    debug!("Template sheets: {:?}", sheet_names);

    // First sheet wins when two names reduce to the same symbol
    let mut sheet_by_symbol: BTreeMap<String, String> = BTreeMap::new();
    for name in &sheet_names {
        sheet_by_symbol
            .entry(sheet_symbol(name))
            .or_insert_with(|| name.clone());
    }

    let mut ranges: BTreeMap<String, Range<Data>> = BTreeMap::new();
    let mut writes = Vec::new();
    let mut skipped_tickers = BTreeSet::new();
    let mut unmatched_columns = Vec::new();

    for agg in aggregates {
        let sheet_name = match sheet_by_symbol.get(&agg.ticker) {
            Some(name) => name.clone(),
            None => {
                debug!("No sheet for ticker {}", agg.ticker);
                skipped_tickers.insert(agg.ticker.clone());
                continue;
            }
        };

        if !ranges.contains_key(&sheet_name) {
            let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
                anyhow!(ReconcileError::TemplateUnreadable(format!(
                    "failed to read sheet {sheet_name:?}: {e}"
                )))
            })?;
            ranges.insert(sheet_name.clone(), range);
        }
        let range = &ranges[&sheet_name];

        let column = match find_header_column(range, config.header_row, &agg.canonical_code) {
            Some(col) => col,
            None => {
                warn!(
                    "Sheet {:?} has no header column for account {:?}",
                    sheet_name, agg.canonical_code
                );
                unmatched_columns.push((agg.ticker.clone(), agg.canonical_code.clone()));
                continue;
            }
        };

        writes.push(WriteTarget {
            sheet_name: sheet_name.clone(),
            row: config.quantity_row,
            column,
            previous_value: cell_value(range, config.quantity_row, column),
            new_value: agg.quantity,
        });
        writes.push(WriteTarget {
            sheet_name: sheet_name.clone(),
            row: config.cost_row,
            column,
            previous_value: cell_value(range, config.cost_row, column),
            new_value: agg.cost_basis,
        });
    }

    let edits: Vec<CellEdit> = writes
        .iter()
        .map(|w| CellEdit {
            sheet_name: w.sheet_name.clone(),
            row: w.row,
            column: w.column,
            value: w.new_value.to_string(),
        })
        .collect();

    let workbook_bytes = patch::patch_cells(template_bytes, &edits)?;

    info!(
        "Wrote {} cells across {} aggregates ({} tickers without sheets, {} unmatched columns)",
        writes.len(),
        aggregates.len(),
        skipped_tickers.len(),
        unmatched_columns.len()
    );

    Ok(WriteOutcome {
        workbook_bytes,
        writes,
        skipped_tickers,
        unmatched_columns,
    })
}

/// Scan the header row from column B onward for a cell whose normalized
/// text equals the normalized canonical code. Returns a 1-based column.
fn find_header_column(range: &Range<Data>, header_row: u32, canonical_code: &str) -> Option<u32> {
    let wanted = normalize_label(canonical_code);
    let row_idx = header_row - 1;
    let end_col = range.end().map(|(_, c)| c)?;

    // Column A holds row labels on the ticker sheets, so headers start at B
    for col_idx in 1..=end_col {
        if let Some(cell) = range.get_value((row_idx, col_idx)) {
            if let Some(text) = cell.get_string() {
                if normalize_label(text) == wanted {
                    return Some(col_idx + 1);
                }
            }
        }
    }
    None
}

fn cell_value(range: &Range<Data>, row: u32, column: u32) -> Option<serde_json::Value> {
    let data = range.get_value((row - 1, column - 1))?;
    match data {
        Data::Empty => None,
        Data::String(s) => Some(serde_json::json!(s)),
        Data::Float(f) => Some(serde_json::json!(f)),
        Data::Int(i) => Some(serde_json::json!(i)),
        Data::Bool(b) => Some(serde_json::json!(b)),
        Data::DateTime(dt) => Some(serde_json::json!(dt.as_f64())),
        Data::DateTimeIso(s) => Some(serde_json::json!(s)),
        Data::DurationIso(s) => Some(serde_json::json!(s)),
        Data::Error(e) => Some(serde_json::json!(format!("{e:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sheet_symbol_extraction() {
        assert_eq!(sheet_symbol("AAPL"), "AAPL");
        assert_eq!(sheet_symbol("AVGO(AT1)"), "AVGO");
        assert_eq!(sheet_symbol("msft - archive"), "MSFT");
        assert_eq!(sheet_symbol("BRK:B notes"), "BRK");
        assert_eq!(sheet_symbol("  nvda "), "NVDA");
    }

    #[test]
    fn test_unreadable_template_is_typed() {
        let cfg = EngineConfig::default();
        let err = write(b"this is not a zip archive", &[], &cfg).unwrap_err();
        assert!(matches!(
            crate::error::fatal_kind(&err),
            Some(ReconcileError::TemplateUnreadable(_))
        ));
    }
}
