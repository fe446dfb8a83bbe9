//! Positions CSV parsing and aggregation
//!
//! Parses the brokerage positions export by header (column order and
//! unknown extra columns do not matter), normalizes account labels, and
//! groups rows by (ticker, canonical account code). Aggregation is a plain
//! sum per group, so it is order-independent and idempotent by
//! construction.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::CostMode;
use crate::error::{ReconcileError, Result};
use crate::mapping::{AccountMapping, AccountNormalizer, MapMethod};

/// One CSV data row, as parsed.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub raw_account_label: String,
    pub ticker: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub as_of_date: Option<NaiveDate>,
}

/// Summed position for one (ticker, canonical account code) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatePosition {
    pub ticker: String,
    pub canonical_code: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub source_row_count: usize,
}

/// Everything one aggregation pass produces.
#[derive(Debug)]
pub struct AggregateOutput {
    pub aggregates: Vec<AggregatePosition>,
    /// One entry per distinct raw account label seen, mapped or not.
    pub mappings: Vec<AccountMapping>,
    pub warnings: Vec<String>,
    pub rows_read: usize,
}

#[derive(Debug)]
struct ColumnMapping {
    account: usize,
    symbol: usize,
    quantity: usize,
    cost_total: Option<usize>,
    cost_avg: Option<usize>,
    as_of_date: Option<usize>,
}

/// Parse and aggregate a positions CSV.
///
/// Fatal only when required headers are missing or no row parses at all;
/// individual bad rows become warnings and unmapped accounts are excluded
/// but recorded.
pub fn aggregate(
    csv_bytes: &[u8],
    normalizer: &AccountNormalizer,
    cost_mode: CostMode,
) -> Result<AggregateOutput> {
    let rows = parse_positions_csv(csv_bytes, cost_mode)?;
    Ok(aggregate_rows(&rows.rows, normalizer, cost_mode, rows.warnings))
}

struct ParsedCsv {
    rows: Vec<PositionRow>,
    warnings: Vec<String>,
}

fn parse_positions_csv(csv_bytes: &[u8], cost_mode: CostMode) -> Result<ParsedCsv> {
    // Brokerage exports are UTF-8 with a BOM more often than not
    let (text, _, _) = encoding_rs::UTF_8.decode(csv_bytes);

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .context("failed to read CSV headers")?
        .clone();
    debug!("CSV headers: {:?}", headers);

    let mapping = find_columns(&headers)?;
    debug!("Column mapping: {:?}", mapping);

    let mut rows = Vec::new();
    let mut warnings = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        let row_num = idx + 2; // 1-based, after the header row
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping row {}: {}", row_num, e);
                warnings.push(format!("row {row_num}: unreadable record: {e}"));
                continue;
            }
        };

        match parse_row(&record, &mapping, row_num) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping row {}: {}", row_num, e);
                warnings.push(format!("row {row_num}: {e}"));
            }
        }
    }

    if rows.is_empty() {
        return Err(anyhow!(ReconcileError::MalformedInput(
            "no parseable position rows in CSV".to_string()
        )));
    }

    info!("Parsed {} position rows (cost mode {})", rows.len(), cost_mode.as_str());
    Ok(ParsedCsv { rows, warnings })
}

fn find_columns(headers: &csv::StringRecord) -> Result<ColumnMapping> {
    let mut account_idx = None;
    let mut symbol_idx = None;
    let mut quantity_idx = None;
    let mut cost_total_idx = None;
    let mut cost_avg_idx = None;
    let mut date_idx = None;

    for (idx, header) in headers.iter().enumerate() {
        let text = header.trim().to_lowercase();

        if text.contains("account") && account_idx.is_none() {
            account_idx = Some(idx);
        }

        if (text == "symbol" || text == "ticker" || text.contains("symbol")) && symbol_idx.is_none()
        {
            symbol_idx = Some(idx);
        }

        if text.contains("quantity") || text == "qty" {
            quantity_idx = Some(idx);
        }

        if text.contains("cost basis") && text.contains("total") {
            cost_total_idx = Some(idx);
        }

        if text.contains("average") && text.contains("cost") {
            cost_avg_idx = Some(idx);
        }

        if (text.contains("as of") || text == "date") && date_idx.is_none() {
            date_idx = Some(idx);
        }
    }

    let missing_header = |name: &str| {
        anyhow!(ReconcileError::MalformedInput(format!(
            "required column not found: {name}"
        )))
    };

    let mapping = ColumnMapping {
        account: account_idx.ok_or_else(|| missing_header("account label"))?,
        symbol: symbol_idx.ok_or_else(|| missing_header("ticker symbol"))?,
        quantity: quantity_idx.ok_or_else(|| missing_header("quantity"))?,
        cost_total: cost_total_idx,
        cost_avg: cost_avg_idx,
        as_of_date: date_idx,
    };

    if mapping.cost_total.is_none() && mapping.cost_avg.is_none() {
        return Err(missing_header("cost basis"));
    }

    Ok(mapping)
}

fn parse_row(
    record: &csv::StringRecord,
    mapping: &ColumnMapping,
    row_num: usize,
) -> Result<Option<PositionRow>> {
    let account = record
        .get(mapping.account)
        .unwrap_or("")
        .trim()
        .to_string();
    let ticker = record
        .get(mapping.symbol)
        .unwrap_or("")
        .trim()
        .to_uppercase();

    // Subtotal/footer rows in brokerage exports leave these blank
    if account.is_empty() || ticker.is_empty() {
        return Ok(None);
    }

    let quantity_str = record
        .get(mapping.quantity)
        .ok_or_else(|| anyhow!("missing quantity at row {row_num}"))?;
    let quantity =
        parse_money(quantity_str).with_context(|| format!("bad quantity {quantity_str:?}"))?;

    let cost_basis = match mapping.cost_total.and_then(|idx| record.get(idx)) {
        Some(total_str) if !total_str.trim().is_empty() => {
            parse_money(total_str).with_context(|| format!("bad cost basis {total_str:?}"))?
        }
        _ => {
            // Fall back to per-share average times quantity
            let avg_str = mapping
                .cost_avg
                .and_then(|idx| record.get(idx))
                .ok_or_else(|| anyhow!("no cost basis value at row {row_num}"))?;
            let avg =
                parse_money(avg_str).with_context(|| format!("bad average cost {avg_str:?}"))?;
            avg * quantity
        }
    };

    let as_of_date = match mapping.as_of_date.and_then(|idx| record.get(idx)) {
        Some(s) if !s.trim().is_empty() => Some(parse_date(s.trim())?),
        _ => None,
    };

    Ok(Some(PositionRow {
        raw_account_label: account,
        ticker,
        quantity,
        cost_basis,
        as_of_date,
    }))
}

fn parse_date(date_str: &str) -> Result<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(date_str, "%m/%d/%Y") {
        return Ok(date);
    }
    Err(anyhow!("could not parse date: {}", date_str))
}

/// Parse a money or quantity field: currency symbols, thousands commas and
/// surrounding whitespace are tolerated; parentheses mean negative.
fn parse_money(text: &str) -> Result<Decimal> {
    let trimmed = text.trim();
    let (body, negative) = if trimmed.starts_with('(') && trimmed.ends_with(')') {
        (&trimmed[1..trimmed.len() - 1], true)
    } else {
        (trimmed, false)
    };

    let cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();

    let value = Decimal::from_str(&cleaned).context("failed to parse decimal")?;
    Ok(if negative { -value } else { value })
}

fn aggregate_rows(
    rows: &[PositionRow],
    normalizer: &AccountNormalizer,
    cost_mode: CostMode,
    mut warnings: Vec<String>,
) -> AggregateOutput {
    struct Group {
        quantity: Decimal,
        cost: Decimal,
        row_count: usize,
    }

    let mut mappings: BTreeMap<String, AccountMapping> = BTreeMap::new();
    let mut groups: BTreeMap<(String, String), Group> = BTreeMap::new();

    for row in rows {
        let mapping = mappings
            .entry(row.raw_account_label.clone())
            .or_insert_with(|| normalizer.normalize(&row.raw_account_label));

        let code = match (&mapping.method, &mapping.canonical_code) {
            (MapMethod::Unmapped, _) | (_, None) => continue,
            (_, Some(code)) => code.clone(),
        };

        let group = groups
            .entry((row.ticker.clone(), code))
            .or_insert_with(|| Group {
                quantity: Decimal::ZERO,
                cost: Decimal::ZERO,
                row_count: 0,
            });
        group.quantity += row.quantity;
        group.cost += row.cost_basis;
        group.row_count += 1;
    }

    let aggregates = groups
        .into_iter()
        .map(|((ticker, code), group)| {
            let cost_basis = match cost_mode {
                CostMode::TotalBasis => group.cost,
                CostMode::AverageCost => {
                    if group.quantity.is_zero() {
                        warnings.push(format!(
                            "{ticker}/{code}: zero total quantity, average cost written as 0"
                        ));
                        Decimal::ZERO
                    } else {
                        group.cost / group.quantity
                    }
                }
            };
            AggregatePosition {
                ticker,
                canonical_code: code,
                quantity: group.quantity,
                cost_basis,
                source_row_count: group.row_count,
            }
        })
        .collect::<Vec<_>>();

    let unmapped = mappings
        .values()
        .filter(|m| m.method == MapMethod::Unmapped)
        .count();
    info!(
        "Aggregated {} rows into {} positions ({} distinct accounts, {} unmapped)",
        rows.len(),
        aggregates.len(),
        mappings.len(),
        unmapped
    );

    AggregateOutput {
        aggregates,
        mappings: mappings.into_values().collect(),
        warnings,
        rows_read: rows.len(),
    }
}
