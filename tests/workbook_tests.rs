//! Archive-level tests for the template writer
//!
//! The no-clobber promise is stronger than cell equality: members of the
//! XLSX archive that were not addressed must come through byte-for-byte.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use calamine::{DataType, Reader, Xlsx};
use posrec::config::EngineConfig;
use posrec::positions::AggregatePosition;
use posrec::workbook::{self, patch};
use rust_decimal_macros::dec;
use rust_xlsxwriter::Workbook;
use zip::ZipArchive;

fn build_template() -> Vec<u8> {
    let mut workbook = Workbook::new();

    let aapl = workbook.add_worksheet();
    aapl.set_name("AAPL").unwrap();
    aapl.write_string(0, 1, "401K").unwrap();
    aapl.write_number(23, 1, 8.0).unwrap();
    aapl.write_formula(5, 3, "=B24*2").unwrap();

    let notes = workbook.add_worksheet();
    notes.set_name("Notes").unwrap();
    notes.write_string(0, 0, "untouched sheet").unwrap();

    workbook.save_to_buffer().unwrap()
}

fn members(xlsx: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(xlsx.to_vec())).unwrap();
    let mut out = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).unwrap();
        out.insert(file.name().to_string(), bytes);
    }
    out
}

fn aggregate(ticker: &str, code: &str, qty: rust_decimal::Decimal) -> AggregatePosition {
    AggregatePosition {
        ticker: ticker.to_string(),
        canonical_code: code.to_string(),
        quantity: qty,
        cost_basis: dec!(1500),
        source_row_count: 1,
    }
}

#[test]
fn test_untouched_members_are_byte_identical() {
    let template = build_template();
    let cfg = EngineConfig::default();
    let outcome = workbook::write(&template, &[aggregate("AAPL", "401K", dec!(10))], &cfg).unwrap();

    let before = members(&template);
    let after = members(&outcome.workbook_bytes);

    assert_eq!(
        before.keys().collect::<Vec<_>>(),
        after.keys().collect::<Vec<_>>(),
        "member set must not change"
    );

    let mut changed: Vec<&String> = Vec::new();
    for (name, bytes) in &before {
        if after[name] != *bytes {
            changed.push(name);
        }
    }
    // Exactly one member differs: the AAPL worksheet XML
    assert_eq!(changed.len(), 1, "changed members: {changed:?}");
    assert!(changed[0].starts_with("xl/worksheets/sheet"));
}

#[test]
fn test_unknown_ticker_changes_nothing() {
    let template = build_template();
    let cfg = EngineConfig::default();
    let outcome = workbook::write(&template, &[aggregate("ZZZZ", "401K", dec!(5))], &cfg).unwrap();

    assert_eq!(outcome.writes.len(), 0);
    assert!(outcome.skipped_tickers.contains("ZZZZ"));
    assert_eq!(members(&template), members(&outcome.workbook_bytes));
}

#[test]
fn test_unknown_header_column_is_reported() {
    let template = build_template();
    let cfg = EngineConfig::default();
    let outcome = workbook::write(&template, &[aggregate("AAPL", "HSA", dec!(5))], &cfg).unwrap();

    assert_eq!(outcome.writes.len(), 0);
    assert_eq!(
        outcome.unmatched_columns,
        vec![("AAPL".to_string(), "HSA".to_string())]
    );
}

#[test]
fn test_overwrite_is_idempotent() {
    let template = build_template();
    let cfg = EngineConfig::default();
    let aggs = [aggregate("AAPL", "401K", dec!(10))];

    let once = workbook::write(&template, &aggs, &cfg).unwrap();
    // Writing the same aggregates onto the already-updated bytes lands on
    // the same final values (overwrite, not accumulate)
    let twice = workbook::write(&once.workbook_bytes, &aggs, &cfg).unwrap();

    let read = |bytes: &[u8]| {
        let mut wb: Xlsx<_> = Xlsx::new(Cursor::new(bytes.to_vec())).unwrap();
        let range = wb.worksheet_range("AAPL").unwrap();
        (
            range.get_value((23, 1)).and_then(|d| d.as_f64()),
            range.get_value((38, 1)).and_then(|d| d.as_f64()),
        )
    };
    assert_eq!(read(&once.workbook_bytes), (Some(10.0), Some(1500.0)));
    assert_eq!(read(&twice.workbook_bytes), (Some(10.0), Some(1500.0)));
}

#[test]
fn test_previous_values_are_captured() {
    let template = build_template();
    let cfg = EngineConfig::default();
    let outcome = workbook::write(&template, &[aggregate("AAPL", "401K", dec!(10))], &cfg).unwrap();

    let qty_write = outcome
        .writes
        .iter()
        .find(|w| w.row == cfg.quantity_row)
        .unwrap();
    assert_eq!(qty_write.previous_value, Some(serde_json::json!(8.0)));

    let cost_write = outcome
        .writes
        .iter()
        .find(|w| w.row == cfg.cost_row)
        .unwrap();
    assert_eq!(cost_write.previous_value, None);
}

#[test]
fn test_append_sheet_registers_new_member() {
    let template = build_template();
    let rows = vec![
        vec![patch::SheetCell::Text("Run ID".to_string())],
        vec![patch::SheetCell::Number("3".to_string())],
    ];
    let updated = patch::write_sheet(&template, "RunReport", &rows, 1).unwrap();

    let mut wb: Xlsx<_> = Xlsx::new(Cursor::new(updated)).unwrap();
    let names = wb.sheet_names().to_vec();
    assert!(names.contains(&"RunReport".to_string()));
    // Existing sheets still present and readable
    assert!(names.contains(&"AAPL".to_string()));
    assert!(names.contains(&"Notes".to_string()));

    let range = wb.worksheet_range("RunReport").unwrap();
    assert_eq!(
        range.get_value((0, 0)).and_then(|d| d.get_string()),
        Some("Run ID")
    );
    assert_eq!(range.get_value((1, 0)).and_then(|d| d.as_f64()), Some(3.0));
}

#[test]
fn test_existing_report_sheet_is_replaced_not_duplicated() {
    let mut workbook = Workbook::new();
    let aapl = workbook.add_worksheet();
    aapl.set_name("AAPL").unwrap();
    aapl.write_string(0, 1, "401K").unwrap();
    let old = workbook.add_worksheet();
    old.set_name("RunReport").unwrap();
    old.write_string(0, 0, "stale content").unwrap();
    let template = workbook.save_to_buffer().unwrap();

    let rows = vec![vec![patch::SheetCell::Text("fresh content".to_string())]];
    let updated = patch::write_sheet(&template, "RunReport", &rows, 0).unwrap();

    let mut wb: Xlsx<_> = Xlsx::new(Cursor::new(updated)).unwrap();
    let names = wb.sheet_names().to_vec();
    assert_eq!(
        names.iter().filter(|n| *n == "RunReport").count(),
        1,
        "sheet must be replaced, not duplicated"
    );
    let range = wb.worksheet_range("RunReport").unwrap();
    assert_eq!(
        range.get_value((0, 0)).and_then(|d| d.get_string()),
        Some("fresh content")
    );
}

#[test]
fn test_rows_are_inserted_when_template_lacks_them() {
    // MSFT-style sheet: header only, no row 24/39 in the XML
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("NVDA").unwrap();
    sheet.write_string(0, 1, "401K").unwrap();
    let template = workbook.save_to_buffer().unwrap();

    let cfg = EngineConfig::default();
    let outcome = workbook::write(&template, &[aggregate("NVDA", "401K", dec!(7))], &cfg).unwrap();

    let mut wb: Xlsx<_> = Xlsx::new(Cursor::new(outcome.workbook_bytes)).unwrap();
    let range = wb.worksheet_range("NVDA").unwrap();
    assert_eq!(range.get_value((23, 1)).and_then(|d| d.as_f64()), Some(7.0));
    assert_eq!(
        range.get_value((38, 1)).and_then(|d| d.as_f64()),
        Some(1500.0)
    );
}
