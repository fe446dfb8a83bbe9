//! Targeted XLSX archive patching
//!
//! An XLSX file is a ZIP of XML members. To change two cells per ticker
//! sheet without disturbing formulas, styles, named ranges or hidden
//! state, every untouched member is raw-copied (compressed bytes and all)
//! and only the addressed worksheet XML is edited in place. Appending the
//! report sheet touches exactly the three registry members that must know
//! about it.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use anyhow::{anyhow, Context};
use regex::Regex;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{ReconcileError, Result};

/// One numeric cell write, addressed by sheet name and 1-based row/column.
#[derive(Debug, Clone)]
pub struct CellEdit {
    pub sheet_name: String,
    pub row: u32,
    pub column: u32,
    /// Decimal rendering of the value, written verbatim into `<v>`.
    pub value: String,
}

/// Cell content for a generated sheet.
#[derive(Debug, Clone)]
pub enum SheetCell {
    Text(String),
    Number(String),
}

/// 1-based column index to letters: 1 -> A, 27 -> AA.
pub fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = ((col - 1) % 26) as u8;
        letters.push(b'A' + rem);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Letters to 1-based column index: A -> 1, AA -> 27.
pub fn column_index(letters: &str) -> u32 {
    letters
        .bytes()
        .fold(0, |acc, b| acc * 26 + (b - b'A' + 1) as u32)
}

type Archive = ZipArchive<Cursor<Vec<u8>>>;

fn open_archive(xlsx: &[u8]) -> Result<Archive> {
    ZipArchive::new(Cursor::new(xlsx.to_vec())).map_err(|e| {
        anyhow!(ReconcileError::TemplateUnreadable(format!(
            "not a valid XLSX archive: {e}"
        )))
    })
}

fn read_member(archive: &mut Archive, name: &str) -> Result<String> {
    let mut file = archive.by_name(name).map_err(|e| {
        anyhow!(ReconcileError::TemplateUnreadable(format!(
            "missing workbook member {name}: {e}"
        )))
    })?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .with_context(|| format!("failed to read workbook member {name}"))?;
    Ok(text)
}

/// Map of sheet name -> archive path of its worksheet XML, from
/// xl/workbook.xml joined with the workbook relationships.
fn sheet_paths(archive: &mut Archive) -> Result<BTreeMap<String, String>> {
    let workbook_xml = read_member(archive, "xl/workbook.xml")?;
    let rels_xml = read_member(archive, "xl/_rels/workbook.xml.rels")?;

    let rel_re =
        Regex::new(r#"<Relationship\b[^>]*?\bId="([^"]+)"[^>]*?\bTarget="([^"]+)""#)?;
    let mut targets: BTreeMap<String, String> = BTreeMap::new();
    for caps in rel_re.captures_iter(&rels_xml) {
        let target = caps[2].to_string();
        let path = if let Some(stripped) = target.strip_prefix('/') {
            stripped.to_string()
        } else {
            format!("xl/{target}")
        };
        targets.insert(caps[1].to_string(), path);
    }

    let sheet_re = Regex::new(r#"<sheet\b[^>]*?\bname="([^"]*)"[^>]*?\br:id="([^"]+)""#)?;
    let mut paths = BTreeMap::new();
    for caps in sheet_re.captures_iter(&workbook_xml) {
        if let Some(path) = targets.get(&caps[2]) {
            paths.insert(xml_unescape(&caps[1]), path.clone());
        }
    }

    if paths.is_empty() {
        return Err(anyhow!(ReconcileError::TemplateUnreadable(
            "workbook declares no sheets".to_string()
        )));
    }
    Ok(paths)
}

/// Copy the archive, replacing the content of `replacements` members and
/// appending `additions` as new members. Untouched members keep their
/// exact compressed bytes via raw copy.
fn rewrite_archive(
    archive: &mut Archive,
    replacements: &BTreeMap<String, String>,
    additions: &[(String, String)],
) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .context("failed to read archive member")?;
        let name = file.name().to_string();
        match replacements.get(&name) {
            Some(content) => {
                drop(file);
                writer
                    .start_file(name.as_str(), options)
                    .with_context(|| format!("failed to rewrite member {name}"))?;
                writer
                    .write_all(content.as_bytes())
                    .with_context(|| format!("failed to write member {name}"))?;
            }
            None => {
                writer
                    .raw_copy_file(file)
                    .with_context(|| format!("failed to copy member {name}"))?;
            }
        }
    }

    for (name, content) in additions {
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("failed to add member {name}"))?;
        writer
            .write_all(content.as_bytes())
            .with_context(|| format!("failed to write member {name}"))?;
    }

    let cursor = writer.finish().context("failed to finish archive")?;
    Ok(cursor.into_inner())
}

/// Apply numeric cell edits to their sheets. Unedited members are
/// byte-identical to the input archive.
pub fn patch_cells(xlsx: &[u8], edits: &[CellEdit]) -> Result<Vec<u8>> {
    if edits.is_empty() {
        return Ok(xlsx.to_vec());
    }

    let mut archive = open_archive(xlsx)?;
    let paths = sheet_paths(&mut archive)?;

    let mut by_path: BTreeMap<String, Vec<&CellEdit>> = BTreeMap::new();
    for edit in edits {
        let path = paths.get(&edit.sheet_name).ok_or_else(|| {
            // The planner only addresses sheets it saw in this same file
            anyhow!("internal: edit for unknown sheet {:?}", edit.sheet_name)
        })?;
        by_path.entry(path.clone()).or_default().push(edit);
    }

    let mut replacements = BTreeMap::new();
    for (path, sheet_edits) in by_path {
        let xml = read_member(&mut archive, &path)?;
        let patched = patch_sheet_xml(&xml, &sheet_edits)
            .with_context(|| format!("failed to patch {path}"))?;
        replacements.insert(path, patched);
    }

    rewrite_archive(&mut archive, &replacements, &[])
}

fn patch_sheet_xml(xml: &str, edits: &[&CellEdit]) -> Result<String> {
    let mut edits: Vec<&CellEdit> = edits.to_vec();
    edits.sort_by_key(|e| (e.row, e.column));

    let mut out = update_dimension(xml, &edits)?;
    for edit in edits {
        out = apply_cell_edit(&out, edit.row, edit.column, &edit.value)?;
    }
    Ok(out)
}

/// Grow the declared used range to cover cells written outside it; Excel
/// treats the declaration as authoritative on some sparse sheets.
fn update_dimension(xml: &str, edits: &[&CellEdit]) -> Result<String> {
    let dim_re = Regex::new(r#"<dimension ref="([A-Z]+)(\d+)(?::([A-Z]+)(\d+))?"/>"#)?;
    let Some(caps) = dim_re.captures(xml) else {
        return Ok(xml.to_string());
    };
    let full = caps.get(0).map(|m| (m.start(), m.end()));

    let mut min_col = column_index(&caps[1]);
    let mut min_row: u32 = caps[2].parse().unwrap_or(1);
    let (mut max_col, mut max_row) = match (caps.get(3), caps.get(4)) {
        (Some(c), Some(r)) => (
            column_index(c.as_str()),
            r.as_str().parse().unwrap_or(min_row),
        ),
        _ => (min_col, min_row),
    };

    for edit in edits {
        min_col = min_col.min(edit.column);
        max_col = max_col.max(edit.column);
        min_row = min_row.min(edit.row);
        max_row = max_row.max(edit.row);
    }

    let new_dim = format!(
        r#"<dimension ref="{}{min_row}:{}{max_row}"/>"#,
        column_letters(min_col),
        column_letters(max_col)
    );
    Ok(match full {
        Some((start, end)) => splice(xml, start, end, &new_dim),
        None => xml.to_string(),
    })
}

fn apply_cell_edit(xml: &str, row: u32, col: u32, value: &str) -> Result<String> {
    let cell_ref = format!("{}{}", column_letters(col), row);
    let row_re = Regex::new(&format!(
        r#"(?s)<row\b[^>]*?\br="{row}"[^>]*?(?:/>|>.*?</row>)"#
    ))?;

    match row_re.find(xml) {
        Some(m) => {
            let new_row = edit_row_xml(m.as_str(), &cell_ref, col, value)?;
            Ok(splice(xml, m.start(), m.end(), &new_row))
        }
        None => {
            let new_row = format!(r#"<row r="{row}"><c r="{cell_ref}"><v>{value}</v></c></row>"#);
            insert_row(xml, row, &new_row)
        }
    }
}

fn edit_row_xml(row_xml: &str, cell_ref: &str, col: u32, value: &str) -> Result<String> {
    // An empty row stored self-closing gets expanded
    if row_xml.ends_with("/>") {
        let open_tag = &row_xml[..row_xml.len() - 2];
        return Ok(format!(
            r#"{open_tag}><c r="{cell_ref}"><v>{value}</v></c></row>"#
        ));
    }

    let cell_re = Regex::new(&format!(
        r#"(?s)<c\b[^>]*?\br="{cell_ref}"[^>]*?(?:/>|>.*?</c>)"#
    ))?;

    if let Some(m) = cell_re.find(row_xml) {
        // Overwrite the cell, keeping its style index. Any previous type
        // attribute (shared string, formula) is dropped: the cell now
        // holds a plain number.
        let style_re = Regex::new(r#"\bs="(\d+)""#)?;
        let new_cell = match style_re.captures(m.as_str()) {
            Some(caps) => format!(
                r#"<c r="{cell_ref}" s="{}"><v>{value}</v></c>"#,
                &caps[1]
            ),
            None => format!(r#"<c r="{cell_ref}"><v>{value}</v></c>"#),
        };
        return Ok(splice(row_xml, m.start(), m.end(), &new_cell));
    }

    // Cell absent: insert in column order so the row stays sorted
    let new_cell = format!(r#"<c r="{cell_ref}"><v>{value}</v></c>"#);
    let cref_re = Regex::new(r#"<c\b[^>]*?\br="([A-Z]+)(\d+)""#)?;
    for caps in cref_re.captures_iter(row_xml) {
        if column_index(&caps[1]) > col {
            let pos = caps.get(0).map(|m| m.start()).unwrap_or(0);
            return Ok(splice(row_xml, pos, pos, &new_cell));
        }
    }

    let close = row_xml
        .rfind("</row>")
        .ok_or_else(|| anyhow!("malformed row element"))?;
    Ok(splice(row_xml, close, close, &new_cell))
}

fn insert_row(xml: &str, row: u32, new_row: &str) -> Result<String> {
    // Entirely empty sheet
    if let Some(pos) = xml.find("<sheetData/>") {
        let expanded = format!("<sheetData>{new_row}</sheetData>");
        return Ok(splice(xml, pos, pos + "<sheetData/>".len(), &expanded));
    }

    let close = xml
        .find("</sheetData>")
        .ok_or_else(|| anyhow!("worksheet has no sheetData element"))?;

    // Keep rows sorted by number: insert before the first higher row
    let row_open_re = Regex::new(r#"<row\b[^>]*?\br="(\d+)""#)?;
    for caps in row_open_re.captures_iter(&xml[..close]) {
        let num: u32 = caps[1].parse().unwrap_or(0);
        if num > row {
            let pos = caps.get(0).map(|m| m.start()).unwrap_or(close);
            return Ok(splice(xml, pos, pos, new_row));
        }
    }

    Ok(splice(xml, close, close, new_row))
}

fn splice(text: &str, start: usize, end: usize, replacement: &str) -> String {
    format!("{}{}{}", &text[..start], replacement, &text[end..])
}

/// Write `rows` as a whole sheet named `sheet_name`, replacing an existing
/// sheet of that name or appending a new one (registering it in the
/// workbook, its relationships and the content types). `frozen_rows > 0`
/// freezes that many leading rows.
pub fn write_sheet(
    xlsx: &[u8],
    sheet_name: &str,
    rows: &[Vec<SheetCell>],
    frozen_rows: u32,
) -> Result<Vec<u8>> {
    let mut archive = open_archive(xlsx)?;
    let paths = sheet_paths(&mut archive)?;
    let sheet_xml = render_sheet_xml(rows, frozen_rows);

    if let Some(path) = paths.get(sheet_name) {
        // Template already carries the sheet: replace its content wholesale
        let mut replacements = BTreeMap::new();
        replacements.insert(path.clone(), sheet_xml);
        return rewrite_archive(&mut archive, &replacements, &[]);
    }

    let workbook_xml = read_member(&mut archive, "xl/workbook.xml")?;
    let rels_xml = read_member(&mut archive, "xl/_rels/workbook.xml.rels")?;
    let types_xml = read_member(&mut archive, "[Content_Types].xml")?;

    let rid_re = Regex::new(r#"\bId="rId(\d+)""#)?;
    let next_rid = rid_re
        .captures_iter(&rels_xml)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1;

    let sheet_id_re = Regex::new(r#"\bsheetId="(\d+)""#)?;
    let next_sheet_id = sheet_id_re
        .captures_iter(&workbook_xml)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1;

    let member_re = Regex::new(r"^xl/worksheets/sheet(\d+)\.xml$")?;
    let next_file_num = (0..archive.len())
        .filter_map(|i| {
            let file = archive.by_index_raw(i).ok()?;
            member_re
                .captures(file.name())
                .and_then(|c| c[1].parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0)
        + 1;
    let new_path = format!("xl/worksheets/sheet{next_file_num}.xml");

    let sheets_close = workbook_xml
        .find("</sheets>")
        .ok_or_else(|| anyhow!("workbook.xml has no sheets element"))?;
    let sheet_decl = format!(
        r#"<sheet name="{}" sheetId="{next_sheet_id}" r:id="rId{next_rid}"/>"#,
        xml_escape(sheet_name)
    );
    let new_workbook = splice(&workbook_xml, sheets_close, sheets_close, &sheet_decl);

    let rels_close = rels_xml
        .find("</Relationships>")
        .ok_or_else(|| anyhow!("workbook rels has no Relationships element"))?;
    let rel_decl = format!(
        r#"<Relationship Id="rId{next_rid}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{next_file_num}.xml"/>"#
    );
    let new_rels = splice(&rels_xml, rels_close, rels_close, &rel_decl);

    let types_close = types_xml
        .find("</Types>")
        .ok_or_else(|| anyhow!("[Content_Types].xml has no Types element"))?;
    let type_decl = format!(
        r#"<Override PartName="/{new_path}" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
    );
    let new_types = splice(&types_xml, types_close, types_close, &type_decl);

    let mut replacements = BTreeMap::new();
    replacements.insert("xl/workbook.xml".to_string(), new_workbook);
    replacements.insert("xl/_rels/workbook.xml.rels".to_string(), new_rels);
    replacements.insert("[Content_Types].xml".to_string(), new_types);

    rewrite_archive(&mut archive, &replacements, &[(new_path, sheet_xml)])
}

fn render_sheet_xml(rows: &[Vec<SheetCell>], frozen_rows: u32) -> String {
    let mut body = String::new();
    for (idx, cells) in rows.iter().enumerate() {
        if cells.is_empty() {
            continue; // blank spacer row
        }
        let row_num = idx + 1;
        body.push_str(&format!(r#"<row r="{row_num}">"#));
        for (col_idx, cell) in cells.iter().enumerate() {
            let cell_ref = format!("{}{}", column_letters(col_idx as u32 + 1), row_num);
            match cell {
                SheetCell::Text(text) => body.push_str(&format!(
                    r#"<c r="{cell_ref}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                    xml_escape(text)
                )),
                SheetCell::Number(num) => {
                    body.push_str(&format!(r#"<c r="{cell_ref}"><v>{num}</v></c>"#))
                }
            }
        }
        body.push_str("</row>");
    }

    let views = if frozen_rows > 0 {
        format!(
            r#"<sheetViews><sheetView workbookViewId="0"><pane ySplit="{frozen_rows}" topLeftCell="A{}" activePane="bottomLeft" state="frozen"/></sheetView></sheetViews>"#,
            frozen_rows + 1
        )
    } else {
        String::new()
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{views}<sheetData>{body}</sheetData></worksheet>"#
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
