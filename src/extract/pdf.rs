//! PDF parsing contract and page-level helpers.
//!
//! The parser itself is an external collaborator; this module defines
//! the operations the extractor needs plus the markdown table rendering
//! and the font-CID heuristics used to judge structural text.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::models::PageTable;

/// A table as rows of cells, before markdown rendering.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub rows: Vec<Vec<String>>,
}

/// An embedded raster image.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An open PDF document.
pub trait PdfDocument: Send + Sync {
    fn page_count(&self) -> usize;

    /// Structural text of a page (0-based index).
    fn page_text(&self, index: usize) -> Result<String>;

    /// Tables detected on a page. Backends without table support return
    /// an empty list.
    fn page_tables(&self, index: usize) -> Result<Vec<RawTable>>;

    /// Embedded raster images on a page.
    fn page_images(&self, index: usize) -> Result<Vec<RawImage>>;

    /// Render a page to PNG bytes for vision OCR.
    fn render_page_png(&self, index: usize) -> Result<Vec<u8>>;
}

/// Opens PDF files and provides a last-resort raw text extraction.
pub trait PdfBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>>;

    /// Simplest whole-file text extraction, used when the structural
    /// path fails entirely. Pages are separated by form feeds.
    fn raw_text(&self, path: &Path) -> Result<String>;
}

/// Render a raw table as pipe-delimited markdown with a header
/// separator row. Cells with embedded newlines are flattened.
pub fn render_table_markdown(table: &RawTable) -> Option<PageTable> {
    let header = table.rows.first()?;
    if header.is_empty() {
        return None;
    }
    let cols = header.len();

    let clean = |cell: &String| cell.replace(['\n', '\r'], " ").trim().to_string();

    let mut lines = Vec::with_capacity(table.rows.len() + 1);
    lines.push(format!(
        "| {} |",
        header.iter().map(clean).collect::<Vec<_>>().join(" | ")
    ));
    lines.push(format!("| {} |", vec!["---"; cols].join(" | ")));

    for row in &table.rows[1..] {
        let mut cells: Vec<String> = row.iter().map(clean).collect();
        cells.resize(cols, String::new());
        cells.truncate(cols);
        lines.push(format!("| {} |", cells.join(" | ")));
    }

    Some(PageTable {
        markdown: lines.join("\n"),
        rows: table.rows.len(),
        cols,
    })
}

/// Minimum rows before a column-aligned region counts as a table.
const MIN_TABLE_ROWS: usize = 2;

/// Detect tables in layout-preserving text.
///
/// A table row is a line whose cells are separated by runs of two or
/// more spaces; consecutive rows form a region, kept when at least two
/// rows agree on a cell count of two or more. Anything else stays
/// prose.
pub fn detect_layout_tables(text: &str) -> Vec<RawTable> {
    let mut tables = Vec::new();
    let mut region: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        let cells = split_layout_cells(line);
        if cells.len() >= 2 {
            region.push(cells);
        } else {
            flush_region(&mut region, &mut tables);
        }
    }
    flush_region(&mut region, &mut tables);

    tables
}

fn flush_region(region: &mut Vec<Vec<String>>, tables: &mut Vec<RawTable>) {
    if region_is_table(region) {
        tables.push(RawTable {
            rows: std::mem::take(region),
        });
    } else {
        region.clear();
    }
}

fn region_is_table(region: &[Vec<String>]) -> bool {
    if region.len() < MIN_TABLE_ROWS {
        return false;
    }
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for row in region {
        *counts.entry(row.len()).or_insert(0) += 1;
    }
    counts.iter().any(|(cells, rows)| *cells >= 2 && *rows >= 2)
}

/// Split a layout line into cells at runs of two or more spaces.
/// Single spaces stay inside a cell.
fn split_layout_cells(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut spaces = 0;

    for c in line.trim_end().chars() {
        if c == ' ' {
            spaces += 1;
            continue;
        }
        if spaces >= 2 {
            if !current.trim().is_empty() {
                cells.push(current.trim().to_string());
            }
            current.clear();
        } else if spaces == 1 {
            current.push(' ');
        }
        spaces = 0;
        current.push(c);
    }
    if !current.trim().is_empty() {
        cells.push(current.trim().to_string());
    }

    cells
}

fn cid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(cid:\d+\)").expect("invalid cid pattern"))
}

/// Count `(cid:N)` placeholders left behind by unmapped fonts.
pub fn count_cid_markers(text: &str) -> usize {
    cid_pattern().find_iter(text).count()
}

/// Remove CID placeholders, leaving the residual readable text.
pub fn strip_cid_markers(text: &str) -> String {
    cid_pattern().replace_all(text, "").to_string()
}
