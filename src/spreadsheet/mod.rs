use std::io::Cursor;

use anyhow::{Context, Result};
use calamine::{DataType, Reader, Xlsx, XlsxError};
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use thiserror::Error;

use crate::store::RowResult;

pub const RESPONSES_SHEET: &str = "Responses";
const OUTPUT_HEADERS: [&str; 3] = ["topic", "ai_prompt", "article"];

/// One data row of an uploaded sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRow {
    /// Zero-based sheet row; the header occupies row 0, so data starts at 1.
    pub row_number: usize,
    pub topic: String,
    pub prompt: String,
}

#[derive(Debug, Error)]
pub enum SpreadsheetError {
    #[error("unable to open the workbook, make sure it is a valid .xlsx file: {0}")]
    Unreadable(#[from] XlsxError),
    #[error("the workbook does not contain any worksheet")]
    NoWorksheet,
    #[error("the first worksheet is empty")]
    EmptySheet,
    #[error("the header row must label column A (topic) and column B (prompt), found {found}")]
    MissingHeader { found: String },
}

/// Parsed upload: the header as written plus the data rows in sheet order.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub header: Vec<String>,
    pub rows: Vec<PromptRow>,
}

fn cell_to_string(cell: Option<&DataType>) -> String {
    let Some(value) = cell else {
        return String::new();
    };
    let text = match value {
        DataType::String(s) => s.clone(),
        DataType::Float(f) => {
            let mut s = format!("{f}");
            if s.ends_with(".0") {
                s.truncate(s.len() - 2);
            }
            s
        }
        DataType::Int(i) => i.to_string(),
        DataType::Bool(b) => b.to_string(),
        DataType::Empty => String::new(),
        other => other.to_string(),
    };
    text
}

/// Read topic/prompt pairs from the first worksheet.
///
/// Row 0 is the header and must name both columns. Every later row inside the used range
/// is returned with its sheet position and its cell text as written; missing cells, and
/// rows that are blank altogether, come through as empty strings.
pub fn parse_rows(bytes: &[u8]) -> Result<ParsedSheet, SpreadsheetError> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(SpreadsheetError::NoWorksheet)??;

    // Ranges start at the first used cell; shift back to absolute sheet coordinates.
    let (start_row, start_col) = range.start().ok_or(SpreadsheetError::EmptySheet)?;
    let absolute = |row: u32, col: u32| -> Option<&DataType> {
        if row < start_row || col < start_col {
            return None;
        }
        range.get(((row - start_row) as usize, (col - start_col) as usize))
    };

    let (end_row, end_col) = range.end().ok_or(SpreadsheetError::EmptySheet)?;

    let header: Vec<String> = (0..=end_col.max(1))
        .map(|col| cell_to_string(absolute(0, col)))
        .collect();
    if header[0].trim().is_empty() || header[1].trim().is_empty() {
        let found = header
            .iter()
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
            .collect::<Vec<_>>();
        let found = if found.is_empty() {
            "an empty header row".to_string()
        } else {
            format!("[{}]", found.join(", "))
        };
        return Err(SpreadsheetError::MissingHeader { found });
    }

    let rows = (1..=end_row)
        .map(|row| PromptRow {
            row_number: row as usize,
            topic: cell_to_string(absolute(row, 0)),
            prompt: cell_to_string(absolute(row, 1)),
        })
        .collect();

    Ok(ParsedSheet { header, rows })
}

/// Render results into a single `Responses` worksheet, one row per result, in order.
pub fn write_rows(results: &[RowResult]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(RESPONSES_SHEET)
        .context("failed to name the responses worksheet")?;

    for (col, title) in OUTPUT_HEADERS.iter().enumerate() {
        worksheet
            .write_string(0, col as u16, *title)
            .context("failed to write header cell")?;
    }

    for (idx, result) in results.iter().enumerate() {
        let row = u32::try_from(idx + 1).context("too many rows for one worksheet")?;
        worksheet
            .write_string(row, 0, &result.topic)
            .context("failed to write topic")?;
        worksheet
            .write_string(row, 1, &result.prompt)
            .context("failed to write prompt")?;
        worksheet
            .write_string(row, 2, &result.article)
            .context("failed to write article")?;
    }

    workbook
        .save_to_buffer()
        .context("failed to serialize the responses workbook")
}
