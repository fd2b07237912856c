use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};

use crate::error::{ExportError, Result};

const SPREADSHEET_EXTENSION: &str = "xlsx";
/// Excel leaves `~$<name>.xlsx` owner files next to workbooks it has open
const LOCK_FILE_PREFIX: &str = "~$";

/// Finds the spreadsheet to process in `dir`: the first `.xlsx` file in name order
pub fn find_spreadsheet(dir: &Path) -> Result<PathBuf> {
    let discovery_error = |source: io::Error| ExportError::Discovery {
        dir: dir.to_owned(),
        source,
    };
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).map_err(discovery_error)? {
        let entry = entry.map_err(discovery_error)?;
        if !entry.file_type().map_err(discovery_error)?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_spreadsheet = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(SPREADSHEET_EXTENSION));
        let is_lock_file = entry
            .file_name()
            .to_string_lossy()
            .starts_with(LOCK_FILE_PREFIX);
        if is_spreadsheet && !is_lock_file {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ExportError::NoSpreadsheet {
            dir: dir.to_owned(),
        })
}

/// Reads the first sheet of a workbook as rows of text cells.
///
/// Trailing empty cells are dropped, so rows are only as long as their content.
pub fn read_first_sheet(path: &Path) -> Result<Vec<Vec<String>>> {
    let sheet_error = |message: String| ExportError::SheetRead {
        path: path.to_owned(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|err| sheet_error(err.to_string()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| sheet_error("the workbook has no sheet".to_owned()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|err| sheet_error(format!("sheet '{sheet_name}': {err}")))?;

    let rows: Vec<Vec<String>> = range.rows().map(row_to_text).collect();
    if rows.is_empty() {
        return Err(sheet_error(format!("sheet '{sheet_name}' contains no data")));
    }
    Ok(rows)
}

fn row_to_text(row: &[Data]) -> Vec<String> {
    let len = row
        .iter()
        .rposition(|cell| !matches!(cell, Data::Empty))
        .map_or(0, |last| last + 1);
    row[..len].iter().map(cell_to_text).collect()
}

/// Renders a cell the way it reads in the spreadsheet
pub fn cell_to_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => float_to_text(*f),
        Data::DateTime(date_time) => match date_time.as_datetime() {
            Some(date_time) if date_time.time() == chrono::NaiveTime::MIN => {
                date_time.format("%d.%m.%Y").to_string()
            }
            Some(date_time) => date_time.format("%d.%m.%Y %H:%M:%S").to_string(),
            None => float_to_text(date_time.as_f64()),
        },
        other => other.to_string(),
    }
}

fn float_to_text(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.0}")
    } else {
        f.to_string()
    }
}
