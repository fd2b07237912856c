use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can stop an export run
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Could not find a spreadsheet to process in {dir:?}")]
    NoSpreadsheet { dir: PathBuf },

    #[error("Could not read directory {dir:?}")]
    Discovery {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not read spreadsheet {path:?}: {message}")]
    SheetRead { path: PathBuf, message: String },

    #[error("Missing required column(s): {}", .missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error("Could not parse amount '{text}' on row {row}")]
    AmountParse {
        row: usize,
        text: String,
        #[source]
        source: rust_decimal::Error,
    },

    #[error("Could not create output for payment method '{bucket}' at {path:?}")]
    OutputCreation {
        bucket: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not create the directory for processed spreadsheets {path:?}")]
    ProcessedDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not move {from:?} to {to:?}")]
    Archival {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = ExportError> = std::result::Result<T, E>;
