//! Battery-test CSV ingestion and replay.
//!
//! - Draft: scan an upload once for row count and max cycle, hand back a token.
//! - Import: re-scan the stored object by token and persist rows in batches.
//! - Predict: resample one cycle to 128 points and ask a remote SOH model.
//! - Simulate: replay local CSV files as paced live series, one task per channel.
//!
//! Data shape:
//! - Scanned rows: `scan::DataRow { line_no, fields }` with trimmed fields
//! - Persisted rows: `records::BatteryRecord`
//! - Replayed rows: `sim::SeriesPoint`
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
pub mod draft;
pub mod import;
mod io;
pub mod pipeline;
pub mod predict;
pub mod records;
pub mod registry;
pub mod resample;
pub mod scan;
pub mod sim;
pub mod store;

pub use crate::codec::LineCodec;
pub use crate::io::{build_csv_reader, reader_from_path, CsvMeta};
pub use crate::pipeline::{Draft, Ingestor, Upload};

use thiserror::Error;

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("uploaded file is empty")]
    EmptyUpload,
    #[error("upload token must not be empty")]
    MissingToken,
    #[error("no upload registered for token {0}")]
    TokenNotFound(String),
    #[error("upload {token} is {status}, expected NEW")]
    StatusConflict {
        token: String,
        status: registry::UploadStatus,
    },
    #[error("upload {0} is already being imported")]
    ImportInProgress(String),
    #[error("upload {0} has no storage key")]
    MissingStorageKey(String),
    #[error("missing required column: {0}")]
    MissingColumn(String),
    #[error("csv has no header line")]
    EmptyCsv,
    #[error("no rows found for cycle {0}")]
    NoRowsForCycle(i64),
    #[error("prediction service: {0}")]
    Predictor(String),
    #[error("time-series sink: {0}")]
    Sink(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Business-rule failures the caller can fix; nothing was changed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestError::EmptyUpload
                | IngestError::MissingToken
                | IngestError::TokenNotFound(_)
                | IngestError::StatusConflict { .. }
                | IngestError::ImportInProgress(_)
                | IngestError::MissingStorageKey(_)
                | IngestError::MissingColumn(_)
                | IngestError::EmptyCsv
                | IngestError::NoRowsForCycle(_)
        )
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
