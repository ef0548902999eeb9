mod cursor;
mod derived;
mod paired;
mod session;

use opcsv_core::ClassifyError;
use std::path::PathBuf;
use thiserror::Error;

pub use cursor::RowCursor;
pub use derived::{DatasetPair, DerivedFileService, DEFAULT_SUFFIX, DRAFT_SUFFIX};
pub use paired::{PairedIterator, RecordView};
pub use session::{Session, SessionView};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("csv `{name}` not found")]
    SourceNotFound { name: String },
    #[error("derived file {} already exists", path.display())]
    DerivedAlreadyExists { path: PathBuf },
    #[error("derived file {} not found", path.display())]
    DerivedNotFound { path: PathBuf },
    #[error("malformed row: {reason}")]
    MalformedRow { reason: String },
    #[error("missing field `{field}`")]
    MissingField { field: String },
    #[error("dataset has no rows")]
    EmptyDataset,
    #[error("end of data")]
    EndOfData,
    #[error("row count mismatch: {detail}")]
    RowCountMismatch { detail: String },
    #[error("no active session")]
    NoActiveSession,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl ReviewError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReviewError::SourceNotFound { .. } => "source_not_found",
            ReviewError::DerivedAlreadyExists { .. } => "derived_already_exists",
            ReviewError::DerivedNotFound { .. } => "derived_not_found",
            ReviewError::MalformedRow { .. } => "malformed_row",
            ReviewError::MissingField { .. } => "missing_field",
            ReviewError::EmptyDataset => "empty_dataset",
            ReviewError::EndOfData => "end_of_data",
            ReviewError::RowCountMismatch { .. } => "row_count_mismatch",
            ReviewError::NoActiveSession => "no_active_session",
            ReviewError::Io(_) => "io",
            ReviewError::Csv(_) => "csv",
        }
    }
}

impl From<ClassifyError> for ReviewError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::MissingField { field } => ReviewError::MissingField { field },
            ClassifyError::MalformedRow { reason } => ReviewError::MalformedRow { reason },
        }
    }
}

pub type ReviewResult<T> = Result<T, ReviewError>;
