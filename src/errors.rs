use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions that must surface before any row is written.  Per-row
/// integrity failures are not here on purpose; those are logged and skipped.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("missing required file: {0}")]
    MissingFile(PathBuf),

    #[error("no rows found for tech {0}")]
    NoRows(String),

    #[error("maximum factor for {0} is zero, cannot normalize")]
    ZeroDivisor(String),

    #[error("row count mismatch: {source_rows} source rows vs {scale_rows} scale rows")]
    RowCountMismatch {
        source_rows: usize,
        scale_rows: usize,
    },

    #[error("key ({0}) found in source/target but not in the scale database")]
    MissingScaleKey(String),

    #[error("sum of source factors is zero, cannot derive a scale factor")]
    ZeroSourceSum,
}
