use thiserror::Error;

/// Errors surfaced by the core components.
///
/// Storage backends report failures as `anyhow::Error`; those are carried
/// through unchanged in [`DedupError::Store`].
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("embedding for asset {asset_id} has {actual} dimensions, model declares {expected}")]
    DimensionMismatch {
        asset_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("group {0} was replaced by a cluster rebuild")]
    StaleGroup(String),

    #[error("decisions for group {0} changed while this update was prepared; run it again")]
    Conflict(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DedupError>;
