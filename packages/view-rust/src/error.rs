//! Errors returned by the view.

use featureview_core::ErrorCode;

/// Errors returned by view sessions.
///
/// Usage errors (`UnsupportedRequest`, `WriteLayerAlreadySelected`,
/// `UnknownLayer`, `EmptyLayerSet`, `InvalidConcurrencyLimit`) are returned
/// before any storage is contacted. Storage failures are never retried here.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("unsupported request kind {kind}, only {supported} is supported")]
    UnsupportedRequest {
        kind: &'static str,
        supported: &'static str,
    },
    #[error("write layer already selected: layer {current}")]
    WriteLayerAlreadySelected { current: usize },
    #[error("unknown layer {index}, view has {len} layers")]
    UnknownLayer { index: usize, len: usize },
    #[error("a view requires at least one layer")]
    EmptyLayerSet,
    #[error("concurrency limit {limit} must be between {layers} (layer count) and {max}")]
    InvalidConcurrencyLimit {
        limit: usize,
        layers: usize,
        max: usize,
    },
    #[error("maximum number of concurrent tasks ({limit}) reached")]
    TooManyTasks { limit: usize },
    #[error("layer {layer} ({collection}) failed: {source:#}")]
    Layer {
        layer: usize,
        collection: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("layer {layer} ({collection}) answered with error [{reason}] {message}")]
    LayerResult {
        layer: usize,
        collection: String,
        reason: ErrorCode,
        message: String,
    },
    #[error("layer task aborted: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ViewError {
    /// Whether this error is a usage error (caller bug) rather than a
    /// storage failure.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ViewError::UnsupportedRequest { .. }
                | ViewError::WriteLayerAlreadySelected { .. }
                | ViewError::UnknownLayer { .. }
                | ViewError::EmptyLayerSet
                | ViewError::InvalidConcurrencyLimit { .. }
        )
    }
}
