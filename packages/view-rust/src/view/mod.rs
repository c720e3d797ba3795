//! Federation of priority-ordered storage layers into one logical store.
//!
//! A [`View`] owns an ordered [`LayerSet`]; layer 0 has the highest
//! priority. Sessions opened on the view hold one storage session per layer:
//!
//! - [`ViewReadSession`]: queries all layers concurrently, looks up
//!   features missing from obligatory layers by id, and merges the rows of
//!   each feature into one
//! - [`ViewWriteSession`]: reads like a read session, writes to one layer
//!
//! Merging and backfill are pluggable through [`MergeOperation`] and
//! [`MissingIdResolver`].

pub mod executor;
pub mod layer;
pub mod merge;
pub mod missing;
pub mod read_session;
pub mod write_session;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use featureview_core::{FeatureCodec, RequestContext};
use tokio::sync::Semaphore;
use tracing::debug;

pub use executor::{CorrelationMap, LayerReadRequest, ScatterGatherExecutor};
pub use layer::{LayerId, LayerRow, LayerSet, ViewLayer};
pub use merge::{MergeByStoragePriority, MergeOperation};
pub use missing::{IgnoreMissingResolver, MissingIdResolver, ObligatoryLayersResolver};
pub use read_session::{is_request_only_by_id, ViewReadSession};
pub use write_session::ViewWriteSession;

use crate::config::ViewConfig;
use crate::error::ViewError;

/// A set of layers plus the configuration shared by all its sessions.
///
/// Cloning is cheap; clones share the layers and the concurrency limit.
#[derive(Debug, Clone)]
pub struct View<C: FeatureCodec> {
    layers: Arc<LayerSet<C>>,
    config: ViewConfig,
    executor: Arc<ScatterGatherExecutor>,
}

impl<C: FeatureCodec> View<C> {
    /// Creates a view with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::EmptyLayerSet`] if `layers` is empty, or
    /// [`ViewError::InvalidConcurrencyLimit`] for more layers than the
    /// default limit.
    pub fn new(name: impl Into<String>, layers: Vec<ViewLayer<C>>) -> Result<Self, ViewError> {
        Self::with_config(name, layers, ViewConfig::default())
    }

    /// # Errors
    ///
    /// - [`ViewError::EmptyLayerSet`] if `layers` is empty.
    /// - [`ViewError::InvalidConcurrencyLimit`] if the configured limit
    ///   cannot serve one scatter round over all layers.
    pub fn with_config(
        name: impl Into<String>,
        layers: Vec<ViewLayer<C>>,
        config: ViewConfig,
    ) -> Result<Self, ViewError> {
        let layers = LayerSet::new(name, layers)?;
        Self::from_layer_set(Arc::new(layers), config)
    }

    /// # Errors
    ///
    /// Returns [`ViewError::InvalidConcurrencyLimit`] unless the limit is
    /// at least the number of layers and at most [`Semaphore::MAX_PERMITS`].
    pub fn from_layer_set(
        layers: Arc<LayerSet<C>>,
        config: ViewConfig,
    ) -> Result<Self, ViewError> {
        let limit = config.max_concurrent_layer_calls;
        if limit < layers.len() || limit > Semaphore::MAX_PERMITS {
            return Err(ViewError::InvalidConcurrencyLimit {
                limit,
                layers: layers.len(),
                max: Semaphore::MAX_PERMITS,
            });
        }
        debug!(
            view = %layers.name(),
            layers = layers.len(),
            max_calls = config.max_concurrent_layer_calls,
            "view created"
        );
        let executor = Arc::new(ScatterGatherExecutor::new(&config));
        Ok(Self {
            layers,
            config,
            executor,
        })
    }

    #[must_use]
    pub fn layers(&self) -> &Arc<LayerSet<C>> {
        &self.layers
    }

    #[must_use]
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Opens a read session over every layer.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if a storage refuses to open a session.
    pub async fn new_read_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> Result<ViewReadSession<C>, ViewError> {
        ViewReadSession::open(
            Arc::clone(&self.layers),
            Arc::clone(&self.executor),
            &self.config,
            ctx,
            use_master,
        )
        .await
    }

    /// Opens a write session. Its read side connects to the primaries.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if a storage refuses to open a session.
    pub async fn new_write_session(
        &self,
        ctx: &RequestContext,
    ) -> Result<ViewWriteSession<C>, ViewError> {
        Ok(ViewWriteSession::new(self.new_read_session(ctx, true).await?))
    }
}
