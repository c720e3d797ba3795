//! Write orchestrator: a read session that also writes to exactly one layer.

use std::time::Duration;

use featureview_core::{
    FeatureCodec, Notification, ReadRequest, RequestContext, StorageResult, WriteRequest,
};
use tracing::{debug, warn};

use super::layer::{LayerId, LayerSet};
use super::merge::MergeOperation;
use super::missing::MissingIdResolver;
use super::read_session::ViewReadSession;
use crate::error::ViewError;
use crate::storage::WriteSession;

/// Write session opened on the target layer.
struct Bound<C: FeatureCodec> {
    layer: LayerId,
    collection: String,
    session: Box<dyn WriteSession<C>>,
}

/// Session that reads across all layers and writes to one of them.
///
/// The session starts unbound. The first write, commit, rollback or lock
/// binds it to the layer chosen with
/// [`with_write_layer()`](ViewWriteSession::with_write_layer), or to the
/// top-priority layer if none was chosen. From then on all writes go to
/// that layer's collection.
///
/// Reads go through the per-layer read sessions and do not see writes that
/// are not committed yet.
pub struct ViewWriteSession<C: FeatureCodec> {
    read: ViewReadSession<C>,
    write_layer: Option<LayerId>,
    bound: Option<Bound<C>>,
}

impl<C: FeatureCodec> ViewWriteSession<C> {
    pub(crate) fn new(read: ViewReadSession<C>) -> Self {
        Self {
            read,
            write_layer: None,
            bound: None,
        }
    }

    /// Selects the layer writes go to. Must be called before the first write.
    ///
    /// # Errors
    ///
    /// - [`ViewError::WriteLayerAlreadySelected`] if a layer was already
    ///   selected, explicitly or by binding to the default.
    /// - [`ViewError::UnknownLayer`] if `layer` is not part of the view.
    pub fn with_write_layer(&mut self, layer: LayerId) -> Result<&mut Self, ViewError> {
        if let Some(current) = self.write_layer {
            return Err(ViewError::WriteLayerAlreadySelected {
                current: current.index(),
            });
        }
        self.read.layers().layer(layer)?;
        self.write_layer = Some(layer);
        Ok(self)
    }

    /// Layer writes go to, once selected or bound.
    #[must_use]
    pub fn write_layer(&self) -> Option<LayerId> {
        self.write_layer
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    #[must_use]
    pub fn layers(&self) -> &LayerSet<C> {
        self.read.layers()
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        self.read.context()
    }

    /// The read side of this session.
    #[must_use]
    pub fn reader(&self) -> &ViewReadSession<C> {
        &self.read
    }

    fn bind(&mut self) -> Result<&Bound<C>, ViewError> {
        let bound = match self.bound.take() {
            Some(bound) => bound,
            None => self.open_write_session()?,
        };
        Ok(self.bound.insert(bound))
    }

    fn open_write_session(&mut self) -> Result<Bound<C>, ViewError> {
        let id = self.write_layer.unwrap_or(LayerId::TOP);
        let layer = self.read.layers().layer(id)?;
        let collection = layer.collection_id().to_string();
        let session = layer
            .storage()
            .new_write_session(self.read.context(), true)
            .map_err(|source| ViewError::Layer {
                layer: id.index(),
                collection: collection.clone(),
                source,
            })?;

        // Carry over the settings of the layer's read session.
        let reader = self.read.session(id)?;
        session.set_fetch_size(reader.fetch_size());
        session.set_statement_timeout(reader.statement_timeout());
        session.set_lock_timeout(reader.lock_timeout());

        debug!(layer = %id, collection = %collection, "write session bound");
        self.write_layer = Some(id);
        Ok(Bound {
            layer: id,
            collection,
            session,
        })
    }

    fn layer_error(bound: &Bound<C>, source: anyhow::Error) -> ViewError {
        ViewError::Layer {
            layer: bound.layer.index(),
            collection: bound.collection.clone(),
            source,
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Executes a feature write on the write layer.
    ///
    /// The request's collection is replaced with the write layer's
    /// collection. Answers of the storage, including error results, are
    /// returned as they are.
    ///
    /// # Errors
    ///
    /// - [`ViewError::UnsupportedRequest`] for anything but
    ///   [`WriteRequest::Features`], before any storage is contacted.
    /// - [`ViewError::Layer`] if the storage fails.
    pub async fn execute_write(
        &mut self,
        request: &WriteRequest,
    ) -> Result<StorageResult<C>, ViewError> {
        let WriteRequest::Features(write) = request else {
            return Err(ViewError::UnsupportedRequest {
                kind: request.kind(),
                supported: "WriteFeatures",
            });
        };
        let bound = self.bind()?;
        let mut write = write.clone();
        write.collection_id.clone_from(&bound.collection);
        debug!(layer = %bound.layer, ops = write.ops.len(), "executing write");
        bound
            .session
            .execute_write(&WriteRequest::Features(write))
            .await
            .map_err(|source| Self::layer_error(bound, source))
    }

    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if the storage fails to commit.
    pub async fn commit(&mut self, auto_close_cursors: bool) -> Result<(), ViewError> {
        let bound = self.bind()?;
        bound
            .session
            .commit(auto_close_cursors)
            .await
            .map_err(|source| Self::layer_error(bound, source))
    }

    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if the storage fails to roll back.
    pub async fn rollback(&mut self, auto_close_cursors: bool) -> Result<(), ViewError> {
        let bound = self.bind()?;
        bound
            .session
            .rollback(auto_close_cursors)
            .await
            .map_err(|source| Self::layer_error(bound, source))
    }

    /// Acquires an advisory lock on the write layer.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if the lock is not acquired in time.
    pub async fn lock(&mut self, lock_id: &str, timeout: Duration) -> Result<(), ViewError> {
        let bound = self.bind()?;
        bound
            .session
            .lock(lock_id, timeout)
            .await
            .map_err(|source| Self::layer_error(bound, source))
    }

    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if the storage fails to unlock.
    pub async fn unlock(&mut self, lock_id: &str) -> Result<(), ViewError> {
        let bound = self.bind()?;
        bound
            .session
            .unlock(lock_id)
            .await
            .map_err(|source| Self::layer_error(bound, source))
    }

    // -----------------------------------------------------------------------
    // Reads and settings, across all layers
    // -----------------------------------------------------------------------

    /// See [`ViewReadSession::execute()`].
    ///
    /// # Errors
    ///
    /// See [`ViewReadSession::execute_with()`].
    pub async fn execute(&self, request: &ReadRequest) -> Result<StorageResult<C>, ViewError> {
        self.read.execute(request).await
    }

    /// See [`ViewReadSession::execute_with()`].
    ///
    /// # Errors
    ///
    /// See [`ViewReadSession::execute_with()`].
    pub async fn execute_with<M, R>(
        &self,
        request: &ReadRequest,
        merge: &M,
        resolver: &R,
    ) -> Result<StorageResult<C>, ViewError>
    where
        M: MergeOperation<C> + ?Sized,
        R: MissingIdResolver<C> + ?Sized,
    {
        self.read.execute_with(request, merge, resolver).await
    }

    pub fn process(&self, notification: &Notification) -> StorageResult<C> {
        self.read.process(notification)
    }

    #[must_use]
    pub fn is_master_connect(&self) -> bool {
        self.read.is_master_connect()
    }

    #[must_use]
    pub fn fetch_size(&self) -> usize {
        self.read.fetch_size()
    }

    pub fn set_fetch_size(&self, size: usize) {
        self.read.set_fetch_size(size);
        if let Some(bound) = &self.bound {
            bound.session.set_fetch_size(size);
        }
    }

    #[must_use]
    pub fn statement_timeout(&self) -> Duration {
        self.read.statement_timeout()
    }

    pub fn set_statement_timeout(&self, timeout: Duration) {
        self.read.set_statement_timeout(timeout);
        if let Some(bound) = &self.bound {
            bound.session.set_statement_timeout(timeout);
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.read.lock_timeout()
    }

    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.read.set_lock_timeout(timeout);
        if let Some(bound) = &self.bound {
            bound.session.set_lock_timeout(timeout);
        }
    }

    /// Closes the write session, if bound, and all read sessions.
    ///
    /// # Errors
    ///
    /// Returns the write session's failure first, otherwise the first
    /// failure of the read sessions.
    pub async fn close(&mut self) -> Result<(), ViewError> {
        let write_result = match self.bound.take() {
            Some(bound) => bound.session.close().await.map_err(|source| {
                warn!(layer = %bound.layer, error = %source, "failed to close write session");
                Self::layer_error(&bound, source)
            }),
            None => Ok(()),
        };
        let read_result = self.read.close().await;
        write_result.and(read_result)
    }
}
