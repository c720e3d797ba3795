//! Storage and session traits consumed by the view.
//!
//! A [`Storage`] opens sessions; a [`ReadSession`] executes read requests and
//! carries per-session settings; a [`WriteSession`] additionally executes
//! writes inside a transaction. The view never looks behind these traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use featureview_core::{
    FeatureCodec, Notification, ReadRequest, RequestContext, StorageResult, WriteRequest,
};

/// Pluggable storage backend producing rows of type `C`.
///
/// Used as `Arc<dyn Storage<C>>`; one instance may back several layers.
pub trait Storage<C: FeatureCodec>: Send + Sync {
    /// Stable identifier of the storage, used in logs.
    fn id(&self) -> &str;

    /// Opens a new read session.
    ///
    /// `use_master` asks for a connection to the primary instead of a replica.
    fn new_read_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> anyhow::Result<Arc<dyn ReadSession<C>>>;

    /// Opens a new write session (always against the primary).
    fn new_write_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> anyhow::Result<Box<dyn WriteSession<C>>>;
}

/// Read session against one storage.
///
/// Sessions are shared with concurrently running scatter tasks, so every
/// method takes `&self`.
#[async_trait]
pub trait ReadSession<C: FeatureCodec>: Send + Sync {
    /// Context the session was opened with.
    fn context(&self) -> &RequestContext;

    /// Whether the session is connected to the primary instance.
    fn is_master_connect(&self) -> bool;

    /// Number of rows fetched per round trip.
    fn fetch_size(&self) -> usize;

    fn set_fetch_size(&self, size: usize);

    /// Maximum time a single statement may run.
    fn statement_timeout(&self) -> Duration;

    fn set_statement_timeout(&self, timeout: Duration);

    /// Maximum time to wait for a lock.
    fn lock_timeout(&self) -> Duration;

    fn set_lock_timeout(&self, timeout: Duration);

    /// Executes a read request.
    ///
    /// `Err` signals a transport or storage failure; a request the storage
    /// understood but refused is answered with `StorageResult::Error`.
    async fn execute(&self, request: &ReadRequest) -> anyhow::Result<StorageResult<C>>;

    /// Processes a change notification.
    async fn process(&self, notification: &Notification) -> anyhow::Result<StorageResult<C>>;

    /// Releases the session. Further calls are undefined.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Transactional write session against one storage.
#[async_trait]
pub trait WriteSession<C: FeatureCodec>: ReadSession<C> {
    /// Executes a write request inside the current transaction.
    async fn execute_write(&self, request: &WriteRequest) -> anyhow::Result<StorageResult<C>>;

    /// Commits the current transaction.
    async fn commit(&self, auto_close_cursors: bool) -> anyhow::Result<()>;

    /// Rolls back the current transaction.
    async fn rollback(&self, auto_close_cursors: bool) -> anyhow::Result<()>;

    /// Acquires an advisory lock, waiting at most `timeout`.
    async fn lock(&self, lock_id: &str, timeout: Duration) -> anyhow::Result<()>;

    /// Releases an advisory lock held by this session.
    async fn unlock(&self, lock_id: &str) -> anyhow::Result<()>;
}
