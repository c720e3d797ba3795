//! Storage wrapper for view tests: records what the view sends to each layer
//! and can be told to misbehave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use featureview_core::{
    ErrorCode, Feature, FeatureRow, Notification, ReadFeatures, ReadRequest, RequestContext,
    StorageResult, WriteFeatures, WriteRequest,
};
use parking_lot::Mutex;

use super::{View, ViewLayer};
use crate::storage::{MemoryStorage, ReadSession, Storage, WriteSession};

/// How sessions of a [`RecordingStorage`] answer reads and writes.
#[derive(Debug, Clone, Default)]
pub enum Behavior {
    #[default]
    Normal,
    /// Answer normally after a delay.
    Delay(Duration),
    /// Fail with the given message.
    Fail(String),
    /// Answer with an error result carrying the code.
    Answer(ErrorCode),
}

type Settings = (usize, Duration, Duration);

#[derive(Default)]
struct Recorder {
    behavior: Mutex<Behavior>,
    reads: Mutex<Vec<ReadFeatures>>,
    writes: Mutex<Vec<WriteFeatures>>,
    write_sessions: AtomicUsize,
    closed: AtomicUsize,
    close_failure: Mutex<Option<String>>,
    open_failure: Mutex<Option<String>>,
    last_read_session: Mutex<Option<Arc<dyn ReadSession<FeatureRow>>>>,
    last_write_session: Mutex<Option<Arc<dyn WriteSession<FeatureRow>>>>,
}

impl Recorder {
    fn behavior(&self) -> Behavior {
        self.behavior.lock().clone()
    }

    async fn misbehave(&self) -> anyhow::Result<Option<StorageResult<FeatureRow>>> {
        match self.behavior() {
            Behavior::Normal => Ok(None),
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            Behavior::Fail(message) => Err(anyhow::anyhow!(message)),
            Behavior::Answer(code) => Ok(Some(StorageResult::error(code, "injected"))),
        }
    }

    fn refuse_open(&self) -> anyhow::Result<()> {
        match self.open_failure.lock().clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        match self.close_failure.lock().clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

fn settings_of<S: ReadSession<FeatureRow> + ?Sized>(session: &S) -> Settings {
    (
        session.fetch_size(),
        session.statement_timeout(),
        session.lock_timeout(),
    )
}

/// [`MemoryStorage`] that records every request its sessions receive.
#[derive(Clone)]
pub struct RecordingStorage {
    inner: MemoryStorage,
    recorder: Arc<Recorder>,
}

impl RecordingStorage {
    pub fn with_features(id: &str, collection: &str, features: Vec<Feature>) -> Self {
        let inner = MemoryStorage::new(id);
        inner.insert(collection, features);
        Self {
            inner,
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn memory(&self) -> &MemoryStorage {
        &self.inner
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.recorder.behavior.lock() = behavior;
    }

    pub fn set_close_failure(&self, message: &str) {
        *self.recorder.close_failure.lock() = Some(message.to_string());
    }

    /// Makes `new_read_session` and `new_write_session` fail.
    pub fn set_open_failure(&self, message: &str) {
        *self.recorder.open_failure.lock() = Some(message.to_string());
    }

    pub fn read_calls(&self) -> usize {
        self.recorder.reads.lock().len()
    }

    pub fn last_read(&self) -> Option<ReadFeatures> {
        self.recorder.reads.lock().last().cloned()
    }

    pub fn write_calls(&self) -> usize {
        self.recorder.writes.lock().len()
    }

    pub fn last_write(&self) -> Option<WriteFeatures> {
        self.recorder.writes.lock().last().cloned()
    }

    pub fn write_sessions(&self) -> usize {
        self.recorder.write_sessions.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.recorder.closed.load(Ordering::SeqCst)
    }

    /// Fetch size, statement timeout and lock timeout of the newest read
    /// session.
    pub fn last_session_settings(&self) -> Option<Settings> {
        self.recorder
            .last_read_session
            .lock()
            .as_ref()
            .map(|s| settings_of(s.as_ref()))
    }

    pub fn last_write_session_settings(&self) -> Option<Settings> {
        self.recorder
            .last_write_session
            .lock()
            .as_ref()
            .map(|s| settings_of(s.as_ref()))
    }
}

impl Storage<FeatureRow> for RecordingStorage {
    fn id(&self) -> &str {
        Storage::id(&self.inner)
    }

    fn new_read_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> anyhow::Result<Arc<dyn ReadSession<FeatureRow>>> {
        self.recorder.refuse_open()?;
        let inner = self.inner.new_read_session(ctx, use_master)?;
        *self.recorder.last_read_session.lock() = Some(Arc::clone(&inner));
        Ok(Arc::new(RecordingSession {
            inner,
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn new_write_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> anyhow::Result<Box<dyn WriteSession<FeatureRow>>> {
        self.recorder.refuse_open()?;
        let inner: Arc<dyn WriteSession<FeatureRow>> =
            Arc::from(self.inner.new_write_session(ctx, use_master)?);
        self.recorder.write_sessions.fetch_add(1, Ordering::SeqCst);
        *self.recorder.last_write_session.lock() = Some(Arc::clone(&inner));
        Ok(Box::new(RecordingWriteSession {
            inner,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct RecordingSession {
    inner: Arc<dyn ReadSession<FeatureRow>>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ReadSession<FeatureRow> for RecordingSession {
    fn context(&self) -> &RequestContext {
        self.inner.context()
    }

    fn is_master_connect(&self) -> bool {
        self.inner.is_master_connect()
    }

    fn fetch_size(&self) -> usize {
        self.inner.fetch_size()
    }

    fn set_fetch_size(&self, size: usize) {
        self.inner.set_fetch_size(size);
    }

    fn statement_timeout(&self) -> Duration {
        self.inner.statement_timeout()
    }

    fn set_statement_timeout(&self, timeout: Duration) {
        self.inner.set_statement_timeout(timeout);
    }

    fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout()
    }

    fn set_lock_timeout(&self, timeout: Duration) {
        self.inner.set_lock_timeout(timeout);
    }

    async fn execute(&self, request: &ReadRequest) -> anyhow::Result<StorageResult<FeatureRow>> {
        if let ReadRequest::Features(read) = request {
            self.recorder.reads.lock().push(read.clone());
        }
        if let Some(answer) = self.recorder.misbehave().await? {
            return Ok(answer);
        }
        self.inner.execute(request).await
    }

    async fn process(
        &self,
        notification: &Notification,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        self.inner.process(notification).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.recorder.close()?;
        self.inner.close().await
    }
}

struct RecordingWriteSession {
    inner: Arc<dyn WriteSession<FeatureRow>>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ReadSession<FeatureRow> for RecordingWriteSession {
    fn context(&self) -> &RequestContext {
        self.inner.context()
    }

    fn is_master_connect(&self) -> bool {
        self.inner.is_master_connect()
    }

    fn fetch_size(&self) -> usize {
        self.inner.fetch_size()
    }

    fn set_fetch_size(&self, size: usize) {
        self.inner.set_fetch_size(size);
    }

    fn statement_timeout(&self) -> Duration {
        self.inner.statement_timeout()
    }

    fn set_statement_timeout(&self, timeout: Duration) {
        self.inner.set_statement_timeout(timeout);
    }

    fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout()
    }

    fn set_lock_timeout(&self, timeout: Duration) {
        self.inner.set_lock_timeout(timeout);
    }

    async fn execute(&self, request: &ReadRequest) -> anyhow::Result<StorageResult<FeatureRow>> {
        self.inner.execute(request).await
    }

    async fn process(
        &self,
        notification: &Notification,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        self.inner.process(notification).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.recorder.close()?;
        self.inner.close().await
    }
}

#[async_trait]
impl WriteSession<FeatureRow> for RecordingWriteSession {
    async fn execute_write(
        &self,
        request: &WriteRequest,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        if let WriteRequest::Features(write) = request {
            self.recorder.writes.lock().push(write.clone());
        }
        if let Some(answer) = self.recorder.misbehave().await? {
            return Ok(answer);
        }
        self.inner.execute_write(request).await
    }

    async fn commit(&self, auto_close_cursors: bool) -> anyhow::Result<()> {
        self.inner.commit(auto_close_cursors).await
    }

    async fn rollback(&self, auto_close_cursors: bool) -> anyhow::Result<()> {
        self.inner.rollback(auto_close_cursors).await
    }

    async fn lock(&self, lock_id: &str, timeout: Duration) -> anyhow::Result<()> {
        self.inner.lock(lock_id, timeout).await
    }

    async fn unlock(&self, lock_id: &str) -> anyhow::Result<()> {
        self.inner.unlock(lock_id).await
    }
}

/// View over three recording storages `a`, `b`, `c` (priorities 0, 1, 2),
/// bound to collections `a-coll`, `b-coll`, `c-coll`.
pub fn three_layer_view(
    a: Vec<Feature>,
    b: Vec<Feature>,
    c: Vec<Feature>,
) -> (View<FeatureRow>, [RecordingStorage; 3]) {
    let storages = [
        RecordingStorage::with_features("a", "a-coll", a),
        RecordingStorage::with_features("b", "b-coll", b),
        RecordingStorage::with_features("c", "c-coll", c),
    ];
    let layers = storages
        .iter()
        .map(|s| {
            let collection = format!("{}-coll", Storage::id(s));
            ViewLayer::<FeatureRow>::new(Arc::new(s.clone()), collection)
        })
        .collect();
    let view = View::new("test-view", layers).unwrap();
    (view, storages)
}
