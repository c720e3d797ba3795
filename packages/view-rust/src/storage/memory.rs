//! In-memory [`Storage`] implementation backed by [`DashMap`].
//!
//! Provides concurrent read/write access without external locking. Write
//! sessions stage their changes privately until `commit()`. Suitable for
//! development, tests and the command line tool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use featureview_core::{
    EWriteOp, ErrorCode, ExecutedOp, Feature, FeatureRow, Notification, ReadCollections,
    ReadFeatures, ReadRequest, RequestContext, StorageResult, WriteCollections, WriteFeatures,
    WriteRequest,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::session::{ReadSession, Storage, WriteSession};

const DEFAULT_FETCH_SIZE: usize = 1000;
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Staged change of one feature: `None` = deleted.
type Overlay = BTreeMap<(String, String), Option<Feature>>;

struct Shared {
    collections: DashMap<String, DashMap<String, Feature>>,
    reads: DashMap<String, u64>,
    writes: DashMap<String, u64>,
    /// lock id -> owning session id
    locks: DashMap<String, String>,
}

/// In-memory multi-collection feature storage.
///
/// Cloning is cheap and yields a handle to the same data.
#[derive(Clone)]
pub struct MemoryStorage {
    id: String,
    shared: Arc<Shared>,
}

impl MemoryStorage {
    /// Creates a new, empty storage.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shared: Arc::new(Shared {
                collections: DashMap::new(),
                reads: DashMap::new(),
                writes: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }

    /// Creates the collection if it does not exist yet.
    pub fn create_collection(&self, collection: &str) {
        self.shared
            .collections
            .entry(collection.to_string())
            .or_default();
    }

    /// Inserts features directly, bypassing sessions. Creates the collection.
    pub fn insert<I>(&self, collection: &str, features: I)
    where
        I: IntoIterator<Item = Feature>,
    {
        let entries = self
            .shared
            .collections
            .entry(collection.to_string())
            .or_default();
        for feature in features {
            entries.insert(feature.id.clone(), feature);
        }
    }

    /// Committed feature by id.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Feature> {
        self.shared
            .collections
            .get(collection)
            .and_then(|c| c.get(id).map(|f| f.clone()))
    }

    /// Number of committed features in a collection (0 if it does not exist).
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.shared.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Number of read requests executed against `collection`.
    #[must_use]
    pub fn read_count(&self, collection: &str) -> u64 {
        self.shared.reads.get(collection).map_or(0, |c| *c)
    }

    /// Number of write requests executed against `collection`.
    #[must_use]
    pub fn write_count(&self, collection: &str) -> u64 {
        self.shared.writes.get(collection).map_or(0, |c| *c)
    }

    fn open(&self, ctx: &RequestContext, use_master: bool) -> MemoryReadSession {
        MemoryReadSession {
            shared: self.shared.clone(),
            ctx: ctx.clone(),
            master: use_master,
            settings: Mutex::new(SessionSettings::default()),
        }
    }
}

impl Storage<FeatureRow> for MemoryStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn new_read_session(
        &self,
        ctx: &RequestContext,
        use_master: bool,
    ) -> anyhow::Result<Arc<dyn ReadSession<FeatureRow>>> {
        Ok(Arc::new(self.open(ctx, use_master)))
    }

    fn new_write_session(
        &self,
        ctx: &RequestContext,
        _use_master: bool,
    ) -> anyhow::Result<Box<dyn WriteSession<FeatureRow>>> {
        Ok(Box::new(MemoryWriteSession {
            base: self.open(ctx, true),
            session_id: uuid::Uuid::new_v4().to_string(),
            overlay: Mutex::new(Overlay::new()),
        }))
    }
}

// ---------------------------------------------------------------------------
// Read session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SessionSettings {
    fetch_size: usize,
    statement_timeout: Duration,
    lock_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Read session over a [`MemoryStorage`].
pub struct MemoryReadSession {
    shared: Arc<Shared>,
    ctx: RequestContext,
    master: bool,
    settings: Mutex<SessionSettings>,
}

impl MemoryReadSession {
    fn read(&self, request: &ReadRequest, overlay: Option<&Overlay>) -> StorageResult<FeatureRow> {
        match request {
            ReadRequest::Features(read) => self.read_features(read, overlay),
            ReadRequest::Collections(read) => self.read_collections(read),
        }
    }

    fn read_features(
        &self,
        request: &ReadFeatures,
        overlay: Option<&Overlay>,
    ) -> StorageResult<FeatureRow> {
        if request.collections.is_empty() {
            return StorageResult::error(ErrorCode::IllegalArgument, "no collection given");
        }
        let mut rows = Vec::new();
        for collection in &request.collections {
            *self.shared.reads.entry(collection.clone()).or_insert(0) += 1;
            let Some(features) = visible_features(&self.shared, collection, overlay) else {
                return StorageResult::error(
                    ErrorCode::NotFound,
                    format!("collection {collection} does not exist"),
                );
            };
            rows.extend(
                features
                    .into_values()
                    .filter(|f| request.matches(f))
                    .map(|f| FeatureRow::read(collection.clone(), f)),
            );
        }
        rows.sort_by(|a, b| a.feature.id.cmp(&b.feature.id));
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        StorageResult::success(rows)
    }

    fn read_collections(&self, request: &ReadCollections) -> StorageResult<FeatureRow> {
        let mut rows: Vec<FeatureRow> = self
            .shared
            .collections
            .iter()
            .filter(|c| request.ids.is_empty() || request.ids.contains(c.key()))
            .map(|c| FeatureRow::read(c.key().clone(), Feature::new(c.key().clone())))
            .collect();
        rows.sort_by(|a, b| a.feature.id.cmp(&b.feature.id));
        StorageResult::success(rows)
    }
}

/// Committed features of a collection with the staged overlay applied.
/// `None` if the collection does not exist.
fn visible_features(
    shared: &Shared,
    collection: &str,
    overlay: Option<&Overlay>,
) -> Option<BTreeMap<String, Feature>> {
    let committed = shared.collections.get(collection)?;
    let mut features: BTreeMap<String, Feature> = committed
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    drop(committed);
    if let Some(overlay) = overlay {
        for ((coll, id), change) in overlay {
            if coll != collection {
                continue;
            }
            match change {
                Some(feature) => {
                    features.insert(id.clone(), feature.clone());
                }
                None => {
                    features.remove(id);
                }
            }
        }
    }
    Some(features)
}

#[async_trait]
impl ReadSession<FeatureRow> for MemoryReadSession {
    fn context(&self) -> &RequestContext {
        &self.ctx
    }

    fn is_master_connect(&self) -> bool {
        self.master
    }

    fn fetch_size(&self) -> usize {
        self.settings.lock().fetch_size
    }

    fn set_fetch_size(&self, size: usize) {
        self.settings.lock().fetch_size = size;
    }

    fn statement_timeout(&self) -> Duration {
        self.settings.lock().statement_timeout
    }

    fn set_statement_timeout(&self, timeout: Duration) {
        self.settings.lock().statement_timeout = timeout;
    }

    fn lock_timeout(&self) -> Duration {
        self.settings.lock().lock_timeout
    }

    fn set_lock_timeout(&self, timeout: Duration) {
        self.settings.lock().lock_timeout = timeout;
    }

    async fn execute(&self, request: &ReadRequest) -> anyhow::Result<StorageResult<FeatureRow>> {
        Ok(self.read(request, None))
    }

    async fn process(
        &self,
        _notification: &Notification,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        Ok(StorageResult::success(Vec::new()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write session
// ---------------------------------------------------------------------------

/// Write session over a [`MemoryStorage`].
///
/// Feature writes are staged in a private overlay that reads through this
/// session observe; `commit()` publishes them, `rollback()` discards them.
/// Collection writes take effect immediately.
pub struct MemoryWriteSession {
    base: MemoryReadSession,
    session_id: String,
    overlay: Mutex<Overlay>,
}

impl MemoryWriteSession {
    fn write_features(&self, request: &WriteFeatures) -> StorageResult<FeatureRow> {
        let collection = &request.collection_id;
        let shared = &self.base.shared;
        let mut overlay = self.overlay.lock();
        let Some(mut visible) = visible_features(shared, collection, Some(&*overlay)) else {
            return StorageResult::error(
                ErrorCode::NotFound,
                format!("collection {collection} does not exist"),
            );
        };
        *shared.writes.entry(collection.clone()).or_insert(0) += 1;

        // Validate and stage against a private copy so a failing op leaves
        // the session overlay untouched.
        let mut staged: Vec<(String, Option<Feature>)> = Vec::with_capacity(request.ops.len());
        let mut rows = Vec::with_capacity(request.ops.len());
        for write in &request.ops {
            let id = write.feature.id.clone();
            let exists = visible.contains_key(&id);
            let executed = match write.op {
                EWriteOp::Create if exists => {
                    return StorageResult::error(
                        ErrorCode::Conflict,
                        format!("feature {id} already exists in {collection}"),
                    );
                }
                EWriteOp::Update if !exists => {
                    return StorageResult::error(
                        ErrorCode::NotFound,
                        format!("feature {id} does not exist in {collection}"),
                    );
                }
                EWriteOp::Create => ExecutedOp::Created,
                EWriteOp::Put if exists => ExecutedOp::Updated,
                EWriteOp::Put => ExecutedOp::Created,
                EWriteOp::Update => ExecutedOp::Updated,
                EWriteOp::Delete if !exists => ExecutedOp::Retained,
                EWriteOp::Delete => ExecutedOp::Deleted,
                EWriteOp::Purge => ExecutedOp::Purged,
            };
            match executed {
                ExecutedOp::Created | ExecutedOp::Updated => {
                    let mut feature = write.feature.clone();
                    feature.uuid = Some(uuid::Uuid::new_v4().to_string());
                    feature.app_id = Some(self.base.ctx.app_id.clone());
                    feature.author.clone_from(&self.base.ctx.author);
                    visible.insert(id.clone(), feature.clone());
                    staged.push((id, Some(feature.clone())));
                    rows.push(FeatureRow::read(collection.clone(), feature).with_op(executed));
                }
                ExecutedOp::Deleted | ExecutedOp::Purged => {
                    let removed = visible.remove(&id).unwrap_or_else(|| write.feature.clone());
                    staged.push((id, None));
                    rows.push(FeatureRow::read(collection.clone(), removed).with_op(executed));
                }
                ExecutedOp::Retained | ExecutedOp::Read => {
                    rows.push(
                        FeatureRow::read(collection.clone(), write.feature.clone())
                            .with_op(executed),
                    );
                }
            }
        }
        for (id, change) in staged {
            overlay.insert((collection.clone(), id), change);
        }
        StorageResult::success(rows)
    }

    fn write_collections(&self, request: &WriteCollections) -> StorageResult<FeatureRow> {
        let shared = &self.base.shared;
        let mut rows = Vec::new();
        for name in &request.create {
            if shared.collections.contains_key(name) {
                return StorageResult::error(
                    ErrorCode::Conflict,
                    format!("collection {name} already exists"),
                );
            }
            shared.collections.insert(name.clone(), DashMap::new());
            rows.push(
                FeatureRow::read(name.clone(), Feature::new(name.clone()))
                    .with_op(ExecutedOp::Created),
            );
        }
        for name in &request.drop {
            if shared.collections.remove(name).is_some() {
                rows.push(
                    FeatureRow::read(name.clone(), Feature::new(name.clone()))
                        .with_op(ExecutedOp::Deleted),
                );
            }
        }
        StorageResult::success(rows)
    }

    fn release_locks(&self) {
        self.base
            .shared
            .locks
            .retain(|_, owner| *owner != self.session_id);
    }
}

#[async_trait]
impl ReadSession<FeatureRow> for MemoryWriteSession {
    fn context(&self) -> &RequestContext {
        self.base.context()
    }

    fn is_master_connect(&self) -> bool {
        true
    }

    fn fetch_size(&self) -> usize {
        self.base.fetch_size()
    }

    fn set_fetch_size(&self, size: usize) {
        self.base.set_fetch_size(size);
    }

    fn statement_timeout(&self) -> Duration {
        self.base.statement_timeout()
    }

    fn set_statement_timeout(&self, timeout: Duration) {
        self.base.set_statement_timeout(timeout);
    }

    fn lock_timeout(&self) -> Duration {
        self.base.lock_timeout()
    }

    fn set_lock_timeout(&self, timeout: Duration) {
        self.base.set_lock_timeout(timeout);
    }

    async fn execute(&self, request: &ReadRequest) -> anyhow::Result<StorageResult<FeatureRow>> {
        let overlay = self.overlay.lock();
        Ok(self.base.read(request, Some(&*overlay)))
    }

    async fn process(
        &self,
        notification: &Notification,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        self.base.process(notification).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.overlay.lock().clear();
        self.release_locks();
        Ok(())
    }
}

#[async_trait]
impl WriteSession<FeatureRow> for MemoryWriteSession {
    async fn execute_write(
        &self,
        request: &WriteRequest,
    ) -> anyhow::Result<StorageResult<FeatureRow>> {
        Ok(match request {
            WriteRequest::Features(write) => self.write_features(write),
            WriteRequest::Collections(write) => self.write_collections(write),
        })
    }

    async fn commit(&self, _auto_close_cursors: bool) -> anyhow::Result<()> {
        let mut overlay = self.overlay.lock();
        // All or nothing: a dropped collection fails the commit before any
        // change is published, and the staged changes stay for rollback.
        if let Some((collection, _)) = overlay
            .keys()
            .find(|(collection, _)| !self.base.shared.collections.contains_key(collection))
        {
            anyhow::bail!("collection {collection} was dropped before commit");
        }
        for ((collection, id), change) in std::mem::take(&mut *overlay) {
            let Some(features) = self.base.shared.collections.get(&collection) else {
                anyhow::bail!("collection {collection} was dropped during commit");
            };
            match change {
                Some(feature) => {
                    features.insert(id, feature);
                }
                None => {
                    features.remove(&id);
                }
            }
        }
        self.release_locks();
        Ok(())
    }

    async fn rollback(&self, _auto_close_cursors: bool) -> anyhow::Result<()> {
        self.overlay.lock().clear();
        self.release_locks();
        Ok(())
    }

    async fn lock(&self, lock_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let acquired = match self.base.shared.locks.entry(lock_id.to_string()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(self.session_id.clone());
                    true
                }
                Entry::Occupied(occupied) => occupied.get() == &self.session_id,
            };
            if acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timed out after {timeout:?} waiting for lock {lock_id}");
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, lock_id: &str) -> anyhow::Result<()> {
        self.base
            .shared
            .locks
            .remove_if(lock_id, |_, owner| owner == &self.session_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
