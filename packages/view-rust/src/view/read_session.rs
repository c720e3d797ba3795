//! Read orchestrator: scatter, backfill, merge.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use featureview_core::{
    ErrorCode, FeatureCodec, Notification, POp, POpType, PRef, ReadFeatures, ReadRequest,
    RequestContext, StorageResult,
};
use futures_util::future::join_all;
use tracing::{debug, info_span, warn, Instrument};

use super::executor::{CorrelationMap, LayerReadRequest, ScatterGatherExecutor};
use super::layer::{LayerId, LayerSet};
use super::merge::{MergeByStoragePriority, MergeOperation};
use super::missing::{MissingIdResolver, ObligatoryLayersResolver};
use crate::config::ViewConfig;
use crate::error::ViewError;
use crate::storage::ReadSession;

/// Read session over all layers of a view.
///
/// Owns one storage read session per layer for its whole lifetime. Settings
/// are applied to every sub-session; getters report the top layer's value.
pub struct ViewReadSession<C: FeatureCodec> {
    layers: Arc<LayerSet<C>>,
    /// One per layer, same order as `layers`.
    sessions: Vec<Arc<dyn ReadSession<C>>>,
    executor: Arc<ScatterGatherExecutor>,
    ctx: RequestContext,
    master: bool,
}

impl<C: FeatureCodec> ViewReadSession<C> {
    /// Opens one read session per layer and applies the configured settings.
    ///
    /// Sub-sessions live and die together: if one layer refuses to open,
    /// the sessions already opened are closed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Layer`] if a storage refuses to open a session.
    pub async fn open(
        layers: Arc<LayerSet<C>>,
        executor: Arc<ScatterGatherExecutor>,
        config: &ViewConfig,
        ctx: &RequestContext,
        use_master: bool,
    ) -> Result<Self, ViewError> {
        let mut sessions: Vec<Arc<dyn ReadSession<C>>> = Vec::with_capacity(layers.len());
        for (id, layer) in layers.iter() {
            match layer.storage().new_read_session(ctx, use_master) {
                Ok(session) => {
                    apply_settings(session.as_ref(), config);
                    sessions.push(session);
                }
                Err(source) => {
                    warn!(layer = %id, error = %source, "failed to open layer session");
                    close_opened(&layers, &sessions).await;
                    return Err(ViewError::Layer {
                        layer: id.index(),
                        collection: layer.collection_id().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(Self {
            layers,
            sessions,
            executor,
            ctx: ctx.clone(),
            master: use_master,
        })
    }

    #[must_use]
    pub fn layers(&self) -> &Arc<LayerSet<C>> {
        &self.layers
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    #[must_use]
    pub fn is_master_connect(&self) -> bool {
        self.master
    }

    /// Sub-session of one layer.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::UnknownLayer`] if `id` is not a layer of the view.
    pub fn session(&self, id: LayerId) -> Result<&Arc<dyn ReadSession<C>>, ViewError> {
        self.sessions.get(id.index()).ok_or(ViewError::UnknownLayer {
            index: id.index(),
            len: self.sessions.len(),
        })
    }

    fn top(&self) -> &Arc<dyn ReadSession<C>> {
        // Layer sets are never empty.
        &self.sessions[LayerId::TOP.index()]
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn fetch_size(&self) -> usize {
        self.top().fetch_size()
    }

    pub fn set_fetch_size(&self, size: usize) {
        for session in &self.sessions {
            session.set_fetch_size(size);
        }
    }

    #[must_use]
    pub fn statement_timeout(&self) -> Duration {
        self.top().statement_timeout()
    }

    pub fn set_statement_timeout(&self, timeout: Duration) {
        for session in &self.sessions {
            session.set_statement_timeout(timeout);
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.top().lock_timeout()
    }

    pub fn set_lock_timeout(&self, timeout: Duration) {
        for session in &self.sessions {
            session.set_lock_timeout(timeout);
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Executes a read with the default strategies: the top layer is
    /// obligatory and the highest-priority row wins.
    ///
    /// # Errors
    ///
    /// See [`execute_with()`](ViewReadSession::execute_with).
    pub async fn execute(&self, request: &ReadRequest) -> Result<StorageResult<C>, ViewError> {
        self.execute_with(
            request,
            &MergeByStoragePriority,
            &ObligatoryLayersResolver::top_layer(),
        )
        .await
    }

    /// Executes a read across all layers.
    ///
    /// Every layer is queried with the same filters against its own
    /// collection. Unless the request only selects by id, features the
    /// `resolver` reports as missing are then looked up by id in one second
    /// round. Finally `merge` reduces the rows of each feature to one.
    /// Features are returned ordered by id.
    ///
    /// # Errors
    ///
    /// - [`ViewError::UnsupportedRequest`] for anything but
    ///   [`ReadRequest::Features`], before any storage is contacted.
    /// - Any error of [`ScatterGatherExecutor::query_in_parallel`].
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
        let ReadRequest::Features(read) = request else {
            return Err(ViewError::UnsupportedRequest {
                kind: request.kind(),
                supported: "ReadFeatures",
            });
        };

        let span = info_span!(
            "view_read",
            view = %self.layers.name(),
            layers = self.layers.len(),
            stream = %self.ctx.stream_id,
        );
        async move {
            let mut requests = Vec::with_capacity(self.layers.len());
            for (id, layer) in self.layers.iter() {
                requests.push(LayerReadRequest::new(
                    read.for_collection(layer.collection_id()),
                    id,
                    layer,
                    Arc::clone(self.session(id)?),
                ));
            }
            let mut correlated = self.executor.query_in_parallel(requests).await?;

            if is_request_only_by_id(read) {
                debug!("id-only request, backfill skipped");
            } else if !resolver.skip() {
                self.fetch_missing(&mut correlated, resolver).await?;
            }

            let rows: Vec<C> = correlated
                .into_values()
                .filter_map(|rows| merge.apply(rows))
                .collect();
            debug!(rows = rows.len(), "read merged");
            Ok::<_, ViewError>(StorageResult::success(rows))
        }
        .instrument(span)
        .await
    }

    /// Second round: searches the layers named by the resolver by id and
    /// adds what they return to `correlated`.
    async fn fetch_missing<R>(
        &self,
        correlated: &mut CorrelationMap<C>,
        resolver: &R,
    ) -> Result<(), ViewError>
    where
        R: MissingIdResolver<C> + ?Sized,
    {
        // One batched by-id query per layer.
        let mut missing: BTreeMap<LayerId, BTreeSet<String>> = BTreeMap::new();
        for rows in correlated.values() {
            let Some(pairs) = resolver.layers_to_search(rows) else {
                continue;
            };
            for (layer, id) in pairs {
                if self.layers.get(layer).is_some() {
                    missing.entry(layer).or_default().insert(id);
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let ids: usize = missing.values().map(BTreeSet::len).sum();
        debug!(layers = missing.len(), ids, "backfilling missing features");
        metrics::counter!("featureview_backfill_ids_total").increment(ids as u64);

        let mut requests = Vec::with_capacity(missing.len());
        for (id, feature_ids) in missing {
            let layer = self.layers.layer(id)?;
            requests.push(LayerReadRequest::new(
                ReadFeatures::by_ids(layer.collection_id(), feature_ids),
                id,
                layer,
                Arc::clone(self.session(id)?),
            ));
        }
        let found = self.executor.query_in_parallel(requests).await?;
        for (id, rows) in found {
            correlated.entry(id).or_default().extend(rows);
        }
        Ok(())
    }

    /// Notifications are not handled by views.
    pub fn process(&self, notification: &Notification) -> StorageResult<C> {
        debug!(?notification, "notification ignored by view");
        StorageResult::error(
            ErrorCode::NotImplemented,
            "views do not process notifications",
        )
    }

    /// Closes every sub-session, also when some fail to close.
    ///
    /// # Errors
    ///
    /// Returns the failure of the highest-priority layer that failed.
    pub async fn close(&self) -> Result<(), ViewError> {
        let results = join_all(self.sessions.iter().map(|s| s.close())).await;
        let mut first = None;
        for ((id, layer), result) in self.layers.iter().zip(results) {
            if let Err(source) = result {
                warn!(layer = %id, error = %source, "failed to close layer session");
                first.get_or_insert(ViewError::Layer {
                    layer: id.index(),
                    collection: layer.collection_id().to_string(),
                    source,
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Closes the sessions of a partially opened view session. Close failures
/// are logged; the open error is what the caller sees.
async fn close_opened<C: FeatureCodec>(
    layers: &LayerSet<C>,
    sessions: &[Arc<dyn ReadSession<C>>],
) {
    let results = join_all(sessions.iter().map(|s| s.close())).await;
    for ((id, _), result) in layers.iter().zip(results) {
        if let Err(error) = result {
            warn!(layer = %id, error = %error, "failed to close layer session");
        }
    }
}

fn apply_settings<C: FeatureCodec>(session: &dyn ReadSession<C>, config: &ViewConfig) {
    if let Some(size) = config.fetch_size {
        session.set_fetch_size(size);
    }
    if let Some(timeout) = config.statement_timeout {
        session.set_statement_timeout(timeout);
    }
    if let Some(timeout) = config.lock_timeout {
        session.set_lock_timeout(timeout);
    }
}

/// Whether the request selects features only by id equality.
///
/// True when there is no spatial filter and the property filter is built
/// solely from `Eq` on [`PRef::Id`] combined with `And`/`Or`. Equality on
/// the uuid, negation, or no property filter at all do not count.
#[must_use]
pub fn is_request_only_by_id(request: &ReadFeatures) -> bool {
    if request.spatial_op.is_some() {
        return false;
    }
    request.property_op.as_ref().is_some_and(is_id_only)
}

fn is_id_only(op: &POp) -> bool {
    match op.op {
        POpType::And | POpType::Or => op
            .children
            .as_deref()
            .is_some_and(|children| !children.is_empty() && children.iter().all(is_id_only)),
        POpType::Eq => matches!(op.pref, Some(PRef::Id)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use featureview_core::{BBox, Feature, FeatureRow, SOp};

    use super::*;
    use crate::config::LayerFailurePolicy;
    use crate::view::test_support::{three_layer_view, Behavior, RecordingStorage};
    use crate::view::{IgnoreMissingResolver, View, ViewLayer};

    fn ctx() -> RequestContext {
        RequestContext::new("read-test", "stream-7")
    }

    fn ids(result: StorageResult<FeatureRow>) -> Vec<String> {
        result
            .into_rows()
            .unwrap()
            .into_iter()
            .map(|r| r.feature.id)
            .collect()
    }

    fn all(collection: &str) -> ReadRequest {
        ReadRequest::from(ReadFeatures::new().add_collection(collection))
    }

    #[test]
    fn id_only_classification() {
        let by_ids = ReadFeatures::by_ids("c", ["a", "b"]);
        assert!(is_request_only_by_id(&by_ids));
        assert!(is_request_only_by_id(&ReadFeatures::by_id("c", "a")));

        let nested = ReadFeatures::new().with_property_op(POp::and(vec![
            POp::eq(PRef::Id, "a"),
            POp::or(vec![POp::eq(PRef::Id, "b"), POp::eq(PRef::Id, "c")]),
        ]));
        assert!(is_request_only_by_id(&nested));

        let with_uuid = ReadFeatures::new().with_property_op(POp::or(vec![
            POp::eq(PRef::Id, "a"),
            POp::eq(PRef::Uuid, "u-1"),
        ]));
        assert!(!is_request_only_by_id(&with_uuid));

        let negated = ReadFeatures::new().with_property_op(POp::not(POp::eq(PRef::Id, "a")));
        assert!(!is_request_only_by_id(&negated));

        let spatial = ReadFeatures::by_id("c", "a")
            .with_spatial_op(SOp::Intersects(BBox::new(0.0, 0.0, 1.0, 1.0)));
        assert!(!is_request_only_by_id(&spatial));

        assert!(!is_request_only_by_id(&ReadFeatures::new().add_collection("c")));
        assert!(!is_request_only_by_id(
            &ReadFeatures::new().with_property_op(POp::or(Vec::new()))
        ));
        assert!(!is_request_only_by_id(
            &ReadFeatures::new().with_property_op(POp::gt(PRef::Id, "a"))
        ));
    }

    #[tokio::test]
    async fn backfill_falls_back_to_next_priority() {
        // F only on B and C; A is obligatory and gets searched by id.
        let (view, [a, b, c]) = three_layer_view(
            vec![Feature::new("x")],
            vec![Feature::new("f").with_property("src", "b"), Feature::new("x")],
            vec![Feature::new("f").with_property("src", "c")],
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let rows = session
            .execute(&all("ignored"))
            .await
            .unwrap()
            .into_rows()
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].feature.id, "f");
        assert_eq!(rows[0].feature.properties.get("src"), Some(&"b".into()));
        assert_eq!(rows[0].collection.as_deref(), Some("b-coll"));
        assert_eq!(rows[1].collection.as_deref(), Some("a-coll"));

        // Scatter hit every layer once; only A got the backfill query.
        assert_eq!(a.read_calls(), 2);
        assert_eq!(b.read_calls(), 1);
        assert_eq!(c.read_calls(), 1);
        let backfill = a.last_read().unwrap();
        assert_eq!(backfill.collections, vec!["a-coll".to_string()]);
        assert!(is_request_only_by_id(&backfill));
        assert!(backfill.matches(&Feature::new("f")));
        assert!(!backfill.matches(&Feature::new("x")));
    }

    #[tokio::test]
    async fn backfill_finds_feature_outside_filter() {
        // The top layer holds F but outside the filter; the by-id round
        // brings its row in and it wins the merge.
        let (view, [a, _b, _c]) = three_layer_view(
            vec![Feature::new("f").with_property("lanes", 1_i64)],
            vec![Feature::new("f").with_property("lanes", 4_i64)],
            Vec::new(),
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let request = ReadRequest::from(
            ReadFeatures::new().with_property_op(POp::gt(PRef::property(["lanes"]), 2_i64)),
        );
        let rows = session.execute(&request).await.unwrap().into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].feature.properties.get("lanes"), Some(&1_i64.into()));
        assert_eq!(a.read_calls(), 2);
    }

    #[tokio::test]
    async fn no_backfill_when_top_layer_has_every_feature() {
        let (view, [a, b, c]) = three_layer_view(
            vec![Feature::new("f"), Feature::new("g")],
            vec![Feature::new("f")],
            vec![Feature::new("g")],
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        assert_eq!(ids(session.execute(&all("c")).await.unwrap()), vec!["f", "g"]);
        assert_eq!((a.read_calls(), b.read_calls(), c.read_calls()), (1, 1, 1));
    }

    #[tokio::test]
    async fn id_only_request_never_backfills() {
        let (view, [a, b, c]) = three_layer_view(
            Vec::new(),
            vec![Feature::new("f")],
            vec![Feature::new("g")],
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let request = ReadRequest::from(ReadFeatures::by_ids("any", ["f", "g"]));
        assert_eq!(ids(session.execute(&request).await.unwrap()), vec!["f", "g"]);
        assert_eq!((a.read_calls(), b.read_calls(), c.read_calls()), (1, 1, 1));
        // The per-layer request targets the layer's own collection.
        assert_eq!(b.last_read().unwrap().collections, vec!["b-coll".to_string()]);
    }

    #[tokio::test]
    async fn skipping_resolver_disables_backfill() {
        let (view, [a, _b, _c]) = three_layer_view(
            Vec::new(),
            vec![Feature::new("f")],
            Vec::new(),
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let result = session
            .execute_with(&all("c"), &MergeByStoragePriority, &IgnoreMissingResolver)
            .await
            .unwrap();
        assert_eq!(ids(result), vec!["f"]);
        assert_eq!(a.read_calls(), 1);
    }

    #[tokio::test]
    async fn custom_merge_can_drop_features() {
        let (view, _) = three_layer_view(
            vec![Feature::new("f"), Feature::new("g")],
            vec![Feature::new("f")],
            Vec::new(),
        );
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        // Keep only features present on more than one layer.
        let on_many = |rows: Vec<crate::view::LayerRow<FeatureRow>>| -> Option<FeatureRow> {
            (rows.len() > 1)
                .then(|| MergeByStoragePriority.apply(rows))
                .flatten()
        };
        let result = session
            .execute_with(&all("c"), &on_many, &IgnoreMissingResolver)
            .await
            .unwrap();
        assert_eq!(ids(result), vec!["f"]);
    }

    #[tokio::test]
    async fn unsupported_request_is_rejected_before_any_call() {
        let (view, [a, b, c]) = three_layer_view(Vec::new(), Vec::new(), Vec::new());
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let err = session
            .execute(&ReadRequest::Collections(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ViewError::UnsupportedRequest {
                kind: "ReadCollections",
                ..
            }
        ));
        assert!(err.is_usage_error());
        assert_eq!(a.read_calls() + b.read_calls() + c.read_calls(), 0);
    }

    #[tokio::test]
    async fn failing_layer_fails_read_by_default() {
        let (view, [_a, b, _c]) = three_layer_view(
            vec![Feature::new("f")],
            Vec::new(),
            Vec::new(),
        );
        b.set_behavior(Behavior::Fail("disk on fire".to_string()));
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let err = session.execute(&all("c")).await.unwrap_err();
        assert!(matches!(err, ViewError::Layer { layer: 1, .. }));
        assert!(!err.is_usage_error());
    }

    #[tokio::test]
    async fn failing_layer_is_excluded_when_configured() {
        let a = RecordingStorage::with_features("a", "a-coll", vec![Feature::new("f")]);
        let b = RecordingStorage::with_features("b", "b-coll", vec![Feature::new("g")]);
        b.set_behavior(Behavior::Fail("gone".to_string()));
        let view = View::with_config(
            "degraded",
            vec![
                ViewLayer::<FeatureRow>::new(Arc::new(a.clone()), "a-coll"),
                ViewLayer::<FeatureRow>::new(Arc::new(b.clone()), "b-coll"),
            ],
            ViewConfig {
                failure_policy: LayerFailurePolicy::ExcludeLayer,
                ..ViewConfig::default()
            },
        )
        .unwrap();
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        assert_eq!(ids(session.execute(&all("c")).await.unwrap()), vec!["f"]);
    }

    #[tokio::test]
    async fn process_is_not_implemented() {
        let (view, _) = three_layer_view(Vec::new(), Vec::new(), Vec::new());
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let result = session.process(&Notification::CollectionChanged {
            collection_id: "a-coll".to_string(),
        });
        assert_eq!(result.as_error().map(|e| e.reason), Some(ErrorCode::NotImplemented));
    }

    #[tokio::test]
    async fn settings_apply_to_every_layer() {
        let (view, [a, b, c]) = three_layer_view(Vec::new(), Vec::new(), Vec::new());
        let session = view.new_read_session(&ctx(), true).await.unwrap();
        assert!(session.is_master_connect());
        assert_eq!(session.context().stream_id, "stream-7");

        session.set_fetch_size(17);
        session.set_statement_timeout(Duration::from_secs(3));
        session.set_lock_timeout(Duration::from_millis(250));
        assert_eq!(session.fetch_size(), 17);
        assert_eq!(session.statement_timeout(), Duration::from_secs(3));
        assert_eq!(session.lock_timeout(), Duration::from_millis(250));
        for storage in [&a, &b, &c] {
            let settings = storage.last_session_settings().unwrap();
            assert_eq!(settings, (17, Duration::from_secs(3), Duration::from_millis(250)));
        }
    }

    #[tokio::test]
    async fn configured_settings_applied_on_open() {
        let a = RecordingStorage::with_features("a", "a-coll", Vec::new());
        let view = View::with_config(
            "tuned",
            vec![ViewLayer::<FeatureRow>::new(Arc::new(a.clone()), "a-coll")],
            ViewConfig {
                fetch_size: Some(5),
                statement_timeout: Some(Duration::from_millis(900)),
                ..ViewConfig::default()
            },
        )
        .unwrap();
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        assert_eq!(session.fetch_size(), 5);
        assert_eq!(session.statement_timeout(), Duration::from_millis(900));
    }

    #[tokio::test]
    async fn failed_open_closes_sessions_already_opened() {
        let (view, [a, b, c]) = three_layer_view(Vec::new(), Vec::new(), Vec::new());
        b.set_open_failure("storage offline");

        let err = view.new_read_session(&ctx(), false).await.err().unwrap();
        assert!(matches!(err, ViewError::Layer { layer: 1, .. }));
        assert!(err.to_string().contains("storage offline"));
        // Layer 0 was opened and is closed again; layer 2 was never opened.
        assert_eq!((a.closed(), b.closed(), c.closed()), (1, 0, 0));
    }

    #[tokio::test]
    async fn close_closes_all_and_reports_first_failure() {
        let (view, [a, b, c]) = three_layer_view(Vec::new(), Vec::new(), Vec::new());
        c.set_close_failure("close refused");
        let session = view.new_read_session(&ctx(), false).await.unwrap();
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, ViewError::Layer { layer: 2, .. }));
        assert_eq!((a.closed(), b.closed(), c.closed()), (1, 1, 1));
    }
}
