//! Scatter-gather execution of one read round across layers.
//!
//! [`ScatterGatherExecutor::query_in_parallel`] dispatches one request per
//! layer concurrently, waits for every call to finish, then correlates all
//! returned rows by feature id into a [`CorrelationMap`].

use std::collections::BTreeMap;
use std::sync::Arc;

use featureview_core::{FeatureCodec, ReadFeatures, ReadRequest, StorageResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};

use super::layer::{LayerId, LayerRow, ViewLayer};
use crate::config::{LayerFailurePolicy, ViewConfig};
use crate::error::ViewError;
use crate::storage::ReadSession;

/// Rows of one read grouped by feature id. Built per request, never shared.
///
/// Ordered by id so that merged results come out in a stable order.
pub type CorrelationMap<C> = BTreeMap<String, Vec<LayerRow<C>>>;

/// One request directed at one layer's session.
pub struct LayerReadRequest<C: FeatureCodec> {
    pub request: ReadFeatures,
    pub layer: LayerId,
    pub collection: String,
    pub session: Arc<dyn ReadSession<C>>,
}

impl<C: FeatureCodec> LayerReadRequest<C> {
    pub fn new(
        request: ReadFeatures,
        layer: LayerId,
        view_layer: &ViewLayer<C>,
        session: Arc<dyn ReadSession<C>>,
    ) -> Self {
        Self {
            request,
            layer,
            collection: view_layer.collection_id().to_string(),
            session,
        }
    }
}

/// Runs scatter rounds against layer sessions.
///
/// Holds the view-wide concurrency limit. Every dispatched call takes one
/// permit; when the round cannot get a permit for every call it is rejected
/// with [`ViewError::TooManyTasks`] before anything is dispatched.
#[derive(Debug)]
pub struct ScatterGatherExecutor {
    permits: Arc<Semaphore>,
    limit: usize,
    failure_policy: LayerFailurePolicy,
}

impl ScatterGatherExecutor {
    #[must_use]
    pub fn new(config: &ViewConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_layer_calls)),
            limit: config.max_concurrent_layer_calls,
            failure_policy: config.failure_policy,
        }
    }

    #[must_use]
    pub fn failure_policy(&self) -> LayerFailurePolicy {
        self.failure_policy
    }

    /// Permits currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Executes all requests concurrently and correlates the rows by id.
    ///
    /// Waits for every dispatched call, even after one has failed. With
    /// [`LayerFailurePolicy::FailFast`] the error of the highest-priority
    /// failing layer is then returned; with
    /// [`LayerFailurePolicy::ExcludeLayer`] failing layers are logged and
    /// left out.
    ///
    /// # Errors
    ///
    /// - [`ViewError::TooManyTasks`] if the concurrency limit is exhausted.
    /// - [`ViewError::Layer`] / [`ViewError::LayerResult`] for a failing
    ///   layer under `FailFast`.
    /// - [`ViewError::TaskJoin`] if a layer task panicked.
    pub async fn query_in_parallel<C: FeatureCodec>(
        &self,
        requests: Vec<LayerReadRequest<C>>,
    ) -> Result<CorrelationMap<C>, ViewError> {
        if requests.is_empty() {
            return Ok(CorrelationMap::new());
        }
        let dispatched = requests.len();
        // Held until every layer call of the round has finished.
        let _round = self.acquire(dispatched)?;

        let span = info_span!("scatter", layers = dispatched);
        let outcomes = async {
            debug!("dispatching {} layer requests", dispatched);
            metrics::counter!("featureview_layer_calls_total").increment(dispatched as u64);

            let mut tasks = JoinSet::new();
            for request in requests {
                tasks.spawn(run_layer_request(request));
            }

            let mut outcomes = Vec::with_capacity(dispatched);
            while let Some(joined) = tasks.join_next().await {
                outcomes.push(joined?);
            }
            Ok::<_, ViewError>(outcomes)
        }
        .instrument(span)
        .await?;

        self.correlate(outcomes)
    }

    /// Takes one permit per call of the round, all or none.
    fn acquire(&self, count: usize) -> Result<OwnedSemaphorePermit, ViewError> {
        u32::try_from(count)
            .ok()
            .and_then(|count| Arc::clone(&self.permits).try_acquire_many_owned(count).ok())
            .ok_or(ViewError::TooManyTasks { limit: self.limit })
    }

    fn correlate<C: FeatureCodec>(
        &self,
        mut outcomes: Vec<LayerOutcome<C>>,
    ) -> Result<CorrelationMap<C>, ViewError> {
        // Completion order is arbitrary; correlate in priority order.
        outcomes.sort_by_key(|outcome| outcome.layer);

        let mut correlated = CorrelationMap::new();
        for outcome in outcomes {
            let rows = match outcome.result {
                Ok(rows) => rows,
                Err(error) => match self.failure_policy {
                    LayerFailurePolicy::FailFast => return Err(error),
                    LayerFailurePolicy::ExcludeLayer => {
                        warn!(layer = %outcome.layer, error = %error, "excluding failed layer");
                        metrics::counter!("featureview_layer_failures_total").increment(1);
                        continue;
                    }
                },
            };
            for row in rows {
                correlated
                    .entry(row.id().to_string())
                    .or_insert_with(Vec::new)
                    .push(LayerRow::new(row, outcome.layer));
            }
        }
        Ok(correlated)
    }
}

struct LayerOutcome<C> {
    layer: LayerId,
    result: Result<Vec<C>, ViewError>,
}

async fn run_layer_request<C: FeatureCodec>(request: LayerReadRequest<C>) -> LayerOutcome<C> {
    let LayerReadRequest {
        request,
        layer,
        collection,
        session,
    } = request;
    let result = match session.execute(&ReadRequest::Features(request)).await {
        Ok(StorageResult::Success(success)) => Ok(success.cursor.into_rows()),
        Ok(StorageResult::Error(error)) => Err(ViewError::LayerResult {
            layer: layer.index(),
            collection,
            reason: error.reason,
            message: error.message,
        }),
        Err(source) => Err(ViewError::Layer {
            layer: layer.index(),
            collection,
            source,
        }),
    };
    LayerOutcome { layer, result }
}
