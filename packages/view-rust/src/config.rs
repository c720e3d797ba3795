use std::time::Duration;

use serde::Deserialize;

/// What a scatter round does when one layer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerFailurePolicy {
    /// The whole read fails with the first layer error.
    #[default]
    FailFast,
    /// The failing layer's contribution is dropped and the read continues.
    ExcludeLayer,
}

/// View-level configuration.
///
/// Controls concurrency limits, the layer failure policy and the session
/// settings applied to every storage sub-session when a view session opens.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Maximum number of storage calls in flight across all sessions of one
    /// view. Dispatches beyond the limit are rejected, not queued.
    pub max_concurrent_layer_calls: usize,
    /// Handling of a single failing layer during a scatter round.
    pub failure_policy: LayerFailurePolicy,
    /// Fetch size applied to every sub-session, if set.
    pub fetch_size: Option<usize>,
    /// Statement timeout applied to every sub-session, if set.
    #[serde(with = "opt_millis")]
    pub statement_timeout: Option<Duration>,
    /// Lock timeout applied to every sub-session, if set.
    #[serde(with = "opt_millis")]
    pub lock_timeout: Option<Duration>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            max_concurrent_layer_calls: 64,
            failure_policy: LayerFailurePolicy::FailFast,
            fetch_size: None,
            statement_timeout: None,
            lock_timeout: None,
        }
    }
}

/// Durations are configured as milliseconds.
mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
