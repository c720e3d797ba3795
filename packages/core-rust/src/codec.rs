//! Row capability trait and the concrete feature row.
//!
//! The federation engine is generic over its row type. It only needs the
//! capabilities [`FeatureCodec`] exposes: the feature identifier for
//! correlation and, optionally, the collection the row came from.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::types::Feature;

/// Capability set of a row returned by a storage session.
///
/// Implementations wrap a storage-specific feature representation. Rows are
/// cloned when results are merged, so they should be cheap to clone
/// (`Arc`-wrapped payloads are fine).
pub trait FeatureCodec: Clone + Debug + Send + Sync + 'static {
    /// The decoded feature type carried by this row.
    type Feature;

    /// Identifier used to correlate rows from different layers.
    fn id(&self) -> &str;

    /// Collection the row was read from, if the storage reports it.
    fn collection(&self) -> Option<&str>;

    /// The decoded feature, if the row carries one (deleted rows may not).
    fn feature(&self) -> Option<&Self::Feature>;
}

/// What a storage did with a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutedOp {
    Read,
    Created,
    Updated,
    Deleted,
    Purged,
    Retained,
}

/// Row type for [`Feature`]s: the executed operation, the source collection
/// and the feature itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRow {
    pub op: ExecutedOp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection: Option<String>,
    pub feature: Feature,
}

impl FeatureRow {
    /// A row produced by a read.
    #[must_use]
    pub fn read(collection: impl Into<String>, feature: Feature) -> Self {
        Self {
            op: ExecutedOp::Read,
            collection: Some(collection.into()),
            feature,
        }
    }

    #[must_use]
    pub fn with_op(mut self, op: ExecutedOp) -> Self {
        self.op = op;
        self
    }
}

impl FeatureCodec for FeatureRow {
    type Feature = Feature;

    fn id(&self) -> &str {
        &self.feature.id
    }

    fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    fn feature(&self) -> Option<&Feature> {
        Some(&self.feature)
    }
}
