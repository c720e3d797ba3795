//! Resolvers deciding where to look for features a read did not find on
//! every layer.

use std::collections::BTreeSet;

use featureview_core::FeatureCodec;

use super::layer::{LayerId, LayerRow};

/// Decides, per correlated feature, which layers must be searched again by id.
///
/// Called once per feature id after the scatter round.
pub trait MissingIdResolver<C: FeatureCodec>: Send + Sync {
    /// `true` disables backfill entirely for reads using this resolver.
    fn skip(&self) -> bool;

    /// `(layer, id)` pairs to search again for the feature the `rows` belong
    /// to, or `None` when nothing is missing.
    ///
    /// `rows` is never empty and all rows share one id.
    fn layers_to_search(&self, rows: &[LayerRow<C>]) -> Option<Vec<(LayerId, String)>>;
}

/// Requires every feature to come from at least one obligatory layer.
///
/// A feature found only on non-obligatory layers is looked up by id on all
/// obligatory layers. Layers absent from the view are never searched.
#[derive(Debug, Clone)]
pub struct ObligatoryLayersResolver {
    obligatory: BTreeSet<LayerId>,
}

impl ObligatoryLayersResolver {
    pub fn new(obligatory: impl IntoIterator<Item = LayerId>) -> Self {
        Self {
            obligatory: obligatory.into_iter().collect(),
        }
    }

    /// Resolver with the top-priority layer as sole obligatory layer.
    #[must_use]
    pub fn top_layer() -> Self {
        Self::new([LayerId::TOP])
    }

    #[must_use]
    pub fn obligatory(&self) -> &BTreeSet<LayerId> {
        &self.obligatory
    }
}

impl<C: FeatureCodec> MissingIdResolver<C> for ObligatoryLayersResolver {
    fn skip(&self) -> bool {
        self.obligatory.is_empty()
    }

    fn layers_to_search(&self, rows: &[LayerRow<C>]) -> Option<Vec<(LayerId, String)>> {
        let first = rows.first()?;
        if rows.iter().any(|r| self.obligatory.contains(&r.layer)) {
            return None;
        }
        let id = first.row.id();
        Some(
            self.obligatory
                .iter()
                .map(|&layer| (layer, id.to_string()))
                .collect(),
        )
    }
}

/// Never backfills.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreMissingResolver;

impl<C: FeatureCodec> MissingIdResolver<C> for IgnoreMissingResolver {
    fn skip(&self) -> bool {
        true
    }

    fn layers_to_search(&self, _rows: &[LayerRow<C>]) -> Option<Vec<(LayerId, String)>> {
        None
    }
}
