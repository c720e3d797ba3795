//! Layers, the ordered layer set, and rows tagged with their origin layer.

use std::fmt;
use std::sync::Arc;

use featureview_core::FeatureCodec;

use crate::error::ViewError;
use crate::storage::Storage;

/// Position of a layer in its [`LayerSet`]. The position is the priority:
/// 0 is the highest.
///
/// A plain index, so rows can name their origin without holding the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(usize);

impl LayerId {
    /// The highest-priority layer of every set.
    pub const TOP: LayerId = LayerId(0);

    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Priority of the layer; smaller is more important.
    #[must_use]
    pub const fn priority(self) -> usize {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One federated storage bound to a collection.
pub struct ViewLayer<C: FeatureCodec> {
    storage: Arc<dyn Storage<C>>,
    collection_id: String,
}

impl<C: FeatureCodec> ViewLayer<C> {
    pub fn new(storage: Arc<dyn Storage<C>>, collection_id: impl Into<String>) -> Self {
        Self {
            storage,
            collection_id: collection_id.into(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage<C>> {
        &self.storage
    }

    #[must_use]
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }
}

impl<C: FeatureCodec> Clone for ViewLayer<C> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            collection_id: self.collection_id.clone(),
        }
    }
}

impl<C: FeatureCodec> fmt::Debug for ViewLayer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewLayer")
            .field("storage", &self.storage.id())
            .field("collection_id", &self.collection_id)
            .finish()
    }
}

/// Ordered, immutable sequence of layers. Order defines priority.
#[derive(Debug)]
pub struct LayerSet<C: FeatureCodec> {
    name: String,
    layers: Vec<ViewLayer<C>>,
}

impl<C: FeatureCodec> LayerSet<C> {
    /// Creates a layer set; the first layer has the highest priority.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::EmptyLayerSet`] if `layers` is empty.
    pub fn new(name: impl Into<String>, layers: Vec<ViewLayer<C>>) -> Result<Self, ViewError> {
        if layers.is_empty() {
            return Err(ViewError::EmptyLayerSet);
        }
        Ok(Self {
            name: name.into(),
            layers,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always `false`; construction rejects empty sets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: LayerId) -> Option<&ViewLayer<C>> {
        self.layers.get(id.index())
    }

    /// Like [`get()`](LayerSet::get), but an unknown id is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::UnknownLayer`] if `id` is out of range.
    pub fn layer(&self, id: LayerId) -> Result<&ViewLayer<C>, ViewError> {
        self.get(id).ok_or(ViewError::UnknownLayer {
            index: id.index(),
            len: self.layers.len(),
        })
    }

    #[must_use]
    pub fn top_priority_layer(&self) -> &ViewLayer<C> {
        &self.layers[0]
    }

    /// Priority of a layer of this set, identified by reference.
    #[must_use]
    pub fn priority_of(&self, layer: &ViewLayer<C>) -> Option<LayerId> {
        self.layers
            .iter()
            .position(|l| std::ptr::eq(l, layer))
            .map(LayerId)
    }

    /// Highest-priority layer bound to `collection_id`.
    #[must_use]
    pub fn find_by_collection(&self, collection_id: &str) -> Option<LayerId> {
        self.layers
            .iter()
            .position(|l| l.collection_id == collection_id)
            .map(LayerId)
    }

    /// Layers in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &ViewLayer<C>)> {
        self.layers.iter().enumerate().map(|(i, l)| (LayerId(i), l))
    }
}

/// A row found on one layer.
///
/// `layer` only names the origin; it does not keep the layer alive.
#[derive(Debug, Clone)]
pub struct LayerRow<C> {
    pub row: C,
    pub layer: LayerId,
}

impl<C> LayerRow<C> {
    pub fn new(row: C, layer: LayerId) -> Self {
        Self { row, layer }
    }

    #[must_use]
    pub fn priority(&self) -> usize {
        self.layer.priority()
    }
}

#[cfg(test)]
mod tests {
    use featureview_core::FeatureRow;

    use super::*;
    use crate::storage::MemoryStorage;

    fn layer(storage: &Arc<MemoryStorage>, collection: &str) -> ViewLayer<FeatureRow> {
        ViewLayer::new(storage.clone(), collection)
    }

    #[test]
    fn empty_layer_set_is_rejected() {
        let result = LayerSet::<FeatureRow>::new("empty", Vec::new());
        assert!(matches!(result, Err(ViewError::EmptyLayerSet)));
    }

    #[test]
    fn priority_is_construction_order() {
        let storage = Arc::new(MemoryStorage::new("mem"));
        // Same storage and collection twice: identity is positional.
        let set = LayerSet::new(
            "roads",
            vec![
                layer(&storage, "topologies"),
                layer(&storage, "buildings"),
                layer(&storage, "topologies"),
            ],
        )
        .unwrap();

        assert_eq!(set.name(), "roads");
        assert_eq!(set.len(), 3);
        assert_eq!(set.top_priority_layer().collection_id(), "topologies");
        let ids: Vec<usize> = set.iter().map(|(id, _)| id.priority()).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let third = set.get(LayerId::new(2)).unwrap();
        assert_eq!(set.priority_of(third), Some(LayerId::new(2)));
        assert_eq!(set.priority_of(&layer(&storage, "topologies")), None);
        assert_eq!(set.find_by_collection("topologies"), Some(LayerId::TOP));
        assert_eq!(set.find_by_collection("buildings"), Some(LayerId::new(1)));
    }

    #[test]
    fn unknown_layer_is_error() {
        let storage = Arc::new(MemoryStorage::new("mem"));
        let set = LayerSet::new("one", vec![layer(&storage, "a")]).unwrap();
        assert!(set.get(LayerId::new(1)).is_none());
        assert!(matches!(
            set.layer(LayerId::new(1)),
            Err(ViewError::UnknownLayer { index: 1, len: 1 })
        ));
    }
}
