//! JSON description of a view over in-memory storages.
//!
//! ```json
//! {
//!   "name": "roads",
//!   "config": { "failure_policy": "exclude_layer" },
//!   "layers": [
//!     { "storage": "delta", "collection": "roads_delta", "features": [] },
//!     { "storage": "base", "collection": "roads", "features": [{ "id": "r1" }] }
//!   ]
//! }
//! ```
//!
//! Layers are listed by priority. Layers naming the same storage share one
//! [`MemoryStorage`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use featureview_core::{Feature, FeatureRow};
use serde::Deserialize;

use crate::config::ViewConfig;
use crate::error::ViewError;
use crate::storage::{MemoryStorage, Storage};
use crate::view::{View, ViewLayer};

#[derive(Debug, Clone, Deserialize)]
pub struct ViewFixture {
    pub name: String,
    #[serde(default)]
    pub config: ViewConfig,
    pub layers: Vec<LayerFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerFixture {
    pub storage: String,
    pub collection: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl ViewFixture {
    /// Reads a fixture from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid fixture.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid fixture {}", path.display()))
    }

    /// Creates the storages, fills them and builds the view.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::EmptyLayerSet`] if the fixture has no layers and
    /// [`ViewError::InvalidConcurrencyLimit`] for an unusable
    /// `max_concurrent_layer_calls`.
    pub fn build(&self) -> Result<View<FeatureRow>, ViewError> {
        let mut storages: HashMap<&str, Arc<MemoryStorage>> = HashMap::new();
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let storage = storages
                .entry(layer.storage.as_str())
                .or_insert_with(|| Arc::new(MemoryStorage::new(layer.storage.clone())));
            storage.insert(&layer.collection, layer.features.iter().cloned());
            let storage: Arc<dyn Storage<FeatureRow>> = storage.clone();
            layers.push(ViewLayer::new(storage, layer.collection.clone()));
        }
        View::with_config(self.name.clone(), layers, self.config.clone())
    }
}
