//! Feature view: federates priority-ordered storage layers into one logical
//! feature store.

pub mod config;
pub mod error;
pub mod fixture;
pub mod storage;
pub mod view;

pub use config::{LayerFailurePolicy, ViewConfig};
pub use error::ViewError;
pub use storage::{MemoryStorage, ReadSession, Storage, WriteSession};
pub use view::{
    LayerId, LayerRow, LayerSet, MergeByStoragePriority, MergeOperation, MissingIdResolver,
    ObligatoryLayersResolver, View, ViewLayer, ViewReadSession, ViewWriteSession,
};
