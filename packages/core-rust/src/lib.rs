//! Feature view core: request model, feature rows, results and cursors.

pub mod codec;
pub mod context;
pub mod cursor;
pub mod request;
pub mod result;
pub mod types;

pub use codec::{ExecutedOp, FeatureCodec, FeatureRow};
pub use context::RequestContext;
pub use cursor::HeapCursor;
pub use request::{
    EWriteOp, Notification, POp, POpType, PRef, ReadCollections, ReadFeatures, ReadRequest, SOp,
    WriteCollections, WriteFeatures, WriteOp, WriteRequest,
};
pub use result::{ErrorCode, ErrorResult, StorageResult, SuccessResult};
pub use types::{BBox, Feature, Point, Value};
