//! Request model: property filters, spatial predicates, read, write and
//! notification requests.
//!
//! Property filters are a recursive [`POp`] tree in the same shape as a
//! predicate node: an operator, an optional property reference and value for
//! leaves, and optional children for boolean composition.

use serde::{Deserialize, Serialize};

use crate::types::{BBox, Feature, Value};

// ---------------------------------------------------------------------------
// Property references and operators
// ---------------------------------------------------------------------------

/// Reference to a feature property that a [`POp`] leaf compares against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PRef {
    /// The feature identifier.
    Id,
    /// The state (version) identifier.
    Uuid,
    /// The application that last wrote the feature.
    AppId,
    /// The author that last wrote the feature.
    Author,
    /// Path into the free-form properties.
    Property(Vec<String>),
}

impl PRef {
    /// Builds a property path reference from its segments.
    pub fn property<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PRef::Property(path.into_iter().map(Into::into).collect())
    }

    fn resolve<'a>(&self, feature: &'a Feature) -> Option<ResolvedRef<'a>> {
        match self {
            PRef::Id => Some(ResolvedRef::Str(&feature.id)),
            PRef::Uuid => feature.uuid.as_deref().map(ResolvedRef::Str),
            PRef::AppId => feature.app_id.as_deref().map(ResolvedRef::Str),
            PRef::Author => feature.author.as_deref().map(ResolvedRef::Str),
            PRef::Property(path) => feature.property(path).map(ResolvedRef::Value),
        }
    }
}

enum ResolvedRef<'a> {
    Str(&'a str),
    Value(&'a Value),
}

impl ResolvedRef<'_> {
    fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedRef::Str(s) => Some(s),
            ResolvedRef::Value(v) => v.as_str(),
        }
    }

    fn equals(&self, other: &Value) -> bool {
        match self {
            ResolvedRef::Str(s) => other.as_str() == Some(*s),
            ResolvedRef::Value(v) => *v == other,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ResolvedRef::Str(_) => None,
            ResolvedRef::Value(v) => v.as_f64(),
        }
    }
}

/// Operator of a [`POp`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum POpType {
    Eq,
    Gt,
    Lt,
    Exists,
    StartsWith,
    And,
    Or,
    Not,
}

/// A node of the property filter tree.
///
/// Leaves carry `pref` (and `value`, except for `Exists`); composition nodes
/// (`And`, `Or`, `Not`) carry `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct POp {
    pub op: POpType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pref: Option<PRef>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub children: Option<Vec<POp>>,
}

impl POp {
    fn leaf(op: POpType, pref: PRef, value: Option<Value>) -> Self {
        Self {
            op,
            pref: Some(pref),
            value,
            children: None,
        }
    }

    fn node(op: POpType, children: Vec<POp>) -> Self {
        Self {
            op,
            pref: None,
            value: None,
            children: Some(children),
        }
    }

    #[must_use]
    pub fn eq(pref: PRef, value: impl Into<Value>) -> Self {
        Self::leaf(POpType::Eq, pref, Some(value.into()))
    }

    #[must_use]
    pub fn gt(pref: PRef, value: impl Into<Value>) -> Self {
        Self::leaf(POpType::Gt, pref, Some(value.into()))
    }

    #[must_use]
    pub fn lt(pref: PRef, value: impl Into<Value>) -> Self {
        Self::leaf(POpType::Lt, pref, Some(value.into()))
    }

    #[must_use]
    pub fn exists(pref: PRef) -> Self {
        Self::leaf(POpType::Exists, pref, None)
    }

    #[must_use]
    pub fn starts_with(pref: PRef, prefix: impl Into<String>) -> Self {
        Self::leaf(POpType::StartsWith, pref, Some(Value::String(prefix.into())))
    }

    #[must_use]
    pub fn and(children: Vec<POp>) -> Self {
        Self::node(POpType::And, children)
    }

    #[must_use]
    pub fn or(children: Vec<POp>) -> Self {
        Self::node(POpType::Or, children)
    }

    #[must_use]
    pub fn not(child: POp) -> Self {
        Self::node(POpType::Not, vec![child])
    }

    /// Returns `true` if this node is a leaf (has no children).
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Evaluates the filter against a feature.
    ///
    /// A leaf whose reference does not resolve matches nothing (except under
    /// `Not`). An `And` with no children matches everything, an `Or` with no
    /// children matches nothing.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        let children = self.children.as_deref().unwrap_or(&[]);
        match self.op {
            POpType::And => children.iter().all(|c| c.matches(feature)),
            POpType::Or => children.iter().any(|c| c.matches(feature)),
            POpType::Not => !children.iter().all(|c| c.matches(feature)),
            POpType::Exists => self
                .pref
                .as_ref()
                .is_some_and(|pref| pref.resolve(feature).is_some()),
            POpType::Eq | POpType::Gt | POpType::Lt | POpType::StartsWith => {
                let (Some(pref), Some(value)) = (&self.pref, &self.value) else {
                    return false;
                };
                let Some(resolved) = pref.resolve(feature) else {
                    return false;
                };
                match self.op {
                    POpType::Eq => resolved.equals(value),
                    POpType::Gt => matches!(
                        (resolved.as_f64(), value.as_f64()),
                        (Some(a), Some(b)) if a > b
                    ),
                    POpType::Lt => matches!(
                        (resolved.as_f64(), value.as_f64()),
                        (Some(a), Some(b)) if a < b
                    ),
                    _ => matches!(
                        (resolved.as_str(), value.as_str()),
                        (Some(s), Some(prefix)) if s.starts_with(prefix)
                    ),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Spatial predicates
// ---------------------------------------------------------------------------

/// Spatial predicate over point geometries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SOp {
    /// Geometry lies within the box.
    Intersects(BBox),
    /// Geometry lies within the box grown by `buffer`.
    Within { bbox: BBox, buffer: f64 },
}

impl SOp {
    /// Features without geometry never match a spatial predicate.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        let Some(point) = feature.geometry.as_ref() else {
            return false;
        };
        match self {
            SOp::Intersects(bbox) => bbox.contains(point),
            SOp::Within { bbox, buffer } => bbox.buffered(*buffer).contains(point),
        }
    }
}

// ---------------------------------------------------------------------------
// Read requests
// ---------------------------------------------------------------------------

/// Reads features from one or more collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFeatures {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spatial_op: Option<SOp>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub property_op: Option<POp>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<usize>,
}

impl ReadFeatures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    #[must_use]
    pub fn with_spatial_op(mut self, op: SOp) -> Self {
        self.spatial_op = Some(op);
        self
    }

    #[must_use]
    pub fn with_property_op(mut self, op: POp) -> Self {
        self.property_op = Some(op);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Same filters, directed at a single other collection.
    #[must_use]
    pub fn for_collection(&self, collection: &str) -> Self {
        Self {
            collections: vec![collection.to_string()],
            ..self.clone()
        }
    }

    /// Reads one feature by id from `collection`.
    #[must_use]
    pub fn by_id(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new()
            .add_collection(collection)
            .with_property_op(POp::eq(PRef::Id, Value::String(id.into())))
    }

    /// Reads features by id from `collection`: an `Or` of id equalities.
    #[must_use]
    pub fn by_ids<I, S>(collection: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ops = ids
            .into_iter()
            .map(|id| POp::eq(PRef::Id, Value::String(id.into())))
            .collect();
        Self::new().add_collection(collection).with_property_op(POp::or(ops))
    }

    /// Whether a feature satisfies both the spatial and property filters.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        self.spatial_op.as_ref().map_or(true, |op| op.matches(feature))
            && self.property_op.as_ref().map_or(true, |op| op.matches(feature))
    }
}

/// Reads collection metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCollections {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub read_deleted: bool,
}

/// Any read request a storage session may receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadRequest {
    Features(ReadFeatures),
    Collections(ReadCollections),
}

impl ReadRequest {
    /// Short name of the request kind, used in errors and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ReadRequest::Features(_) => "ReadFeatures",
            ReadRequest::Collections(_) => "ReadCollections",
        }
    }
}

impl From<ReadFeatures> for ReadRequest {
    fn from(r: ReadFeatures) -> Self {
        ReadRequest::Features(r)
    }
}

impl From<ReadCollections> for ReadRequest {
    fn from(r: ReadCollections) -> Self {
        ReadRequest::Collections(r)
    }
}

// ---------------------------------------------------------------------------
// Write requests
// ---------------------------------------------------------------------------

/// Kind of a single write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EWriteOp {
    /// Insert; fails if the feature exists.
    Create,
    /// Insert or replace.
    Put,
    /// Replace; fails if the feature does not exist.
    Update,
    /// Delete; succeeds if the feature does not exist.
    Delete,
    /// Delete without keeping history.
    Purge,
}

/// One operation of a [`WriteFeatures`] request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOp {
    pub op: EWriteOp,
    pub feature: Feature,
}

/// Writes features into one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFeatures {
    pub collection_id: String,
    #[serde(default)]
    pub ops: Vec<WriteOp>,
}

impl WriteFeatures {
    #[must_use]
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ops: Vec::new(),
        }
    }

    /// Appends an operation; chainable.
    pub fn add(&mut self, op: EWriteOp, feature: Feature) -> &mut Self {
        self.ops.push(WriteOp { op, feature });
        self
    }

    pub fn create(&mut self, feature: Feature) -> &mut Self {
        self.add(EWriteOp::Create, feature)
    }

    pub fn put(&mut self, feature: Feature) -> &mut Self {
        self.add(EWriteOp::Put, feature)
    }

    pub fn update(&mut self, feature: Feature) -> &mut Self {
        self.add(EWriteOp::Update, feature)
    }

    pub fn delete(&mut self, id: impl Into<String>) -> &mut Self {
        self.add(EWriteOp::Delete, Feature::new(id))
    }
}

/// Creates or drops collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteCollections {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

/// Any write request a storage write session may receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteRequest {
    Features(WriteFeatures),
    Collections(WriteCollections),
}

impl WriteRequest {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            WriteRequest::Features(_) => "WriteFeatures",
            WriteRequest::Collections(_) => "WriteCollections",
        }
    }
}

impl From<WriteFeatures> for WriteRequest {
    fn from(r: WriteFeatures) -> Self {
        WriteRequest::Features(r)
    }
}

impl From<WriteCollections> for WriteRequest {
    fn from(r: WriteCollections) -> Self {
        WriteRequest::Collections(r)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Change notifications a session may be asked to process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    /// Features changed in a collection.
    FeaturesChanged {
        collection_id: String,
        ids: Vec<String>,
    },
    /// A collection was created, altered or dropped.
    CollectionChanged { collection_id: String },
}
