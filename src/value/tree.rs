//! Value trees: typed, shape-aligned record values.
//!
//! A [`ValueTree`] stores one node per field of its [`Shape`], in the same
//! flattened preorder. Delta copies between two trees of the same layout move
//! only the fields named in a [`ChangeSet`], which bounds the cost of an
//! update to the size of its delta.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::changeset::ChangeSet;
use super::shape::{FieldKind, ScalarKind, Shape};
use crate::error::{ChanlinkError, Result};

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Kind of this scalar.
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Int(_) => ScalarKind::Int,
            Scalar::UInt(_) => ScalarKind::UInt,
            Scalar::Float(_) => ScalarKind::Float,
            Scalar::Str(_) => ScalarKind::Str,
        }
    }

    /// Default value for a scalar kind.
    pub fn default_for(kind: ScalarKind) -> Scalar {
        match kind {
            ScalarKind::Bool => Scalar::Bool(false),
            ScalarKind::Int => Scalar::Int(0),
            ScalarKind::UInt => Scalar::UInt(0),
            ScalarKind::Float => Scalar::Float(0.0),
            ScalarKind::Str => Scalar::Str(String::new()),
        }
    }

    /// Numeric view, coercing integer kinds to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::UInt(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(v) => serde_json::Value::from(*v),
            Scalar::Int(v) => serde_json::Value::from(*v),
            Scalar::UInt(v) => serde_json::Value::from(*v),
            Scalar::Float(v) => serde_json::Value::from(*v),
            Scalar::Str(v) => serde_json::Value::from(v.clone()),
        }
    }
}

/// Storage for one field node.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Scalar(Scalar),
    Array(Vec<Scalar>),
    Variant(Option<Scalar>),
    /// Record nodes carry no data of their own; their children follow.
    Record,
}

impl Node {
    fn default_for(kind: &FieldKind) -> Node {
        match kind {
            FieldKind::Scalar(k) => Node::Scalar(Scalar::default_for(*k)),
            FieldKind::Array(_) => Node::Array(Vec::new()),
            FieldKind::Variant => Node::Variant(None),
            FieldKind::Record => Node::Record,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Node::Scalar(_) => "scalar",
            Node::Array(_) => "array",
            Node::Variant(_) => "variant",
            Node::Record => "record",
        }
    }
}

/// A typed record value aligned with a [`Shape`].
#[derive(Debug, Clone)]
pub struct ValueTree {
    shape: Arc<Shape>,
    nodes: Vec<Node>,
}

impl ValueTree {
    /// Create a tree of default-valued fields for a shape.
    pub fn new(shape: Arc<Shape>) -> Self {
        let nodes = shape
            .fields()
            .iter()
            .map(|f| Node::default_for(&f.kind))
            .collect();
        Self { shape, nodes }
    }

    /// The shape this tree was built from.
    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    fn index_of(&self, path: &str) -> Result<usize> {
        self.shape
            .index_of(path)
            .ok_or_else(|| ChanlinkError::NoSuchField(path.to_string()))
    }

    /// Scalar at a dotted path.
    pub fn scalar(&self, path: &str) -> Result<&Scalar> {
        let index = self.index_of(path)?;
        match &self.nodes[index] {
            Node::Scalar(s) => Ok(s),
            other => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "scalar",
                actual: other.kind_name(),
            }),
        }
    }

    /// Scalar at a flattened index, if the node is a scalar.
    pub fn scalar_at(&self, index: usize) -> Option<&Scalar> {
        match self.nodes.get(index) {
            Some(Node::Scalar(s)) => Some(s),
            _ => None,
        }
    }

    /// Set a scalar, keeping its declared kind.
    pub fn set_scalar(&mut self, path: &str, value: Scalar) -> Result<()> {
        let index = self.index_of(path)?;
        match &mut self.nodes[index] {
            Node::Scalar(s) if s.kind() == value.kind() => {
                *s = value;
                Ok(())
            }
            Node::Scalar(s) => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: s.kind().name(),
                actual: value.kind().name(),
            }),
            other => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "scalar",
                actual: other.kind_name(),
            }),
        }
    }

    /// Array elements at a dotted path.
    pub fn array(&self, path: &str) -> Result<&[Scalar]> {
        let index = self.index_of(path)?;
        match &self.nodes[index] {
            Node::Array(v) => Ok(v),
            other => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "array",
                actual: other.kind_name(),
            }),
        }
    }

    /// Replace an array's elements; every element must match the declared
    /// element kind.
    pub fn set_array(&mut self, path: &str, values: Vec<Scalar>) -> Result<()> {
        let index = self.index_of(path)?;
        let element_kind = match self.shape.field(index).map(|f| f.kind) {
            Some(FieldKind::Array(k)) => k,
            _ => {
                return Err(ChanlinkError::TypeMismatch {
                    path: path.to_string(),
                    expected: "array",
                    actual: self.nodes[index].kind_name(),
                })
            }
        };
        if let Some(bad) = values.iter().find(|v| v.kind() != element_kind) {
            return Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: element_kind.name(),
                actual: bad.kind().name(),
            });
        }
        self.nodes[index] = Node::Array(values);
        Ok(())
    }

    /// Variant contents at a dotted path.
    pub fn variant(&self, path: &str) -> Result<Option<&Scalar>> {
        let index = self.index_of(path)?;
        match &self.nodes[index] {
            Node::Variant(v) => Ok(v.as_ref()),
            other => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "variant",
                actual: other.kind_name(),
            }),
        }
    }

    /// Store (or clear) a variant's contents. Variants accept any scalar kind.
    pub fn set_variant(&mut self, path: &str, value: Option<Scalar>) -> Result<()> {
        let index = self.index_of(path)?;
        match &mut self.nodes[index] {
            Node::Variant(v) => {
                *v = value;
                Ok(())
            }
            other => Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "variant",
                actual: other.kind_name(),
            }),
        }
    }

    /// Borrow a sub-record as a fresh tree.
    ///
    /// The returned tree has its own shape covering just the sub-record's
    /// fields and copies of their values.
    pub fn subtree(&self, path: &str) -> Result<ValueTree> {
        let index = self.index_of(path)?;
        let field = self.shape.field(index).ok_or_else(|| {
            ChanlinkError::NoSuchField(path.to_string())
        })?;
        if field.kind != FieldKind::Record {
            return Err(ChanlinkError::TypeMismatch {
                path: path.to_string(),
                expected: "record",
                actual: field.kind.name(),
            });
        }

        // Rebuild the descendant layout as a standalone shape; the builder
        // regenerates relative paths from the field names.
        let builder = Shape::builder(field.name.clone());
        let sub_shape =
            rebuild_range(builder, &self.shape, index + 1, index + field.span).build();

        let mut out = ValueTree::new(sub_shape);
        out.nodes
            .clone_from_slice(&self.nodes[index + 1..index + field.span]);
        Ok(out)
    }

    /// Copy the fields named in `changes` (and, for record indices, their
    /// subtrees) from `other` into `self`.
    ///
    /// Never a full copy: cost is bounded by the delta. Fails with
    /// `ShapeMismatch` if the two layouts differ.
    pub fn copy_fields_from(&mut self, other: &ValueTree, changes: &ChangeSet) -> Result<()> {
        if !self.shape.layout_eq(&other.shape) {
            return Err(ChanlinkError::ShapeMismatch(format!(
                "'{}' vs '{}'",
                self.shape.name(),
                other.shape.name()
            )));
        }
        for index in changes.iter() {
            let span = self.shape.span(index);
            if span == 0 {
                return Err(ChanlinkError::ShapeMismatch(format!(
                    "change index {index} out of range for '{}'",
                    self.shape.name()
                )));
            }
            self.nodes[index..index + span].clone_from_slice(&other.nodes[index..index + span]);
        }
        Ok(())
    }

    /// JSON export of the whole tree, for diagnostics and logging.
    pub fn to_json(&self) -> serde_json::Value {
        self.range_to_json(0, self.nodes.len(), 0)
    }

    fn range_to_json(&self, start: usize, end: usize, depth: usize) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let mut i = start;
        while i < end {
            let field = &self.shape.fields()[i];
            debug_assert_eq!(field.depth, depth);
            let value = match &self.nodes[i] {
                Node::Scalar(s) => s.to_json(),
                Node::Array(v) => {
                    serde_json::Value::Array(v.iter().map(Scalar::to_json).collect())
                }
                Node::Variant(v) => v
                    .as_ref()
                    .map(Scalar::to_json)
                    .unwrap_or(serde_json::Value::Null),
                Node::Record => self.range_to_json(i + 1, i + field.span, depth + 1),
            };
            map.insert(field.name.clone(), value);
            i += field.span;
        }
        serde_json::Value::Object(map)
    }
}

/// Redeclare the fields in `start..end` of `shape` on `builder`, recursing
/// into record spans.
fn rebuild_range(
    mut builder: super::shape::ShapeBuilder,
    shape: &Shape,
    start: usize,
    end: usize,
) -> super::shape::ShapeBuilder {
    let mut i = start;
    while i < end {
        let field = &shape.fields()[i];
        builder = match field.kind {
            FieldKind::Scalar(k) => builder.scalar(&field.name, k),
            FieldKind::Array(k) => builder.array(&field.name, k),
            FieldKind::Variant => builder.variant(&field.name),
            FieldKind::Record => {
                builder.record(&field.name, |b| rebuild_range(b, shape, i + 1, i + field.span))
            }
        };
        i += field.span;
    }
    builder
}

impl std::fmt::Display for ValueTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
