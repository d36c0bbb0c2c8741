//! Shape descriptions for value trees.
//!
//! A [`Shape`] describes the field layout of a value tree: a named, nested
//! record of scalar, scalar-array, variant and sub-record fields. Fields are
//! flattened in preorder and numbered with stable indices, so two trees built
//! from the same shape have comparable indices and a
//! [`ChangeSet`](crate::ChangeSet) built against one applies to the other.
//!
//! A sub-record field occupies one index itself; its descendants occupy the
//! contiguous range `index + 1 .. index + span`.
//!
//! # Example
//!
//! ```
//! use chanlink::value::{ScalarKind, Shape};
//!
//! let shape = Shape::builder("reading")
//!     .scalar("value", ScalarKind::Float)
//!     .record("alarm", |alarm| {
//!         alarm
//!             .scalar("severity", ScalarKind::Int)
//!             .scalar("message", ScalarKind::Str)
//!     })
//!     .build();
//!
//! assert_eq!(shape.field_count(), 4);
//! assert_eq!(shape.index_of("alarm.severity"), Some(2));
//! assert_eq!(shape.span(1), 3); // "alarm" plus its two children
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Kind of a scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    UInt,
    Float,
    Str,
}

impl ScalarKind {
    /// Human-readable kind name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::UInt => "uint",
            ScalarKind::Float => "float",
            ScalarKind::Str => "string",
        }
    }
}

/// Kind of a field in a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A single scalar of the given kind.
    Scalar(ScalarKind),
    /// A homogeneous array of scalars of the given kind.
    Array(ScalarKind),
    /// A union field holding any scalar, or nothing.
    Variant,
    /// A nested sub-record; its fields follow in preorder.
    Record,
}

impl FieldKind {
    /// Human-readable kind name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Scalar(_) => "scalar",
            FieldKind::Array(_) => "array",
            FieldKind::Variant => "variant",
            FieldKind::Record => "record",
        }
    }
}

/// One field in a flattened shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name within its parent record.
    pub name: String,
    /// Dotted path from the root, e.g. `"alarm.severity"`.
    pub path: String,
    /// Field kind.
    pub kind: FieldKind,
    /// Subtree size including this node; 1 for non-record fields.
    pub span: usize,
    /// Nesting depth; 0 for top-level fields.
    pub depth: usize,
}

/// A named, nested record layout with stable flattened field indexing.
///
/// Shapes are immutable after construction and shared via `Arc`.
#[derive(Debug)]
pub struct Shape {
    name: String,
    fields: Vec<FieldDef>,
    index_by_path: HashMap<String, usize>,
}

impl Shape {
    /// Start building a shape with the given type name.
    pub fn builder(name: impl Into<String>) -> ShapeBuilder {
        ShapeBuilder {
            name: name.into(),
            fields: Vec::new(),
            prefix: String::new(),
            depth: 0,
        }
    }

    /// A single-field shape holding one scalar named `"value"`.
    ///
    /// The most common negotiated shape for simple channels.
    pub fn scalar(name: impl Into<String>, kind: ScalarKind) -> Arc<Shape> {
        Shape::builder(name).scalar("value", kind).build()
    }

    /// Type name of this shape.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of field nodes (all depths).
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field definition at a flattened index.
    pub fn field(&self, index: usize) -> Option<&FieldDef> {
        self.fields.get(index)
    }

    /// All field definitions in preorder.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Flattened index of a dotted path.
    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.index_by_path.get(path).copied()
    }

    /// Subtree span of the field at `index` (including the field itself).
    ///
    /// Returns 0 for an out-of-range index.
    pub fn span(&self, index: usize) -> usize {
        self.fields.get(index).map(|f| f.span).unwrap_or(0)
    }

    /// Indices of the top-level fields, in order.
    pub fn top_level_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = 0;
        std::iter::from_fn(move || {
            if next >= self.fields.len() {
                return None;
            }
            let index = next;
            next += self.fields[index].span;
            Some(index)
        })
    }

    /// Whether two shapes have identical field layouts.
    ///
    /// Trees are only delta-copyable between layout-identical shapes; the
    /// type name is not part of the comparison.
    pub fn layout_eq(&self, other: &Shape) -> bool {
        self.fields == other.fields
    }
}

/// Fluent builder for [`Shape`].
///
/// Nested records are declared with a closure receiving a sub-builder.
pub struct ShapeBuilder {
    name: String,
    fields: Vec<FieldDef>,
    prefix: String,
    depth: usize,
}

impl ShapeBuilder {
    fn push(&mut self, name: &str, kind: FieldKind) {
        let path = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        self.fields.push(FieldDef {
            name: name.to_string(),
            path,
            kind,
            span: 1,
            depth: self.depth,
        });
    }

    /// Add a scalar field.
    pub fn scalar(mut self, name: &str, kind: ScalarKind) -> Self {
        self.push(name, FieldKind::Scalar(kind));
        self
    }

    /// Add a scalar-array field.
    pub fn array(mut self, name: &str, kind: ScalarKind) -> Self {
        self.push(name, FieldKind::Array(kind));
        self
    }

    /// Add a variant (union) field.
    pub fn variant(mut self, name: &str) -> Self {
        self.push(name, FieldKind::Variant);
        self
    }

    /// Add a nested sub-record, declared via the closure.
    pub fn record(mut self, name: &str, f: impl FnOnce(ShapeBuilder) -> ShapeBuilder) -> Self {
        let record_index = self.fields.len();
        self.push(name, FieldKind::Record);

        let path = self.fields[record_index].path.clone();
        let sub = f(ShapeBuilder {
            name: String::new(),
            fields: Vec::new(),
            prefix: path,
            depth: self.depth + 1,
        });

        let descendants = sub.fields.len();
        self.fields.extend(sub.fields);
        // Span covers the record node plus everything the closure added.
        self.fields[record_index].span = 1 + descendants;
        self
    }

    /// Finish and freeze the shape.
    pub fn build(self) -> Arc<Shape> {
        let index_by_path = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.clone(), i))
            .collect();
        Arc::new(Shape {
            name: self.name,
            fields: self.fields,
            index_by_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shape() -> Arc<Shape> {
        Shape::builder("reading")
            .scalar("value", ScalarKind::Float)
            .record("alarm", |alarm| {
                alarm
                    .scalar("severity", ScalarKind::Int)
                    .scalar("message", ScalarKind::Str)
            })
            .array("samples", ScalarKind::Float)
            .build()
    }

    #[test]
    fn test_preorder_indexing() {
        let shape = sample_shape();
        assert_eq!(shape.field_count(), 5);
        assert_eq!(shape.index_of("value"), Some(0));
        assert_eq!(shape.index_of("alarm"), Some(1));
        assert_eq!(shape.index_of("alarm.severity"), Some(2));
        assert_eq!(shape.index_of("alarm.message"), Some(3));
        assert_eq!(shape.index_of("samples"), Some(4));
        assert_eq!(shape.index_of("missing"), None);
    }

    #[test]
    fn test_record_span() {
        let shape = sample_shape();
        assert_eq!(shape.span(0), 1);
        assert_eq!(shape.span(1), 3);
        assert_eq!(shape.span(4), 1);
        assert_eq!(shape.span(99), 0);
    }

    #[test]
    fn test_top_level_indices_skip_descendants() {
        let shape = sample_shape();
        let tops: Vec<usize> = shape.top_level_indices().collect();
        assert_eq!(tops, vec![0, 1, 4]);
    }

    #[test]
    fn test_nested_records() {
        let shape = Shape::builder("outer")
            .record("a", |a| {
                a.record("b", |b| b.scalar("c", ScalarKind::Int))
            })
            .build();

        assert_eq!(shape.field_count(), 3);
        assert_eq!(shape.span(0), 3);
        assert_eq!(shape.span(1), 2);
        assert_eq!(shape.index_of("a.b.c"), Some(2));
        assert_eq!(shape.field(2).unwrap().depth, 2);
    }

    #[test]
    fn test_scalar_shorthand() {
        let shape = Shape::scalar("temperature", ScalarKind::Float);
        assert_eq!(shape.field_count(), 1);
        assert_eq!(shape.index_of("value"), Some(0));
    }

    #[test]
    fn test_layout_eq_ignores_name() {
        let a = Shape::scalar("a", ScalarKind::Float);
        let b = Shape::scalar("b", ScalarKind::Float);
        let c = Shape::scalar("c", ScalarKind::Int);
        assert!(a.layout_eq(&b));
        assert!(!a.layout_eq(&c));
    }
}
