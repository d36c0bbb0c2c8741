//! Change-tracked values: a value tree plus its since-last-look change set.
//!
//! A [`ChangeTrackedValue`] is what operations and subscriptions expose to
//! the application: the current value plus exactly which fields were written
//! since the application last observed it. Updates replace the change set
//! rather than accumulating it.

use std::sync::Arc;

use super::changeset::ChangeSet;
use super::shape::Shape;
use super::tree::{Scalar, ValueTree};
use crate::error::{ChanlinkError, Result};

/// A value tree plus the set of fields written since the last observation.
#[derive(Debug, Clone)]
pub struct ChangeTrackedValue {
    tree: ValueTree,
    changes: ChangeSet,
}

impl ChangeTrackedValue {
    /// Create an empty tracked value sized to a shape.
    pub fn new(shape: Arc<Shape>) -> Self {
        let changes = ChangeSet::new(shape.field_count());
        Self {
            tree: ValueTree::new(shape),
            changes,
        }
    }

    /// Reallocate for a (possibly different) shape and clear the change set.
    ///
    /// Invalidates anything previously read out of the tree.
    pub fn reset(&mut self, shape: Arc<Shape>) {
        self.changes = ChangeSet::new(shape.field_count());
        self.tree = ValueTree::new(shape);
    }

    /// The owned value tree.
    pub fn tree(&self) -> &ValueTree {
        &self.tree
    }

    /// Fields written by the most recent update.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// The shape of the owned tree.
    pub fn shape(&self) -> &Arc<Shape> {
        self.tree.shape()
    }

    /// Apply a delta update: copy only the fields named in `changes` from
    /// `source`, then replace the owned change set with `changes`.
    ///
    /// The tracked value always answers "what changed since I last looked",
    /// never cumulative history.
    pub fn apply_update(&mut self, source: &ValueTree, changes: &ChangeSet) -> Result<()> {
        self.tree.copy_fields_from(source, changes)?;
        self.changes.copy_from(changes);
        Ok(())
    }

    /// Forget the recorded changes without touching the value.
    pub fn clear_changes(&mut self) {
        self.changes.clear_all();
    }

    // ---- staged local edits (used before a write) ----

    /// Stage a scalar write; marks the field changed.
    pub fn stage_scalar(&mut self, path: &str, value: Scalar) -> Result<()> {
        self.tree.set_scalar(path, value)?;
        self.mark_changed(path)
    }

    /// Stage an array write; marks the field changed.
    pub fn stage_array(&mut self, path: &str, values: Vec<Scalar>) -> Result<()> {
        self.tree.set_array(path, values)?;
        self.mark_changed(path)
    }

    /// Stage a variant write; marks the field changed.
    pub fn stage_variant(&mut self, path: &str, value: Option<Scalar>) -> Result<()> {
        self.tree.set_variant(path, value)?;
        self.mark_changed(path)
    }

    /// Stage a scalar into the sole top-level field of a single-field tree,
    /// or fail with `AmbiguousShape`.
    pub fn stage_value(&mut self, value: Scalar) -> Result<()> {
        let index = self.sole_top_level()?;
        let path = self
            .shape()
            .field(index)
            .ok_or(ChanlinkError::AmbiguousShape)?
            .path
            .clone();
        self.stage_scalar(&path, value)
    }

    fn mark_changed(&mut self, path: &str) -> Result<()> {
        let index = self
            .shape()
            .index_of(path)
            .ok_or_else(|| ChanlinkError::NoSuchField(path.to_string()))?;
        self.changes.set(index);
        Ok(())
    }

    // ---- read accessors ----

    /// Scalar at a dotted path.
    pub fn scalar(&self, path: &str) -> Result<&Scalar> {
        self.tree.scalar(path)
    }

    /// Array at a dotted path.
    pub fn array(&self, path: &str) -> Result<&[Scalar]> {
        self.tree.array(path)
    }

    /// Sub-record at a dotted path, copied out as its own tree.
    pub fn subtree(&self, path: &str) -> Result<ValueTree> {
        self.tree.subtree(path)
    }

    /// Index of the single top-level data-bearing field, or `AmbiguousShape`.
    fn sole_top_level(&self) -> Result<usize> {
        let mut tops = self.shape().top_level_indices();
        let first = tops.next().ok_or(ChanlinkError::AmbiguousShape)?;
        if tops.next().is_some() {
            return Err(ChanlinkError::AmbiguousShape);
        }
        Ok(first)
    }

    /// "The" scalar of a single-field tree.
    ///
    /// Fails with `AmbiguousShape` if the tree has more than one top-level
    /// field, or `TypeMismatch` if the sole field is not a scalar.
    pub fn as_scalar(&self) -> Result<&Scalar> {
        let index = self.sole_top_level()?;
        let field = self.shape().field(index).ok_or(ChanlinkError::AmbiguousShape)?;
        self.tree.scalar_at(index).ok_or_else(|| ChanlinkError::TypeMismatch {
            path: field.path.clone(),
            expected: "scalar",
            actual: field.kind.name(),
        })
    }

    /// "The" value as `f64` (numeric kinds coerce).
    pub fn as_f64(&self) -> Result<f64> {
        let scalar = self.as_scalar()?;
        scalar.as_f64().ok_or_else(|| ChanlinkError::TypeMismatch {
            path: "value".to_string(),
            expected: "numeric scalar",
            actual: scalar.kind().name(),
        })
    }

    /// "The" value as a string.
    pub fn as_string(&self) -> Result<String> {
        let scalar = self.as_scalar()?;
        scalar
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChanlinkError::TypeMismatch {
                path: "value".to_string(),
                expected: "string scalar",
                actual: scalar.kind().name(),
            })
    }
}
