//! Value module - shapes, trees, change sets and tracked values.
//!
//! This module implements the data model the rest of the crate moves around:
//! - [`Shape`] / [`ShapeBuilder`] - field layout with stable flattened indices
//! - [`ValueTree`] / [`Scalar`] - typed record values
//! - [`ChangeSet`] - set of field indices written since a reference point
//! - [`ChangeTrackedValue`] - a tree plus its since-last-look change set

mod changeset;
mod shape;
mod tracked;
mod tree;

pub use changeset::ChangeSet;
pub use shape::{FieldDef, FieldKind, ScalarKind, Shape, ShapeBuilder};
pub use tracked::ChangeTrackedValue;
pub use tree::{Scalar, ValueTree};
