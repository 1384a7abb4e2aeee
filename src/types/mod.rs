//! Core types for the phloem renderer.
//!
//! This module contains the fundamental types used throughout the renderer:
//!
//! - [`id`]: Identifier types (`TaskId`, `SegmentId`, `BoundaryId`)
//! - [`keypath`]: Stable tree-position addresses with structural equality
//! - [`tree_context`]: Sibling-index chains for deterministic id generation

pub mod id;
pub mod keypath;
pub mod tree_context;

pub use id::{BoundaryId, SegmentId, TaskId};
pub use keypath::{KeyOrIndex, KeyPath};
pub use tree_context::TreeContext;
