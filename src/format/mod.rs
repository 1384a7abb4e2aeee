//! Format contexts and the markup writer collaborator.
//!
//! The core does not own markup rules; it owns *where* output goes and in
//! what insertion mode. Serialization of a tag + attributes into bytes is
//! delegated to a [`MarkupWriter`], and the out-of-band wire protocol
//! (placeholders, boundary framing, patch instructions) lives in [`wire`].

pub mod wire;
pub mod writer;

pub use writer::{HtmlWriter, MarkupWriter};

use serde::{Deserialize, Serialize};

/// The markup insertion mode at a tree position.
///
/// Foreign-content subtrees need different hidden-container wrappers when a
/// late segment is flushed out of band, so the mode is captured per segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InsertionMode {
    /// Ordinary markup content.
    #[default]
    Html,
    /// Inside an `svg` subtree.
    Svg,
    /// Inside a `math` subtree.
    MathMl,
}

/// The captured format state a task renders under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatContext {
    /// The insertion mode in effect.
    pub insertion_mode: InsertionMode,
}

impl FormatContext {
    /// The root format context.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            insertion_mode: InsertionMode::Html,
        }
    }

    /// The format context for children of `tag`.
    #[must_use]
    pub fn for_child(self, tag: &str) -> Self {
        let insertion_mode = match tag {
            "svg" => InsertionMode::Svg,
            "math" => InsertionMode::MathMl,
            // Foreign content re-enters ordinary markup.
            "foreignObject" | "annotation-xml" => InsertionMode::Html,
            _ => self.insertion_mode,
        };
        Self { insertion_mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svg_enters_and_foreign_object_exits() {
        let root = FormatContext::root();
        let svg = root.for_child("svg");
        assert_eq!(svg.insertion_mode, InsertionMode::Svg);
        let inner = svg.for_child("g");
        assert_eq!(inner.insertion_mode, InsertionMode::Svg);
        let foreign = inner.for_child("foreignObject");
        assert_eq!(foreign.insertion_mode, InsertionMode::Html);
    }

    #[test]
    fn plain_tags_inherit() {
        let root = FormatContext::root();
        assert_eq!(root.for_child("div"), root);
    }
}
