//! Sibling-index chains for deterministic id generation.
//!
//! A [`TreeContext`] records the path of sibling indices from the root to
//! the current render position. Components can materialize it into a stable
//! identifier that is identical across a render and a later resume of the
//! same tree, because it depends only on tree shape, never on scheduling
//! order.

use std::rc::Rc;

struct TreeFrame {
    parent: TreeContext,
    index: u32,
}

/// A persistent chain of sibling indices.
///
/// Cloning is cheap (one reference-count bump).
#[derive(Clone, Default)]
pub struct TreeContext(Option<Rc<TreeFrame>>);

impl TreeContext {
    /// The root context.
    #[must_use]
    pub fn root() -> Self {
        Self(None)
    }

    /// Extends the context with one level at the given sibling index.
    #[must_use]
    pub fn push(&self, index: u32) -> Self {
        Self(Some(Rc::new(TreeFrame {
            parent: self.clone(),
            index,
        })))
    }

    /// Materializes a deterministic id such as `:pR0.2.1:`.
    ///
    /// The prefix namespaces ids when several requests render into the same
    /// document.
    #[must_use]
    pub fn to_id(&self, prefix: &str) -> String {
        let mut indices = Vec::new();
        let mut cur = &self.0;
        while let Some(frame) = cur {
            indices.push(frame.index);
            cur = &frame.parent.0;
        }
        let mut out = String::with_capacity(prefix.len() + indices.len() * 2 + 4);
        out.push(':');
        out.push_str(prefix);
        out.push('R');
        for (pos, idx) in indices.iter().rev().enumerate() {
            if pos > 0 {
                out.push('.');
            }
            out.push_str(&idx.to_string());
        }
        out.push(':');
        out
    }
}
