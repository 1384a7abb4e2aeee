//! The node sum type and its builders.
//!
//! Every tree position the renderer can encounter is one of the closed set
//! of [`NodeKind`] variants, matched exhaustively by the scheduler. Nodes
//! are cheap to clone (the payload sits behind an `Rc`), which is what lets
//! a suspended subtree be captured into a continuation task without copying
//! the tree.

use crate::tree::awaitable::Awaitable;
use crate::tree::context::ContextMap;
use core::fmt;
use std::rc::Rc;

/// The name under which suspense boundaries appear in key paths and the
/// resume ledger.
pub(crate) const SUSPENSE_NAME: &str = "Suspense";

/// The key-path name of a boundary's fallback subtree.
pub(crate) const SUSPENSE_FALLBACK_NAME: &str = "Suspense Fallback";

/// A host element: a tag, attributes, and children.
#[derive(Clone)]
pub struct Element {
    /// Tag name, handed to the markup writer for validation.
    pub tag: String,
    /// Attribute name/value pairs in source order.
    pub attrs: Vec<(String, String)>,
    /// Optional explicit key.
    pub key: Option<String>,
    /// Child nodes.
    pub children: Vec<Node>,
}

/// A suspense boundary marker: independently renderable content with a
/// fallback shown while the content is pending.
#[derive(Clone)]
pub struct Suspense {
    /// Optional explicit key.
    pub key: Option<String>,
    /// Fallback subtree, rendered into the boundary's position while the
    /// content has not completed.
    pub fallback: Vec<Node>,
    /// Content subtree.
    pub children: Vec<Node>,
}

/// What a component evaluation produced.
///
/// This is the explicit tagged outcome the scheduler consumes; components
/// never signal suspension or deferral by unwinding.
pub enum ComponentOutput {
    /// The component produced its subtree.
    Ready(Node),
    /// The component needs the carried awaitable settled before it can
    /// produce output.
    Suspend(Awaitable),
    /// The component asks to be deliberately deferred to a later resume
    /// pass. Only meaningful in a resumable render.
    Postpone,
    /// The component failed.
    Failed(crate::error::RenderError),
}

/// What a component sees when evaluated.
pub struct ComponentScope<'a> {
    /// The context snapshot at this tree position.
    pub context: &'a ContextMap,
    /// A deterministic id derived from the tree position, stable across
    /// render and resume passes.
    pub id: String,
}

type RenderFn = dyn Fn(&ComponentScope<'_>) -> ComponentOutput;

#[derive(Clone)]
pub(crate) struct Component {
    pub(crate) name: String,
    pub(crate) key: Option<String>,
    pub(crate) render: Rc<RenderFn>,
}

#[derive(Clone)]
pub(crate) enum NodeKind {
    Text(String),
    Element(Element),
    Fragment {
        key: Option<String>,
        children: Vec<Node>,
    },
    Component(Component),
    Async(Awaitable),
    Suspense(Suspense),
    ContextProvider {
        name: String,
        value: String,
        children: Vec<Node>,
    },
}

/// One position in a component tree.
#[derive(Clone)]
pub struct Node {
    kind: Rc<NodeKind>,
}

impl Node {
    fn from_kind(kind: NodeKind) -> Self {
        Self {
            kind: Rc::new(kind),
        }
    }

    pub(crate) fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// A text node.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_kind(NodeKind::Text(text.into()))
    }

    /// A host element.
    #[must_use]
    pub fn element(tag: &str, attrs: &[(&str, &str)], children: Vec<Node>) -> Self {
        Self::from_kind(NodeKind::Element(Element {
            tag: tag.to_owned(),
            attrs: attrs
                .iter()
                .map(|(n, v)| ((*n).to_owned(), (*v).to_owned()))
                .collect(),
            key: None,
            children,
        }))
    }

    /// A keyless grouping of siblings.
    #[must_use]
    pub fn fragment(children: Vec<Node>) -> Self {
        Self::from_kind(NodeKind::Fragment {
            key: None,
            children,
        })
    }

    /// A black-box component evaluated by callback.
    #[must_use]
    pub fn component(
        name: &str,
        render: impl Fn(&ComponentScope<'_>) -> ComponentOutput + 'static,
    ) -> Self {
        Self::from_kind(NodeKind::Component(Component {
            name: name.to_owned(),
            key: None,
            render: Rc::new(render),
        }))
    }

    /// A node whose content arrives through an awaitable.
    ///
    /// Unsettled at render time, the enclosing task suspends on it;
    /// resolved, the produced node renders in place.
    #[must_use]
    pub fn async_node(awaitable: Awaitable) -> Self {
        Self::from_kind(NodeKind::Async(awaitable))
    }

    /// A suspense boundary.
    #[must_use]
    pub fn suspense(fallback: Vec<Node>, children: Vec<Node>) -> Self {
        Self::from_kind(NodeKind::Suspense(Suspense {
            key: None,
            fallback,
            children,
        }))
    }

    /// A context provider scoping `name = value` over its children.
    #[must_use]
    pub fn provider(name: &str, value: &str, children: Vec<Node>) -> Self {
        Self::from_kind(NodeKind::ContextProvider {
            name: name.to_owned(),
            value: value.to_owned(),
            children,
        })
    }

    /// Returns this node with an explicit key.
    ///
    /// Keys disambiguate siblings for the resume protocol; nodes that
    /// cannot carry a key (text, async, providers) are returned unchanged.
    #[must_use]
    pub fn with_key(self, key: &str) -> Self {
        let mut kind = (*self.kind).clone();
        match &mut kind {
            NodeKind::Element(el) => el.key = Some(key.to_owned()),
            NodeKind::Fragment { key: k, .. } => *k = Some(key.to_owned()),
            NodeKind::Component(c) => c.key = Some(key.to_owned()),
            NodeKind::Suspense(s) => s.key = Some(key.to_owned()),
            NodeKind::Text(_) | NodeKind::Async(_) | NodeKind::ContextProvider { .. } => {
                return self
            }
        }
        Self::from_kind(kind)
    }

    /// The name this node contributes to key paths, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self.kind() {
            NodeKind::Element(el) => Some(&el.tag),
            NodeKind::Component(c) => Some(&c.name),
            NodeKind::Suspense(_) => Some(SUSPENSE_NAME),
            NodeKind::Text(_)
            | NodeKind::Fragment { .. }
            | NodeKind::Async(_)
            | NodeKind::ContextProvider { .. } => None,
        }
    }

    /// The explicit key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self.kind() {
            NodeKind::Element(el) => el.key.as_deref(),
            NodeKind::Fragment { key, .. } => key.as_deref(),
            NodeKind::Component(c) => c.key.as_deref(),
            NodeKind::Suspense(s) => s.key.as_deref(),
            NodeKind::Text(_) | NodeKind::Async(_) | NodeKind::ContextProvider { .. } => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            NodeKind::Text(t) => f.debug_tuple("Text").field(t).finish(),
            NodeKind::Element(el) => f
                .debug_struct("Element")
                .field("tag", &el.tag)
                .field("children", &el.children.len())
                .finish(),
            NodeKind::Fragment { children, .. } => {
                f.debug_tuple("Fragment").field(&children.len()).finish()
            }
            NodeKind::Component(c) => f.debug_tuple("Component").field(&c.name).finish(),
            NodeKind::Async(aw) => f.debug_tuple("Async").field(&aw.status()).finish(),
            NodeKind::Suspense(s) => f
                .debug_struct("Suspense")
                .field("children", &s.children.len())
                .finish(),
            NodeKind::ContextProvider { name, .. } => {
                f.debug_tuple("ContextProvider").field(name).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_node_kind() {
        assert_eq!(Node::element("div", &[], vec![]).name(), Some("div"));
        assert_eq!(
            Node::suspense(vec![], vec![]).name(),
            Some(SUSPENSE_NAME)
        );
        assert_eq!(Node::text("x").name(), None);
        assert_eq!(Node::fragment(vec![]).name(), None);
    }

    #[test]
    fn with_key_applies_to_keyable_kinds() {
        let el = Node::element("li", &[], vec![]).with_key("row-3");
        assert_eq!(el.key(), Some("row-3"));
        let text = Node::text("x").with_key("ignored");
        assert_eq!(text.key(), None);
    }

    #[test]
    fn clone_shares_payload() {
        let a = Node::element("p", &[], vec![Node::text("hi")]);
        let b = a.clone();
        assert!(Rc::ptr_eq(&a.kind, &b.kind));
    }
}
