//! Stable tree-position addresses.
//!
//! A [`KeyPath`] is a persistent cons list of `(name, key-or-index)` frames
//! describing where in the component tree a piece of work lives. Two renders
//! of the same tree produce equal key paths for the same position because
//! frames derive from node names, explicit keys, and sibling indices, never
//! from object identity. This is what lets a resumed render reconnect to the
//! positions a previous render deferred.

use core::fmt;
use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// The disambiguator within one level of the tree: an explicit key if the
/// node carried one, otherwise the sibling index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyOrIndex {
    /// Position by sibling index.
    Index(u32),
    /// Position by explicit key.
    Key(String),
}

impl fmt::Display for KeyOrIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => write!(f, "{k:?}"),
        }
    }
}

struct KeyFrame {
    parent: KeyPath,
    name: Option<Rc<str>>,
    key: KeyOrIndex,
}

/// A persistent tree-position address with structural equality.
///
/// Cloning is cheap (one reference-count bump). The empty path addresses
/// the document root.
#[derive(Clone, Default)]
pub struct KeyPath(Option<Rc<KeyFrame>>);

impl KeyPath {
    /// The root address.
    #[must_use]
    pub fn root() -> Self {
        Self(None)
    }

    /// Returns true if this is the root address.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_none()
    }

    /// Extends this path with one child frame.
    #[must_use]
    pub fn child(&self, name: Option<&str>, key: KeyOrIndex) -> Self {
        Self(Some(Rc::new(KeyFrame {
            parent: self.clone(),
            name: name.map(Rc::from),
            key,
        })))
    }

    /// Returns the parent address, or the root if this is the root.
    #[must_use]
    pub fn parent(&self) -> Self {
        match &self.0 {
            Some(frame) => frame.parent.clone(),
            None => Self(None),
        }
    }

    /// Returns the innermost frame's name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.as_ref().and_then(|f| f.name.as_deref())
    }

    /// Returns the innermost frame's key-or-index.
    #[must_use]
    pub fn key(&self) -> Option<&KeyOrIndex> {
        self.0.as_ref().map(|f| &f.key)
    }

    /// Replaces the innermost frame's name, keeping parent and key.
    ///
    /// Used to derive the fallback address from a boundary's content
    /// address: same parent, same key, a distinct name.
    #[must_use]
    pub fn with_name(&self, name: &str) -> Self {
        match &self.0 {
            Some(frame) => frame.parent.child(Some(name), frame.key.clone()),
            None => Self(None),
        }
    }

    /// Depth of the path (number of frames).
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = &self.0;
        while let Some(frame) = cur {
            n += 1;
            cur = &frame.parent.0;
        }
        n
    }
}

impl PartialEq for KeyPath {
    fn eq(&self, other: &Self) -> bool {
        let mut a = &self.0;
        let mut b = &other.0;
        loop {
            match (a, b) {
                (None, None) => return true,
                (Some(fa), Some(fb)) => {
                    if Rc::ptr_eq(fa, fb) {
                        return true;
                    }
                    if fa.name != fb.name || fa.key != fb.key {
                        return false;
                    }
                    a = &fa.parent.0;
                    b = &fb.parent.0;
                }
                _ => return false,
            }
        }
    }
}

impl Eq for KeyPath {}

impl Hash for KeyPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut cur = &self.0;
        while let Some(frame) = cur {
            frame.name.hash(state);
            frame.key.hash(state);
            cur = &frame.parent.0;
        }
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut frames = Vec::new();
        let mut cur = &self.0;
        while let Some(frame) = cur {
            frames.push(frame);
            cur = &frame.parent.0;
        }
        write!(f, "/")?;
        for frame in frames.iter().rev() {
            match &frame.name {
                Some(name) => write!(f, "{name}[{}]/", frame.key)?,
                None => write!(f, "[{}]/", frame.key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn structural_equality_ignores_identity() {
        let a = KeyPath::root()
            .child(Some("list"), KeyOrIndex::Index(0))
            .child(Some("item"), KeyOrIndex::Key("a".into()));
        let b = KeyPath::root()
            .child(Some("list"), KeyOrIndex::Index(0))
            .child(Some("item"), KeyOrIndex::Key("a".into()));
        assert_eq!(a, b);

        let c = b.parent().child(Some("item"), KeyOrIndex::Key("b".into()));
        assert_ne!(a, c);
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        let path = KeyPath::root().child(Some("Suspense"), KeyOrIndex::Index(2));
        map.insert(path.clone(), 7u32);
        let lookup = KeyPath::root().child(Some("Suspense"), KeyOrIndex::Index(2));
        assert_eq!(map.get(&lookup), Some(&7));
    }

    #[test]
    fn with_name_keeps_parent_and_key() {
        let content = KeyPath::root()
            .child(Some("main"), KeyOrIndex::Index(0))
            .child(Some("Suspense"), KeyOrIndex::Index(3));
        let fallback = content.with_name("Suspense Fallback");
        assert_eq!(fallback.parent(), content.parent());
        assert_eq!(fallback.key(), Some(&KeyOrIndex::Index(3)));
        assert_eq!(fallback.name(), Some("Suspense Fallback"));
        assert_ne!(fallback, content);
    }

    #[test]
    fn depth_counts_frames() {
        assert_eq!(KeyPath::root().depth(), 0);
        let p = KeyPath::root().child(None, KeyOrIndex::Index(0));
        assert_eq!(p.depth(), 1);
    }
}
