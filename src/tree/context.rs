//! Immutable component-context snapshots.
//!
//! The renderer treats context semantics as a collaborator concern; what the
//! core owns is the ability to *snapshot* the context at a suspension point
//! and restore it when the continuation task resumes. A [`ContextMap`] is a
//! persistent chain of provided values, so snapshotting is a clone and
//! restoring is an assignment.

use std::rc::Rc;

struct ContextFrame {
    parent: ContextMap,
    name: Rc<str>,
    value: Rc<str>,
}

/// A persistent map of context values keyed by provider name.
///
/// Cloning is cheap; lookups walk the chain inner-to-outer so the nearest
/// provider wins.
#[derive(Clone, Default)]
pub struct ContextMap(Option<Rc<ContextFrame>>);

impl ContextMap {
    /// The empty context.
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    /// Returns a context extended with one provided value.
    #[must_use]
    pub fn with(&self, name: &str, value: &str) -> Self {
        Self(Some(Rc::new(ContextFrame {
            parent: self.clone(),
            name: Rc::from(name),
            value: Rc::from(value),
        })))
    }

    /// Looks up the nearest provided value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let mut cur = &self.0;
        while let Some(frame) = cur {
            if &*frame.name == name {
                return Some(&frame.value);
            }
            cur = &frame.parent.0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_provider_wins() {
        let outer = ContextMap::empty().with("theme", "light");
        let inner = outer.with("theme", "dark");
        assert_eq!(outer.get("theme"), Some("light"));
        assert_eq!(inner.get("theme"), Some("dark"));
    }

    #[test]
    fn missing_name_is_none() {
        assert_eq!(ContextMap::empty().get("lang"), None);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_extension() {
        let snap = ContextMap::empty().with("lang", "en");
        let _later = snap.with("lang", "de");
        assert_eq!(snap.get("lang"), Some("en"));
    }
}
