//! The resource-registry collaborator and the resumable snapshot.
//!
//! Resource policy (what to preload, when to hint) is external; the core
//! only needs idempotent registration so a hint is emitted at most once per
//! request, and a serializable snapshot so a resumed render does not repeat
//! what the first pass already delivered. The snapshot also carries the
//! "instruction function already sent" flags used by the wire protocol:
//! the first out-of-band patch of each kind ships its script body, later
//! ones only the call.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A queued resource hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadDescriptor {
    /// Registry key, typically the resource URL.
    pub key: String,
    /// Pre-serialized hint markup to place in front of the shell.
    pub chunk: Bytes,
}

/// Idempotent per-request resource registration.
pub trait ResourceRegistry {
    /// Returns true if `key` was already registered.
    fn has_resource(&self, key: &str) -> bool;

    /// Registers `key`; returns true if it was newly inserted.
    fn mark_resource(&mut self, key: &str) -> bool;

    /// Queues a hint for emission in front of the next flushed content.
    fn queue_preload(&mut self, descriptor: PreloadDescriptor);

    /// Drains the queued hint chunks in insertion order.
    fn take_queued_chunks(&mut self) -> Vec<Bytes>;

    /// Snapshot of every registered key, for the resume token.
    fn registered_keys(&self) -> BTreeSet<String>;

    /// Seeds the registry from a prior pass's snapshot.
    fn restore_keys(&mut self, keys: &BTreeSet<String>);
}

/// The default registry: a dedup set plus a hint queue.
#[derive(Debug, Default)]
pub struct DedupResources {
    registered: BTreeSet<String>,
    queued: Vec<PreloadDescriptor>,
}

impl DedupResources {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceRegistry for DedupResources {
    fn has_resource(&self, key: &str) -> bool {
        self.registered.contains(key)
    }

    fn mark_resource(&mut self, key: &str) -> bool {
        self.registered.insert(key.to_owned())
    }

    fn queue_preload(&mut self, descriptor: PreloadDescriptor) {
        if self.mark_resource(&descriptor.key) {
            self.queued.push(descriptor);
        }
    }

    fn take_queued_chunks(&mut self) -> Vec<Bytes> {
        self.queued.drain(..).map(|d| d.chunk).collect()
    }

    fn registered_keys(&self) -> BTreeSet<String> {
        self.registered.clone()
    }

    fn restore_keys(&mut self, keys: &BTreeSet<String>) {
        for key in keys {
            self.registered.insert(key.clone());
        }
    }
}

/// Bit flag: the complete-segment script body was sent.
pub(crate) const SENT_COMPLETE_SEGMENT_FN: u8 = 1;
/// Bit flag: the complete-boundary script body was sent.
pub(crate) const SENT_COMPLETE_BOUNDARY_FN: u8 = 1 << 1;
/// Bit flag: the client-render script body was sent.
pub(crate) const SENT_CLIENT_RENDER_FN: u8 = 1 << 2;

/// Per-request wire state that must survive into a resumed render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableState {
    /// Which instruction script bodies were already delivered.
    pub(crate) instructions: u8,
    /// Keys the resource registry had registered when the pass ended.
    pub(crate) resources: BTreeSet<String>,
}

impl ResumableState {
    /// Returns true if the given instruction bit is set.
    pub(crate) fn has_instruction(&self, bit: u8) -> bool {
        self.instructions & bit != 0
    }

    /// Sets the given instruction bit, returning true if it was newly set.
    pub(crate) fn mark_instruction(&mut self, bit: u8) -> bool {
        let newly = self.instructions & bit == 0;
        self.instructions |= bit;
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preload_is_deduplicated_by_key() {
        let mut reg = DedupResources::new();
        reg.queue_preload(PreloadDescriptor {
            key: "/app.css".into(),
            chunk: Bytes::from_static(b"<link rel=\"preload\" href=\"/app.css\">"),
        });
        reg.queue_preload(PreloadDescriptor {
            key: "/app.css".into(),
            chunk: Bytes::from_static(b"dup"),
        });
        assert_eq!(reg.take_queued_chunks().len(), 1);
        assert!(reg.has_resource("/app.css"));
        assert!(reg.take_queued_chunks().is_empty());
    }

    #[test]
    fn restore_seeds_dedup() {
        let mut first = DedupResources::new();
        first.mark_resource("/a.js");
        let snapshot = first.registered_keys();

        let mut resumed = DedupResources::new();
        resumed.restore_keys(&snapshot);
        assert!(!resumed.mark_resource("/a.js"));
    }

    #[test]
    fn instruction_bits_latch() {
        let mut state = ResumableState::default();
        assert!(state.mark_instruction(SENT_COMPLETE_BOUNDARY_FN));
        assert!(!state.mark_instruction(SENT_COMPLETE_BOUNDARY_FN));
        assert!(state.has_instruction(SENT_COMPLETE_BOUNDARY_FN));
        assert!(!state.has_instruction(SENT_CLIENT_RENDER_FN));
    }
}
