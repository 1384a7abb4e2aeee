//! Suspense boundaries: the recoverable-failure and deferral unit.
//!
//! A boundary owns a content subtree and a fallback subtree and tracks how
//! many tasks are still working inside its content. Errors below a boundary
//! are absorbed here and converted into a client-rendered fallback; they
//! never travel further up.

use crate::types::{KeyPath, SegmentId, TaskId};
use smallvec::SmallVec;
use std::collections::HashSet;

/// Lifecycle of a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundaryStatus {
    /// Content tasks outstanding; the fallback shows at this position.
    Pending,
    /// Content finished without error.
    Completed,
    /// Content failed (or was aborted); the client takes over from the
    /// fallback using the recorded digest.
    ClientRendered,
    /// Content was deliberately deferred into the resume ledger.
    Postponed,
}

/// The suspense/error-recovery unit.
pub(crate) struct Boundary {
    pub(crate) status: BoundaryStatus,
    /// Shared numeric id of the boundary anchor and its root content
    /// segment on the wire; assigned when the pending form first flushes.
    pub(crate) wire_id: Option<u32>,
    /// Content tasks still running.
    pub(crate) pending_tasks: u32,
    /// Completed-but-unflushed content segments, in completion order.
    pub(crate) completed_segments: SmallVec<[SegmentId; 2]>,
    /// Fallback tasks eligible for soft-abort once content completes.
    pub(crate) fallback_abortable_tasks: HashSet<TaskId>,
    /// Opaque token from the error reporter; the only error information
    /// that ever reaches the wire.
    pub(crate) error_digest: Option<String>,
    /// True once this boundary's position reached the sink, meaning later
    /// completions must flush out of band.
    pub(crate) parent_flushed: bool,
    /// Bytes accumulated by content rendering, for the large-boundary rule.
    pub(crate) byte_size: usize,
    /// Tree address of the content subtree, for the resume ledger.
    pub(crate) content_key_path: KeyPath,
    /// Tree address of the fallback subtree.
    pub(crate) fallback_key_path: KeyPath,
}

impl Boundary {
    pub(crate) fn new(content_key_path: KeyPath, fallback_key_path: KeyPath) -> Self {
        Self {
            status: BoundaryStatus::Pending,
            wire_id: None,
            pending_tasks: 0,
            completed_segments: SmallVec::new(),
            fallback_abortable_tasks: HashSet::new(),
            error_digest: None,
            parent_flushed: false,
            byte_size: 0,
            content_key_path,
            fallback_key_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyOrIndex;

    #[test]
    fn new_boundary_is_pending_with_no_tasks() {
        let content = KeyPath::root().child(Some("Suspense"), KeyOrIndex::Index(0));
        let fallback = content.with_name("Suspense Fallback");
        let b = Boundary::new(content.clone(), fallback.clone());
        assert_eq!(b.status, BoundaryStatus::Pending);
        assert_eq!(b.pending_tasks, 0);
        assert_eq!(b.wire_id, None);
        assert_eq!(b.content_key_path, content);
        assert_eq!(b.fallback_key_path, fallback);
    }
}
