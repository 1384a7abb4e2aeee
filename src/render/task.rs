//! Task records: one scheduled unit of tree-walking render work.
//!
//! A task captures everything needed to (re)enter the tree at one position:
//! the node to render, the enclosing boundary, the segment it writes into
//! (none for replay tasks), and the key-path / tree-context / format /
//! component-context snapshots taken at the suspension point. Tasks are
//! stored in the request's slot arena and taken out while they run; a task
//! that suspends is replaced by a fresh task carrying the captured state.

use crate::format::FormatContext;
use crate::render::replay::ReplayFrameRef;
use crate::tree::{ContextMap, Node};
use crate::types::{BoundaryId, KeyPath, SegmentId, TaskId, TreeContext};

/// Which abortable set a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortSet {
    /// The request-wide set walked by a hard abort.
    Render,
    /// A boundary's fallback set, soft-aborted when content completes.
    Fallback(BoundaryId),
}

/// One scheduled unit of render work.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    /// The node to render; taken while the task runs.
    pub(crate) node: Option<Node>,
    /// Sibling index of `node` under `key_path`, or -1 when `node` sits
    /// exactly at `key_path`.
    pub(crate) child_index: i32,
    /// The enclosing boundary, or `None` at the document root.
    pub(crate) boundary: Option<BoundaryId>,
    /// Output target; `None` for replay tasks, which emit nothing until
    /// they reach a resumable slot.
    pub(crate) segment: Option<SegmentId>,
    /// Replay ledger frame for resumed renders.
    pub(crate) replay: Option<ReplayFrameRef>,
    /// Tree address at the task's entry point.
    pub(crate) key_path: KeyPath,
    /// Sibling-index chain for deterministic id generation.
    pub(crate) tree_context: TreeContext,
    /// Format state captured at the suspension point.
    pub(crate) format_context: FormatContext,
    /// Component-context snapshot captured at the suspension point.
    pub(crate) context: ContextMap,
    /// Which abort set this task registered with.
    pub(crate) abort_set: AbortSet,
    /// Consecutive synchronous re-render attempts; bounded by the
    /// scheduler's safety valve.
    pub(crate) sync_reattempts: u32,
}
