//! The render session: one `Request` per render invocation.
//!
//! The request owns every arena (segments, boundaries, task slots), the
//! ready queue, the completion queues the flush protocol drains, the
//! collaborators (markup writer, resource registry, sink), and the caller's
//! milestone callbacks. Every mutation of render state goes through
//! `&mut Request` on the single driving thread; suspension points are the
//! only places control leaves the scheduler.

use crate::error::RenderError;
use crate::format::{FormatContext, HtmlWriter, MarkupWriter};
use crate::render::boundary::Boundary;
use crate::render::replay::{ReplayFrame, ResumeSlot, ResumeToken, TrackedPostpones};
use crate::render::segment::Segment;
use crate::render::task::{AbortSet, Task};
use crate::resources::{DedupResources, ResourceRegistry, ResumableState};
use crate::sink::{ChunkSink, DEFAULT_SINK_BUFFER};
use crate::tree::awaitable::PingQueue;
use crate::tree::{ContextMap, Node};
use crate::types::{BoundaryId, KeyPath, SegmentId, TaskId, TreeContext};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

/// Default threshold above which a completed boundary is flushed as a
/// pending placeholder instead of inline, so one large boundary cannot
/// block delivery of everything after it.
pub const DEFAULT_PROGRESSIVE_CHUNK_SIZE: usize = 12_800;

/// Bound on consecutive synchronous re-render attempts of one task.
pub(crate) const MAX_SYNC_REATTEMPTS: u32 = 25;

/// Overall request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestStatus {
    /// Accepting work and flushing as it completes.
    Open,
    /// An abort is in progress; remaining tasks fail uniformly.
    Aborting,
    /// All output delivered and the sink closed.
    Closed,
    /// A fatal error ended the request.
    Fatal,
}

impl RequestStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Fatal)
    }
}

/// Whether a request records deliberate deferrals for later resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Immediately-flowing render; postpones are errors.
    Streaming,
    /// Resumable render; postpones are recorded into the resume ledger.
    Resumable,
}

/// Tunables for a render session.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    progressive_chunk_size: usize,
    identifier_prefix: String,
    sink_buffer_size: usize,
}

impl RenderOptions {
    /// Options with default sizes and an empty identifier prefix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            progressive_chunk_size: DEFAULT_PROGRESSIVE_CHUNK_SIZE,
            identifier_prefix: String::new(),
            sink_buffer_size: DEFAULT_SINK_BUFFER,
        }
    }

    /// Sets the large-boundary threshold in bytes.
    #[must_use]
    pub fn with_progressive_chunk_size(mut self, bytes: usize) -> Self {
        self.progressive_chunk_size = bytes;
        self
    }

    /// Namespaces all wire ids, for pages hosting several streams.
    #[must_use]
    pub fn with_identifier_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.identifier_prefix = prefix.into();
        self
    }

    /// Sets the sink batching buffer size in bytes.
    #[must_use]
    pub fn with_sink_buffer_size(mut self, bytes: usize) -> Self {
        self.sink_buffer_size = bytes;
        self
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Milestone and error callbacks for a render session.
///
/// `on_error` doubles as the digest source: whatever it returns is the only
/// error information that ever appears on the wire.
#[derive(Default)]
pub struct RenderCallbacks {
    pub(crate) on_error: Option<Box<dyn FnMut(&RenderError) -> Option<String>>>,
    pub(crate) on_postpone: Option<Box<dyn FnMut(&KeyPath)>>,
    pub(crate) on_shell_ready: Option<Box<dyn FnOnce()>>,
    pub(crate) on_shell_error: Option<Box<dyn FnOnce(&RenderError)>>,
    pub(crate) on_all_ready: Option<Box<dyn FnOnce()>>,
    pub(crate) on_fatal_error: Option<Box<dyn FnOnce(&RenderError)>>,
}

impl RenderCallbacks {
    /// No callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per recoverable error; the returned digest is attached
    /// to the failed boundary on the wire.
    #[must_use]
    pub fn on_error(mut self, f: impl FnMut(&RenderError) -> Option<String> + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called for every recorded deferral with the deferred key path.
    #[must_use]
    pub fn on_postpone(mut self, f: impl FnMut(&KeyPath) + 'static) -> Self {
        self.on_postpone = Some(Box::new(f));
        self
    }

    /// Called once when the shell (everything outside pending boundaries)
    /// is complete.
    #[must_use]
    pub fn on_shell_ready(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_shell_ready = Some(Box::new(f));
        self
    }

    /// Called when a fatal error occurs before the shell completed.
    #[must_use]
    pub fn on_shell_error(mut self, f: impl FnOnce(&RenderError) + 'static) -> Self {
        self.on_shell_error = Some(Box::new(f));
        self
    }

    /// Called once when every boundary has settled.
    #[must_use]
    pub fn on_all_ready(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_all_ready = Some(Box::new(f));
        self
    }

    /// Called once if the request ends with a fatal error.
    #[must_use]
    pub fn on_fatal_error(mut self, f: impl FnOnce(&RenderError) + 'static) -> Self {
        self.on_fatal_error = Some(Box::new(f));
        self
    }
}

/// The top-level render session.
pub struct Request {
    pub(crate) status: RequestStatus,
    pub(crate) fatal: Option<RenderError>,
    pub(crate) next_wire_id: u32,
    pub(crate) progressive_chunk_size: usize,
    pub(crate) identifier_prefix: String,
    pub(crate) sink_buffer_size: usize,

    pub(crate) segments: Vec<Segment>,
    pub(crate) boundaries: Vec<Boundary>,
    pub(crate) tasks: Vec<Option<Task>>,

    pub(crate) pinged: PingQueue,
    pub(crate) pending_root_tasks: u32,
    pub(crate) all_pending_tasks: u32,

    pub(crate) completed_root_segment: Option<SegmentId>,
    pub(crate) client_rendered_boundaries: Vec<BoundaryId>,
    pub(crate) completed_boundaries: Vec<BoundaryId>,
    pub(crate) partial_boundaries: Vec<BoundaryId>,
    pub(crate) abortable_tasks: HashSet<TaskId>,

    pub(crate) tracked: Option<TrackedPostpones>,
    pub(crate) callbacks: RenderCallbacks,
    pub(crate) writer: Box<dyn MarkupWriter>,
    pub(crate) resources: Box<dyn ResourceRegistry>,
    pub(crate) resumable: ResumableState,
    pub(crate) root_format_context: FormatContext,
    pub(crate) sink: Option<ChunkSink>,
}

impl Request {
    /// Creates a request with the given tree at its root and schedules the
    /// root task.
    pub(crate) fn new(
        node: Node,
        mode: RenderMode,
        options: RenderOptions,
        callbacks: RenderCallbacks,
        writer: Box<dyn MarkupWriter>,
        resources: Box<dyn ResourceRegistry>,
    ) -> Self {
        let mut req = Self::empty(options, callbacks, writer, resources);
        if mode == RenderMode::Resumable {
            req.tracked = Some(TrackedPostpones::new());
        }
        let root_segment =
            req.create_segment(0, None, req.root_format_context, false);
        req.segments[root_segment.index()].parent_flushed = true;
        let root_task = req.create_task(
            Some(node),
            -1,
            None,
            Some(root_segment),
            None,
            KeyPath::root(),
            TreeContext::root(),
            req.root_format_context,
            ContextMap::empty(),
            AbortSet::Render,
        );
        req.schedule(root_task);
        req
    }

    /// Reconstructs a request from a resume token, seeding either a direct
    /// render task at the recorded root slot or a replay task carrying the
    /// recorded ledger.
    pub(crate) fn resume(
        node: Node,
        token: ResumeToken,
        options: RenderOptions,
        callbacks: RenderCallbacks,
        writer: Box<dyn MarkupWriter>,
        mut resources: Box<dyn ResourceRegistry>,
    ) -> Self {
        resources.restore_keys(&token.resumable.resources);
        let options = options
            .with_progressive_chunk_size(token.progressive_chunk_size);
        let mut req = Self::empty(options, callbacks, writer, resources);
        req.next_wire_id = token.next_wire_id;
        req.root_format_context = token.root_format_context;
        req.resumable = token.resumable.clone();

        if token.replay_nodes.is_empty() {
            if let ResumeSlot::Id(slot) = token.replay_root_slot {
                // Exactly one resumable point at the root: render straight
                // into the recorded segment.
                let segment =
                    req.create_segment(0, None, req.root_format_context, false);
                {
                    let seg = &mut req.segments[segment.index()];
                    seg.wire_id = Some(slot);
                    seg.parent_flushed = true;
                }
                let task = req.create_task(
                    Some(node),
                    -1,
                    None,
                    Some(segment),
                    None,
                    KeyPath::root(),
                    TreeContext::root(),
                    req.root_format_context,
                    ContextMap::empty(),
                    AbortSet::Render,
                );
                req.schedule(task);
                return req;
            }
        }

        let slots = match token.replay_root_slot {
            ResumeSlot::Children(map) => map,
            ResumeSlot::None | ResumeSlot::Id(_) => Default::default(),
        };
        let frame = ReplayFrame::new(token.replay_nodes, slots);
        let task = req.create_task(
            Some(node),
            -1,
            None,
            None,
            Some(frame),
            KeyPath::root(),
            TreeContext::root(),
            req.root_format_context,
            ContextMap::empty(),
            AbortSet::Render,
        );
        req.schedule(task);
        req
    }

    fn empty(
        options: RenderOptions,
        callbacks: RenderCallbacks,
        writer: Box<dyn MarkupWriter>,
        resources: Box<dyn ResourceRegistry>,
    ) -> Self {
        Self {
            status: RequestStatus::Open,
            fatal: None,
            next_wire_id: 0,
            progressive_chunk_size: options.progressive_chunk_size,
            identifier_prefix: options.identifier_prefix,
            sink_buffer_size: options.sink_buffer_size,
            segments: Vec::new(),
            boundaries: Vec::new(),
            tasks: Vec::new(),
            pinged: Rc::new(RefCell::new(VecDeque::new())),
            pending_root_tasks: 0,
            all_pending_tasks: 0,
            completed_root_segment: None,
            client_rendered_boundaries: Vec::new(),
            completed_boundaries: Vec::new(),
            partial_boundaries: Vec::new(),
            abortable_tasks: HashSet::new(),
            tracked: None,
            callbacks,
            writer,
            resources,
            resumable: ResumableState::default(),
            root_format_context: FormatContext::root(),
            sink: None,
        }
    }

    /// Default collaborators for the convenience entry points.
    pub(crate) fn default_collaborators() -> (Box<dyn MarkupWriter>, Box<dyn ResourceRegistry>) {
        (
            Box::new(HtmlWriter::new()),
            Box::new(DedupResources::new()),
        )
    }

    // =========================================================================
    // Arena allocation
    // =========================================================================

    pub(crate) fn create_segment(
        &mut self,
        splice_index: usize,
        boundary: Option<BoundaryId>,
        format_context: FormatContext,
        text_embedded: bool,
    ) -> SegmentId {
        let id = SegmentId(self.segments.len() as u32);
        self.segments
            .push(Segment::new(splice_index, boundary, format_context, text_embedded));
        id
    }

    pub(crate) fn create_boundary(
        &mut self,
        content_key_path: KeyPath,
        fallback_key_path: KeyPath,
    ) -> BoundaryId {
        let id = BoundaryId(self.boundaries.len() as u32);
        self.boundaries
            .push(Boundary::new(content_key_path, fallback_key_path));
        id
    }

    /// Allocates a task, registers it with its abort set, and bumps the
    /// pending-work counters. The caller schedules it separately.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_task(
        &mut self,
        node: Option<Node>,
        child_index: i32,
        boundary: Option<BoundaryId>,
        segment: Option<SegmentId>,
        replay: Option<crate::render::replay::ReplayFrameRef>,
        key_path: KeyPath,
        tree_context: TreeContext,
        format_context: FormatContext,
        context: ContextMap,
        abort_set: AbortSet,
    ) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.all_pending_tasks += 1;
        match boundary {
            None => self.pending_root_tasks += 1,
            Some(b) => self.boundaries[b.index()].pending_tasks += 1,
        }
        match abort_set {
            AbortSet::Render => {
                self.abortable_tasks.insert(id);
            }
            AbortSet::Fallback(b) => {
                self.boundaries[b.index()]
                    .fallback_abortable_tasks
                    .insert(id);
            }
        }
        self.tasks.push(Some(Task {
            id,
            node,
            child_index,
            boundary,
            segment,
            replay,
            key_path,
            tree_context,
            format_context,
            context,
            abort_set,
            sync_reattempts: 0,
        }));
        id
    }

    /// Pushes a task onto the ready queue.
    pub(crate) fn schedule(&mut self, task: TaskId) {
        self.pinged.borrow_mut().push_back(task);
    }

    /// Takes a task out of its slot for execution.
    pub(crate) fn take_task(&mut self, task: TaskId) -> Option<Task> {
        self.tasks.get_mut(task.index()).and_then(Option::take)
    }

    /// Parks a suspended task back into its slot.
    pub(crate) fn park_task(&mut self, task: Task) {
        let slot = task.id.index();
        self.tasks[slot] = Some(task);
    }

    /// Removes a task from whichever abort set it registered with.
    pub(crate) fn deregister_abortable(&mut self, task: &Task) {
        match task.abort_set {
            AbortSet::Render => {
                self.abortable_tasks.remove(&task.id);
            }
            AbortSet::Fallback(b) => {
                self.boundaries[b.index()]
                    .fallback_abortable_tasks
                    .remove(&task.id);
            }
        }
    }

    /// Assigns the next wire id.
    pub(crate) fn next_wire(&mut self) -> u32 {
        let id = self.next_wire_id;
        self.next_wire_id += 1;
        id
    }

    // =========================================================================
    // Callback plumbing
    // =========================================================================

    /// Reports a recoverable error once and returns the opaque digest the
    /// wire may carry.
    pub(crate) fn report_error(&mut self, error: &RenderError) -> Option<String> {
        tracing::debug!(%error, "recoverable render error");
        match self.callbacks.on_error.as_mut() {
            Some(cb) => cb(error),
            None => None,
        }
    }

    pub(crate) fn report_postpone(&mut self, key_path: &KeyPath) {
        tracing::debug!(?key_path, "tracked postpone");
        if let Some(cb) = self.callbacks.on_postpone.as_mut() {
            cb(key_path);
        }
    }

    pub(crate) fn fire_shell_ready(&mut self) {
        // The shell can no longer fail; drop the shell error hook.
        self.callbacks.on_shell_error = None;
        if let Some(cb) = self.callbacks.on_shell_ready.take() {
            cb();
        }
    }

    pub(crate) fn fire_all_ready(&mut self) {
        if let Some(cb) = self.callbacks.on_all_ready.take() {
            cb();
        }
    }

    pub(crate) fn fire_fatal(&mut self, error: &RenderError) {
        if let Some(cb) = self.callbacks.on_shell_error.take() {
            cb(error);
        }
        if let Some(cb) = self.callbacks.on_fatal_error.take() {
            cb(error);
        }
    }

    /// Attaches a destination; subsequent work passes flush into it.
    pub(crate) fn attach_sink(&mut self, sink: ChunkSink) {
        self.sink = Some(sink);
    }
}
