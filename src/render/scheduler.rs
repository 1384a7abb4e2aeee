//! The cooperative scheduler: the task walk, suspension guards, boundary
//! bookkeeping, and abort machinery.
//!
//! One task executes at a time. A render step never unwinds for control
//! flow; it returns a [`RenderSignal`] that the nearest guard interprets:
//! suspensions spawn continuation tasks carrying captured snapshots,
//! deferrals are recorded into the resume ledger, recoverable errors travel
//! up to the nearest boundary, and fatal errors end the request. Document
//! order is *not* restored here — completion order is arbitrary once tasks
//! suspend — it is restored by the segment tree during flushing.

use crate::error::{ErrorKind, RenderError};
use crate::format::wire;
use crate::render::boundary::BoundaryStatus;
use crate::render::replay::{
    track_postpone, untrack_boundary, ReplayFrame, ReplayFrameRef, ResumeNode, ResumeSlot,
};
use crate::render::request::{Request, RequestStatus, MAX_SYNC_REATTEMPTS};
use crate::render::segment::SegmentStatus;
use crate::render::task::{AbortSet, Task};
use crate::tree::node::{Component, Element, NodeKind, Suspense, SUSPENSE_FALLBACK_NAME, SUSPENSE_NAME};
use crate::tree::{Awaitable, ComponentOutput, ComponentScope, Node};
use crate::types::{BoundaryId, KeyOrIndex, KeyPath, SegmentId, TaskId};
use bytes::Bytes;

/// Outcome of one render step, consumed by the nearest guard.
pub(crate) enum RenderSignal {
    /// Pause this subtree until the awaitable settles.
    Suspend(Awaitable),
    /// Deliberately defer this subtree; `key_path` is where the deferral
    /// was signalled (used for task-level deferrals).
    Postpone {
        key_path: KeyPath,
    },
    /// Recoverable failure; absorbed by the nearest boundary.
    Error(RenderError),
    /// Unrecoverable failure; ends the request.
    Fatal(RenderError),
}

type Step = Result<(), RenderSignal>;

fn key_or_index(key: Option<&str>, child_index: i32) -> KeyOrIndex {
    match key {
        Some(k) => KeyOrIndex::Key(k.to_owned()),
        None => KeyOrIndex::Index(child_index.max(0) as u32),
    }
}

// =============================================================================
// Work loop
// =============================================================================

/// Drains the ready queue, running each task to a terminal state, then
/// flushes if a destination is attached.
pub(crate) fn perform_work(req: &mut Request) {
    if req.status.is_terminal() {
        return;
    }
    loop {
        let next = req.pinged.borrow_mut().pop_front();
        let Some(task_id) = next else { break };
        retry_task(req, task_id);
        if req.status == RequestStatus::Fatal {
            break;
        }
    }
    if req.sink.is_some() {
        crate::render::flush::flush_completed_queues(req);
    }
}

fn retry_task(req: &mut Request, task_id: TaskId) {
    let Some(task) = req.take_task(task_id) else {
        // Already finished or aborted while queued.
        return;
    };
    tracing::trace!(task = %task_id, replay = task.replay.is_some(), "running task");
    if task.replay.is_some() {
        retry_replay_task(req, task);
    } else {
        retry_render_task(req, task);
    }
}

fn retry_render_task(req: &mut Request, mut task: Task) {
    let Some(seg_id) = task.segment else {
        fatal_error(req, RenderError::internal("render task without a segment"));
        return;
    };
    if req.segments[seg_id.index()].status != SegmentStatus::Pending {
        // Aborted while sitting in the queue.
        return;
    }
    let Some(node) = task.node.take() else { return };

    let snap_key = task.key_path.clone();
    let snap_tree = task.tree_context.clone();
    let snap_fmt = task.format_context;
    let snap_ctx = task.context.clone();
    let snap_index = task.child_index;
    let chunks_len = req.segments[seg_id.index()].chunks.len();
    let children_len = req.segments[seg_id.index()].children.len();

    loop {
        task.key_path = snap_key.clone();
        task.tree_context = snap_tree.clone();
        task.format_context = snap_fmt;
        task.context = snap_ctx.clone();
        task.child_index = snap_index;

        match render_node(req, &mut task, &node) {
            Ok(()) => {
                complete_segment(req, seg_id);
                let boundary = task.boundary;
                req.deregister_abortable(&task);
                finished_task(req, boundary, Some(seg_id));
                return;
            }
            Err(RenderSignal::Suspend(awaitable)) => {
                {
                    let seg = &mut req.segments[seg_id.index()];
                    seg.chunks.truncate(chunks_len);
                    seg.children.truncate(children_len);
                }
                if awaitable.is_settled() {
                    // A settled awaitable that still suspends means the
                    // render step keeps retriggering itself synchronously.
                    task.sync_reattempts += 1;
                    if task.sync_reattempts > MAX_SYNC_REATTEMPTS {
                        req.deregister_abortable(&task);
                        fatal_error(
                            req,
                            RenderError::new(ErrorKind::TooManyRerenders).with_message(
                                "too many synchronous re-renders of one task",
                            ),
                        );
                        return;
                    }
                    continue;
                }
                task.node = Some(node);
                let id = task.id;
                awaitable.register_ping(req.pinged.clone(), id);
                req.park_task(task);
                return;
            }
            Err(RenderSignal::Postpone { key_path }) => {
                let boundary = task.boundary;
                match (req.tracked.is_some(), boundary) {
                    (true, Some(b)) => {
                        track_postpone(req, &key_path, -1, b, seg_id);
                        req.report_postpone(&key_path);
                        req.deregister_abortable(&task);
                        finished_task(req, boundary, Some(seg_id));
                    }
                    (true, None) => {
                        req.deregister_abortable(&task);
                        fatal_error(
                            req,
                            RenderError::new(ErrorKind::PostponeAtRoot).with_message(
                                "cannot postpone the document root; only boundary content can be deferred",
                            ),
                        );
                    }
                    (false, _) => {
                        req.segments[seg_id.index()].status = SegmentStatus::Aborted;
                        req.deregister_abortable(&task);
                        errored_task(
                            req,
                            boundary,
                            RenderError::new(ErrorKind::PostponeOutsideResume).with_message(
                                "deferral signalled outside a resumable render",
                            ),
                        );
                    }
                }
                return;
            }
            Err(RenderSignal::Error(error)) => {
                req.segments[seg_id.index()].status = SegmentStatus::Aborted;
                let boundary = task.boundary;
                req.deregister_abortable(&task);
                errored_task(req, boundary, error);
                return;
            }
            Err(RenderSignal::Fatal(error)) => {
                req.deregister_abortable(&task);
                fatal_error(req, error);
                return;
            }
        }
    }
}

// =============================================================================
// Completion bookkeeping
// =============================================================================

fn complete_segment(req: &mut Request, seg_id: SegmentId) {
    let seg = &mut req.segments[seg_id.index()];
    if seg.text_embedded && seg.last_pushed_text {
        seg.chunks.push(Bytes::from_static(wire::TEXT_SEPARATOR));
    }
    seg.status = SegmentStatus::Completed;
}

/// Queues a completed segment for out-of-band flushing, collapsing trivial
/// single-child wrappers so flushing skips an indirection. The merge moves
/// the parent's identity onto the child; output is unchanged.
pub(crate) fn queue_completed_segment(req: &mut Request, b: BoundaryId, seg_id: SegmentId) {
    let merge_child = {
        let seg = &req.segments[seg_id.index()];
        if seg.chunks.is_empty() && seg.children.len() == 1 {
            let child_id = seg.children[0];
            let child = &req.segments[child_id.index()];
            if child.boundary.is_none() && child.wire_id.is_none() {
                Some(child_id)
            } else {
                None
            }
        } else {
            None
        }
    };
    match merge_child {
        Some(child_id) => {
            let parent_wire = req.segments[seg_id.index()].wire_id;
            let child = &mut req.segments[child_id.index()];
            child.wire_id = parent_wire;
            child.parent_flushed = true;
            if child.status == SegmentStatus::Completed {
                queue_completed_segment(req, b, child_id);
            }
        }
        None => {
            req.boundaries[b.index()]
                .completed_segments
                .push(seg_id);
        }
    }
}

fn finished_task(req: &mut Request, boundary: Option<BoundaryId>, segment: Option<SegmentId>) {
    match boundary {
        None => {
            if let Some(seg) = segment {
                let s = &req.segments[seg.index()];
                if s.parent_flushed && s.status == SegmentStatus::Completed {
                    if req.completed_root_segment.is_some() {
                        fatal_error(
                            req,
                            RenderError::internal("there can only be one root segment"),
                        );
                        return;
                    }
                    req.completed_root_segment = Some(seg);
                }
            }
            req.pending_root_tasks -= 1;
            if req.pending_root_tasks == 0 {
                tracing::debug!("shell complete");
                req.fire_shell_ready();
            }
        }
        Some(b) => {
            req.boundaries[b.index()].pending_tasks -= 1;
            let status = req.boundaries[b.index()].status;
            if status == BoundaryStatus::ClientRendered {
                // Discarded content; nothing to queue.
            } else if req.boundaries[b.index()].pending_tasks == 0 {
                if status == BoundaryStatus::Pending {
                    req.boundaries[b.index()].status = BoundaryStatus::Completed;
                }
                if let Some(seg) = segment {
                    let s = &req.segments[seg.index()];
                    if s.parent_flushed && s.status == SegmentStatus::Completed {
                        queue_completed_segment(req, b, seg);
                    }
                }
                if req.boundaries[b.index()].status == BoundaryStatus::Completed {
                    if req.boundaries[b.index()].parent_flushed {
                        req.completed_boundaries.push(b);
                    }
                    soft_abort_fallback_tasks(req, b);
                }
            } else if let Some(seg) = segment {
                let s = &req.segments[seg.index()];
                if s.parent_flushed && s.status == SegmentStatus::Completed {
                    queue_completed_segment(req, b, seg);
                    let bb = &req.boundaries[b.index()];
                    if bb.completed_segments.len() == 1 && bb.parent_flushed {
                        req.partial_boundaries.push(b);
                    }
                }
            }
        }
    }
    req.all_pending_tasks -= 1;
    if req.all_pending_tasks == 0 {
        complete_all(req);
    }
}

fn complete_all(req: &mut Request) {
    tracing::debug!("all pending work settled");
    req.fire_all_ready();
}

fn errored_task(req: &mut Request, boundary: Option<BoundaryId>, error: RenderError) {
    let digest = req.report_error(&error);
    match boundary {
        None => {
            // No boundary above the failure: the shell itself is lost.
            fatal_error(req, error);
            return;
        }
        Some(b) => {
            req.boundaries[b.index()].pending_tasks -= 1;
            if req.boundaries[b.index()].status != BoundaryStatus::ClientRendered {
                req.boundaries[b.index()].status = BoundaryStatus::ClientRendered;
                req.boundaries[b.index()].error_digest = digest;
                untrack_boundary(req, b);
                if req.boundaries[b.index()].parent_flushed {
                    req.client_rendered_boundaries.push(b);
                }
            }
        }
    }
    req.all_pending_tasks -= 1;
    if req.all_pending_tasks == 0 {
        complete_all(req);
    }
}

pub(crate) fn fatal_error(req: &mut Request, error: RenderError) {
    if req.status.is_terminal() {
        return;
    }
    tracing::error!(%error, "fatal render error");
    req.status = RequestStatus::Fatal;
    req.fire_fatal(&error);
    if let Some(sink) = req.sink.as_mut() {
        sink.error(&error);
    }
    req.sink = None;
    req.fatal = Some(error);
}

fn soft_abort_fallback_tasks(req: &mut Request, b: BoundaryId) {
    let tasks: Vec<TaskId> = req.boundaries[b.index()]
        .fallback_abortable_tasks
        .drain()
        .collect();
    for task_id in tasks {
        let Some(task) = req.take_task(task_id) else {
            continue;
        };
        tracing::trace!(task = %task_id, "soft-aborting fallback task");
        if let Some(seg) = task.segment {
            req.segments[seg.index()].status = SegmentStatus::Aborted;
        }
        finished_task(req, task.boundary, task.segment);
    }
}

// =============================================================================
// Abort
// =============================================================================

/// Fails every live task with a uniform abort error. Idempotent: a second
/// call finds no abortable tasks and does nothing.
pub(crate) fn abort_request(req: &mut Request, reason: Option<&str>) {
    if req.status.is_terminal() {
        return;
    }
    let error = RenderError::aborted(
        reason.unwrap_or("the render was aborted without a reason"),
    );
    req.status = RequestStatus::Aborting;
    let tasks: Vec<TaskId> = req.abortable_tasks.drain().collect();
    tracing::debug!(count = tasks.len(), "aborting live tasks");
    for task_id in tasks {
        abort_task(req, task_id, &error);
        if req.status == RequestStatus::Fatal {
            return;
        }
    }
    if req.status == RequestStatus::Aborting {
        req.status = RequestStatus::Open;
    }
    if req.sink.is_some() {
        crate::render::flush::flush_completed_queues(req);
    }
}

fn abort_task(req: &mut Request, task_id: TaskId, error: &RenderError) {
    let Some(task) = req.take_task(task_id) else {
        // Already terminal; aborts are idempotent.
        return;
    };
    if let Some(seg) = task.segment {
        req.segments[seg.index()].status = SegmentStatus::Aborted;
    }
    match task.boundary {
        None => {
            // The shell cannot survive an abort of a root task.
            fatal_error(req, error.clone());
            req.all_pending_tasks = req.all_pending_tasks.saturating_sub(1);
        }
        Some(b) => {
            if req.boundaries[b.index()].status != BoundaryStatus::ClientRendered {
                req.boundaries[b.index()].status = BoundaryStatus::ClientRendered;
                let digest = req.report_error(error);
                req.boundaries[b.index()].error_digest = digest;
                untrack_boundary(req, b);
                if req.boundaries[b.index()].parent_flushed {
                    req.client_rendered_boundaries.push(b);
                }
                let fallback: Vec<TaskId> = req.boundaries[b.index()]
                    .fallback_abortable_tasks
                    .drain()
                    .collect();
                for f in fallback {
                    abort_task(req, f, error);
                }
            }
            req.boundaries[b.index()].pending_tasks =
                req.boundaries[b.index()].pending_tasks.saturating_sub(1);
            req.all_pending_tasks = req.all_pending_tasks.saturating_sub(1);
            if req.all_pending_tasks == 0 {
                complete_all(req);
            }
        }
    }
}

// =============================================================================
// Output helpers
// =============================================================================

fn account_boundary_bytes(req: &mut Request, task: &Task, added: usize) {
    if added == 0 {
        return;
    }
    if let Some(b) = task.boundary {
        req.boundaries[b.index()].byte_size += added;
    }
}

fn chunk_bytes_added(chunks: &[Bytes], from: usize) -> usize {
    chunks[from..].iter().map(Bytes::len).sum()
}

fn push_text_node(req: &mut Request, task: &mut Task, text: &str) -> Step {
    if text.is_empty() {
        return Ok(());
    }
    let Some(seg_id) = task.segment else {
        return Ok(());
    };
    let added = {
        let seg = &mut req.segments[seg_id.index()];
        let from = seg.chunks.len();
        if seg.last_pushed_text {
            seg.chunks.push(Bytes::from_static(wire::TEXT_SEPARATOR));
        }
        req.writer.push_text(&mut seg.chunks, text);
        seg.last_pushed_text = true;
        chunk_bytes_added(&seg.chunks, from)
    };
    account_boundary_bytes(req, task, added);
    Ok(())
}

/// Creates a child segment at the parent segment's current write position.
fn create_child_segment(req: &mut Request, task: &Task) -> Option<SegmentId> {
    let parent = task.segment?;
    let splice_index = req.segments[parent.index()].chunks.len();
    let text_embedded = req.segments[parent.index()].last_pushed_text;
    let child = req.create_segment(splice_index, None, task.format_context, text_embedded);
    req.segments[parent.index()].children.push(child);
    req.segments[parent.index()].last_pushed_text = false;
    Some(child)
}

// =============================================================================
// The render walk
// =============================================================================

fn render_node(req: &mut Request, task: &mut Task, node: &Node) -> Step {
    if task.replay.is_some() {
        return replay_node(req, task, node);
    }
    match node.kind() {
        NodeKind::Text(text) => push_text_node(req, task, text),
        NodeKind::Element(el) => render_element(req, task, el),
        NodeKind::Fragment { children, .. } => render_child_array(req, task, children),
        NodeKind::Component(component) => render_component(req, task, component),
        NodeKind::Async(awaitable) => render_async(req, task, awaitable),
        NodeKind::Suspense(suspense) => render_suspense(req, task, suspense),
        NodeKind::ContextProvider {
            name,
            value,
            children,
        } => {
            task.context = task.context.with(name, value);
            render_child_array(req, task, children)
        }
    }
}

fn render_element(req: &mut Request, task: &mut Task, el: &Element) -> Step {
    task.key_path = task
        .key_path
        .child(Some(&el.tag), key_or_index(el.key.as_deref(), task.child_index));
    task.child_index = -1;

    let Some(seg_id) = task.segment else {
        return Err(RenderSignal::Fatal(RenderError::internal(
            "element render without an output segment",
        )));
    };
    let added = {
        let seg = &mut req.segments[seg_id.index()];
        let from = seg.chunks.len();
        req.writer
            .push_element_start(&mut seg.chunks, &el.tag, &el.attrs)
            .map_err(RenderSignal::Error)?;
        seg.last_pushed_text = false;
        chunk_bytes_added(&seg.chunks, from)
    };
    account_boundary_bytes(req, task, added);

    let prev_fmt = task.format_context;
    task.format_context = prev_fmt.for_child(&el.tag);
    render_child_array(req, task, &el.children)?;
    task.format_context = prev_fmt;

    let added = {
        let seg = &mut req.segments[seg_id.index()];
        let from = seg.chunks.len();
        req.writer
            .push_element_end(&mut seg.chunks, &el.tag)
            .map_err(RenderSignal::Error)?;
        seg.last_pushed_text = false;
        chunk_bytes_added(&seg.chunks, from)
    };
    account_boundary_bytes(req, task, added);
    Ok(())
}

fn render_component(req: &mut Request, task: &mut Task, component: &Component) -> Step {
    task.key_path = task.key_path.child(
        Some(&component.name),
        key_or_index(component.key.as_deref(), task.child_index),
    );
    task.child_index = -1;
    let output = {
        let scope = ComponentScope {
            context: &task.context,
            id: task.tree_context.to_id(&req.identifier_prefix),
        };
        (component.render)(&scope)
    };
    match output {
        ComponentOutput::Ready(child) => render_node(req, task, &child),
        ComponentOutput::Suspend(awaitable) => Err(RenderSignal::Suspend(awaitable)),
        ComponentOutput::Postpone => Err(RenderSignal::Postpone {
            key_path: task.key_path.clone(),
        }),
        ComponentOutput::Failed(error) => Err(RenderSignal::Error(error)),
    }
}

fn render_async(req: &mut Request, task: &mut Task, awaitable: &Awaitable) -> Step {
    match awaitable.peek() {
        Some(Ok(node)) => render_node(req, task, &node),
        Some(Err(error)) => Err(RenderSignal::Error(error)),
        None => Err(RenderSignal::Suspend(awaitable.clone())),
    }
}

fn render_child_array(req: &mut Request, task: &mut Task, children: &[Node]) -> Step {
    let parent_key = task.key_path.clone();
    let parent_tree = task.tree_context.clone();
    let parent_index = task.child_index;
    for (i, child) in children.iter().enumerate() {
        task.tree_context = parent_tree.push(i as u32);
        render_child(req, task, child, &parent_key, i)?;
    }
    task.key_path = parent_key;
    task.tree_context = parent_tree;
    task.child_index = parent_index;
    Ok(())
}

/// The suspension guard around one child subtree.
///
/// Captures snapshots before descending; on suspension it truncates the
/// partial output, restores the snapshots, and spawns a continuation task
/// that re-renders this child once the awaitable settles. Siblings keep
/// rendering either way.
fn render_child(
    req: &mut Request,
    task: &mut Task,
    node: &Node,
    parent_key: &KeyPath,
    index: usize,
) -> Step {
    let snap_ctx = task.context.clone();
    let snap_fmt = task.format_context;
    let snap_tree = task.tree_context.clone();
    task.key_path = parent_key.clone();
    task.child_index = index as i32;

    let segment_snapshot = task.segment.map(|s| {
        let seg = &req.segments[s.index()];
        (seg.chunks.len(), seg.children.len(), seg.last_pushed_text)
    });

    match render_node(req, task, node) {
        Ok(()) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            task.child_index = index as i32;
            Ok(())
        }
        Err(RenderSignal::Suspend(awaitable)) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            task.child_index = index as i32;
            if let (Some(s), Some((chunks, children, last_text))) = (task.segment, segment_snapshot)
            {
                let seg = &mut req.segments[s.index()];
                seg.chunks.truncate(chunks);
                seg.children.truncate(children);
                seg.last_pushed_text = last_text;
            }
            spawn_suspended_render_task(req, task, node.clone(), awaitable, index as i32);
            Ok(())
        }
        Err(RenderSignal::Postpone { .. }) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            task.child_index = index as i32;
            if let (Some(s), Some((chunks, children, last_text))) = (task.segment, segment_snapshot)
            {
                let seg = &mut req.segments[s.index()];
                seg.chunks.truncate(chunks);
                seg.children.truncate(children);
                seg.last_pushed_text = last_text;
            }
            if req.tracked.is_some() {
                match task.boundary {
                    Some(b) => {
                        if let Some(seg_id) = create_child_segment(req, task) {
                            track_postpone(req, parent_key, index as i32, b, seg_id);
                            req.report_postpone(parent_key);
                        }
                        Ok(())
                    }
                    None => Err(RenderSignal::Fatal(
                        RenderError::new(ErrorKind::PostponeAtRoot).with_message(
                            "cannot postpone the document root; only boundary content can be deferred",
                        ),
                    )),
                }
            } else {
                Err(RenderSignal::Error(
                    RenderError::new(ErrorKind::PostponeOutsideResume)
                        .with_message("deferral signalled outside a resumable render"),
                ))
            }
        }
        Err(other) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            task.child_index = index as i32;
            Err(other)
        }
    }
}

fn spawn_suspended_render_task(
    req: &mut Request,
    task: &Task,
    node: Node,
    awaitable: Awaitable,
    child_index: i32,
) {
    let Some(seg_id) = create_child_segment(req, task) else {
        return;
    };
    let task_id = req.create_task(
        Some(node),
        child_index,
        task.boundary,
        Some(seg_id),
        None,
        task.key_path.clone(),
        task.tree_context.clone(),
        task.format_context,
        task.context.clone(),
        task.abort_set,
    );
    tracing::trace!(task = %task_id, "subtree suspended; continuation created");
    awaitable.register_ping(req.pinged.clone(), task_id);
}

// =============================================================================
// Suspense boundaries
// =============================================================================

fn render_suspense(req: &mut Request, task: &mut Task, suspense: &Suspense) -> Step {
    let Some(parent_seg) = task.segment else {
        return Err(RenderSignal::Fatal(RenderError::internal(
            "suspense render without an output segment",
        )));
    };
    let content_key = task.key_path.child(
        Some(SUSPENSE_NAME),
        key_or_index(suspense.key.as_deref(), task.child_index),
    );
    let fallback_key = content_key.with_name(SUSPENSE_FALLBACK_NAME);
    let parent_boundary = task.boundary;

    let b = req.create_boundary(content_key.clone(), fallback_key.clone());
    // The parent-attached segment marks the boundary's position and will
    // hold the fallback output.
    let Some(boundary_seg) = create_child_segment(req, task) else {
        return Err(RenderSignal::Fatal(RenderError::internal(
            "suspense boundary without a parent segment",
        )));
    };
    req.segments[boundary_seg.index()].boundary = Some(b);
    // The content renders into a detached root segment owned by the
    // boundary's completion queue.
    let content_seg = req.create_segment(0, None, task.format_context, false);

    let prev_key = task.key_path.clone();
    let prev_index = task.child_index;
    task.boundary = Some(b);
    task.segment = Some(content_seg);
    task.key_path = content_key.clone();
    task.child_index = -1;

    let attempt = render_child_array(req, task, &suspense.children);

    task.boundary = parent_boundary;
    task.segment = Some(parent_seg);
    task.key_path = prev_key;
    task.child_index = prev_index;

    match attempt {
        Ok(()) => {
            complete_segment(req, content_seg);
            queue_completed_segment(req, b, content_seg);
            let bb = &mut req.boundaries[b.index()];
            if bb.pending_tasks == 0 && bb.status == BoundaryStatus::Pending {
                // Content finished in place; the fallback is never needed.
                bb.status = BoundaryStatus::Completed;
                return Ok(());
            }
        }
        Err(RenderSignal::Fatal(error)) => return Err(RenderSignal::Fatal(error)),
        Err(RenderSignal::Suspend(awaitable)) => {
            // Children are individually guarded, so a suspension escaping
            // to here means the whole content must be retried as a task.
            let task_id = req.create_task(
                Some(Node::fragment(suspense.children.clone())),
                -1,
                Some(b),
                Some(content_seg),
                None,
                content_key.clone(),
                task.tree_context.clone(),
                task.format_context,
                task.context.clone(),
                AbortSet::Render,
            );
            awaitable.register_ping(req.pinged.clone(), task_id);
        }
        Err(RenderSignal::Postpone { .. }) => {
            if req.tracked.is_some() {
                track_postpone(req, &content_key, -1, b, content_seg);
                req.report_postpone(&content_key);
            } else {
                req.segments[content_seg.index()].status = SegmentStatus::Aborted;
                let error = RenderError::new(ErrorKind::PostponeOutsideResume)
                    .with_message("deferral signalled outside a resumable render");
                let digest = req.report_error(&error);
                req.boundaries[b.index()].status = BoundaryStatus::ClientRendered;
                req.boundaries[b.index()].error_digest = digest;
            }
        }
        Err(RenderSignal::Error(error)) => {
            // Absorbed: this boundary falls back to client rendering and
            // the rest of the document is unaffected.
            req.segments[content_seg.index()].status = SegmentStatus::Aborted;
            let digest = req.report_error(&error);
            req.boundaries[b.index()].status = BoundaryStatus::ClientRendered;
            req.boundaries[b.index()].error_digest = digest;
            untrack_boundary(req, b);
        }
    }

    // Fallback renders as its own deferred task so content work (which is
    // likely to resolve soon) is not blocked behind it.
    let fallback_task = req.create_task(
        Some(Node::fragment(suspense.fallback.clone())),
        -1,
        parent_boundary,
        Some(boundary_seg),
        None,
        fallback_key,
        task.tree_context.clone(),
        task.format_context,
        task.context.clone(),
        AbortSet::Fallback(b),
    );
    req.schedule(fallback_task);
    Ok(())
}

// =============================================================================
// Replay (resume side)
// =============================================================================

fn retry_replay_task(req: &mut Request, mut task: Task) {
    let Some(node) = task.node.take() else { return };

    let snap_key = task.key_path.clone();
    let snap_tree = task.tree_context.clone();
    let snap_fmt = task.format_context;
    let snap_ctx = task.context.clone();
    let snap_index = task.child_index;

    loop {
        task.key_path = snap_key.clone();
        task.tree_context = snap_tree.clone();
        task.format_context = snap_fmt;
        task.context = snap_ctx.clone();
        task.child_index = snap_index;

        match replay_node(req, &mut task, &node) {
            Ok(()) => {
                req.deregister_abortable(&task);
                let boundary = task.boundary;
                if let Some(frame) = task.replay.clone() {
                    if let Err(error) = finish_replay_frame(req, &frame) {
                        errored_task(req, boundary, error);
                        return;
                    }
                }
                finished_task(req, boundary, None);
                return;
            }
            Err(RenderSignal::Suspend(awaitable)) => {
                if awaitable.is_settled() {
                    task.sync_reattempts += 1;
                    if task.sync_reattempts > MAX_SYNC_REATTEMPTS {
                        req.deregister_abortable(&task);
                        fatal_error(
                            req,
                            RenderError::new(ErrorKind::TooManyRerenders).with_message(
                                "too many synchronous re-renders of one replay task",
                            ),
                        );
                        return;
                    }
                    continue;
                }
                task.node = Some(node);
                let id = task.id;
                awaitable.register_ping(req.pinged.clone(), id);
                req.park_task(task);
                return;
            }
            Err(RenderSignal::Postpone { .. }) => {
                req.deregister_abortable(&task);
                let boundary = task.boundary;
                if let Some(frame) = task.replay.clone() {
                    release_replay_frame(&frame);
                }
                errored_task(
                    req,
                    boundary,
                    RenderError::new(ErrorKind::PostponeOutsideResume)
                        .with_message("deferral signalled while resuming"),
                );
                return;
            }
            Err(RenderSignal::Error(error)) => {
                req.deregister_abortable(&task);
                let boundary = task.boundary;
                if let Some(frame) = task.replay.clone() {
                    release_replay_frame(&frame);
                }
                errored_task(req, boundary, error);
                return;
            }
            Err(RenderSignal::Fatal(error)) => {
                req.deregister_abortable(&task);
                fatal_error(req, error);
                return;
            }
        }
    }
}

/// Walks one node in replay mode: no output, just structural matching
/// against the recorded ledger until a resumable slot is reached.
fn replay_node(req: &mut Request, task: &mut Task, node: &Node) -> Step {
    // The task's own node is walked as a one-element child list so that
    // matching is uniform with the recorded sibling indices.
    if task.child_index < 0 {
        return replay_child_array(req, task, std::slice::from_ref(node));
    }
    replay_dispatch(req, task, node)
}

fn replay_child_array(req: &mut Request, task: &mut Task, children: &[Node]) -> Step {
    let parent_key = task.key_path.clone();
    let parent_tree = task.tree_context.clone();
    let parent_index = task.child_index;
    for (i, child) in children.iter().enumerate() {
        task.tree_context = parent_tree.push(i as u32);
        replay_child(req, task, child, &parent_key, i)?;
    }
    task.key_path = parent_key;
    task.tree_context = parent_tree;
    task.child_index = parent_index;
    Ok(())
}

/// The replay-side suspension guard: a suspended child keeps a hold on the
/// current ledger frame and retries later.
fn replay_child(
    req: &mut Request,
    task: &mut Task,
    node: &Node,
    parent_key: &KeyPath,
    index: usize,
) -> Step {
    let snap_ctx = task.context.clone();
    let snap_fmt = task.format_context;
    let snap_tree = task.tree_context.clone();
    task.key_path = parent_key.clone();
    task.child_index = index as i32;

    match replay_dispatch(req, task, node) {
        Ok(()) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            Ok(())
        }
        Err(RenderSignal::Suspend(awaitable)) => {
            task.context = snap_ctx.clone();
            task.format_context = snap_fmt;
            task.tree_context = snap_tree.clone();
            task.key_path = parent_key.clone();
            let Some(frame) = task.replay.clone() else {
                return Err(RenderSignal::Fatal(RenderError::internal(
                    "replay guard without a ledger frame",
                )));
            };
            frame.borrow_mut().pending += 1;
            let task_id = req.create_task(
                Some(node.clone()),
                index as i32,
                task.boundary,
                None,
                Some(frame),
                parent_key.clone(),
                snap_tree,
                snap_fmt,
                snap_ctx,
                AbortSet::Render,
            );
            awaitable.register_ping(req.pinged.clone(), task_id);
            Ok(())
        }
        Err(other) => {
            task.context = snap_ctx;
            task.format_context = snap_fmt;
            task.tree_context = snap_tree;
            task.key_path = parent_key.clone();
            Err(other)
        }
    }
}

fn take_matching_node(
    frame: &ReplayFrameRef,
    name: Option<&str>,
    key: &KeyOrIndex,
) -> Option<ResumeNode> {
    let mut f = frame.borrow_mut();
    let pos = f.nodes.iter().position(|rn| rn.matches(name, key))?;
    Some(f.nodes.remove(pos))
}

fn replay_dispatch(req: &mut Request, task: &mut Task, node: &Node) -> Step {
    let Some(frame) = task.replay.clone() else {
        return Err(RenderSignal::Fatal(RenderError::internal(
            "replay dispatch without a ledger frame",
        )));
    };

    // A recorded child-index slot takes precedence: this exact position
    // was deferred and now renders for real.
    if task.child_index >= 0 {
        let slot = frame.borrow_mut().slots.remove(&(task.child_index as u32));
        if let Some(wire_id) = slot {
            return resume_node(req, task, node, wire_id);
        }
    }

    match node.kind() {
        NodeKind::Text(_) => Ok(()),
        NodeKind::Async(awaitable) => match awaitable.peek() {
            Some(Ok(inner)) => replay_dispatch(req, task, &inner),
            Some(Err(error)) => Err(RenderSignal::Error(error)),
            None => Err(RenderSignal::Suspend(awaitable.clone())),
        },
        // Fragments and providers are transparent in key paths, so their
        // children match against the current frame with local indices.
        NodeKind::Fragment { children, .. } => replay_child_array(req, task, children),
        NodeKind::ContextProvider {
            name,
            value,
            children,
        } => {
            task.context = task.context.with(name, value);
            replay_child_array(req, task, children)
        }
        NodeKind::Element(el) => {
            let key = key_or_index(el.key.as_deref(), task.child_index);
            let Some(rn) = take_matching_node(&frame, node.name(), &key) else {
                return Ok(());
            };
            if rn.children.is_empty() {
                if let ResumeSlot::Id(wire_id) = &rn.slot {
                    return resume_node(req, task, node, *wire_id);
                }
            }
            task.key_path = task.key_path.child(Some(&el.tag), key);
            task.child_index = -1;
            let prev_fmt = task.format_context;
            task.format_context = prev_fmt.for_child(&el.tag);
            let result = replay_matched_children(req, task, &el.children, rn);
            task.format_context = prev_fmt;
            result
        }
        NodeKind::Component(component) => {
            let key = key_or_index(component.key.as_deref(), task.child_index);
            let has_match = frame
                .borrow()
                .nodes
                .iter()
                .any(|rn| rn.matches(node.name(), &key));
            if !has_match {
                return Ok(());
            }
            task.key_path = task.key_path.child(Some(&component.name), key.clone());
            task.child_index = -1;
            let output = {
                let scope = ComponentScope {
                    context: &task.context,
                    id: task.tree_context.to_id(&req.identifier_prefix),
                };
                (component.render)(&scope)
            };
            match output {
                ComponentOutput::Ready(child) => {
                    let Some(rn) = take_matching_node(&frame, node.name(), &key) else {
                        return Ok(());
                    };
                    if rn.children.is_empty() {
                        if let ResumeSlot::Id(wire_id) = &rn.slot {
                            // The whole component postponed; render its
                            // now-available output into the recorded slot.
                            return resume_node(req, task, &child, *wire_id);
                        }
                    }
                    replay_matched_children(req, task, std::slice::from_ref(&child), rn)
                }
                ComponentOutput::Suspend(awaitable) => Err(RenderSignal::Suspend(awaitable)),
                ComponentOutput::Postpone => Err(RenderSignal::Postpone {
                    key_path: task.key_path.clone(),
                }),
                ComponentOutput::Failed(error) => Err(RenderSignal::Error(error)),
            }
        }
        NodeKind::Suspense(suspense) => {
            let key = key_or_index(suspense.key.as_deref(), task.child_index);
            let Some(rn) = take_matching_node(&frame, node.name(), &key) else {
                return Ok(());
            };
            let boundary_wire_id = match &rn.slot {
                ResumeSlot::Id(id) => Some(*id),
                ResumeSlot::None | ResumeSlot::Children(_) => None,
            };
            match boundary_wire_id {
                Some(id) if rn.children.is_empty() => {
                    resume_boundary_full(req, task, suspense, key, id)
                }
                Some(id) => resume_boundary_partial(req, task, suspense, key, id, rn),
                None => {
                    // A chain node through a boundary that settled in the
                    // first pass: only its content subtree continues.
                    task.key_path = task.key_path.child(Some(SUSPENSE_NAME), key);
                    task.child_index = -1;
                    replay_matched_children(req, task, &suspense.children, rn)
                }
            }
        }
    }
}

/// Descends into a matched ledger node with a fresh frame; the last task
/// holding the frame verifies it was fully consumed.
fn replay_matched_children(
    req: &mut Request,
    task: &mut Task,
    children: &[Node],
    rn: ResumeNode,
) -> Step {
    let frame = ReplayFrame::for_node(&rn);
    let prev = task.replay.replace(frame.clone());
    let result = replay_child_array(req, task, children);
    task.replay = prev;
    match result {
        Ok(()) => finish_replay_frame(req, &frame).map_err(RenderSignal::Error),
        Err(signal) => {
            release_replay_frame(&frame);
            Err(signal)
        }
    }
}

fn release_replay_frame(frame: &ReplayFrameRef) {
    let mut f = frame.borrow_mut();
    f.pending = f.pending.saturating_sub(1);
}

/// Releases one hold on a ledger frame; the last holder checks that every
/// recorded node and slot was consumed. Leftover boundary records are
/// downgraded to client-rendered fallbacks; leftover slots are a
/// structural mismatch.
fn finish_replay_frame(
    req: &mut Request,
    frame: &ReplayFrameRef,
) -> Result<(), RenderError> {
    let (nodes, slots) = {
        let mut f = frame.borrow_mut();
        f.pending = f.pending.saturating_sub(1);
        if f.pending > 0 {
            return Ok(());
        }
        (std::mem::take(&mut f.nodes), std::mem::take(&mut f.slots))
    };
    if nodes.is_empty() && slots.is_empty() {
        return Ok(());
    }
    let mut unaddressable = slots.len();
    client_render_leftover_nodes(req, &nodes, &mut unaddressable);
    if unaddressable > 0 {
        Err(RenderError::replay_mismatch(
            "couldn't find all resumable slots by key or index while replaying; the tree does not match the recorded ledger",
        ))
    } else {
        Ok(())
    }
}

fn client_render_leftover_nodes(
    req: &mut Request,
    nodes: &[ResumeNode],
    unaddressable: &mut usize,
) {
    for rn in nodes {
        let is_boundary = rn.name.as_deref() == Some(SUSPENSE_NAME);
        match (&rn.slot, is_boundary) {
            (ResumeSlot::Id(wire_id), true) => {
                synthesize_client_rendered_boundary(req, *wire_id);
            }
            (ResumeSlot::Id(_), false) => {
                *unaddressable += 1;
            }
            (ResumeSlot::Children(map), _) => {
                *unaddressable += map.len();
                client_render_leftover_nodes(req, &rn.children, unaddressable);
            }
            (ResumeSlot::None, _) => {
                client_render_leftover_nodes(req, &rn.children, unaddressable);
            }
        }
    }
}

/// A recorded boundary the resumed tree no longer contains: its anchor is
/// already in the delivered document, so tell the client to take it over.
fn synthesize_client_rendered_boundary(req: &mut Request, wire_id: u32) {
    let error = RenderError::replay_mismatch(
        "a recorded boundary has no match in the resumed tree",
    );
    let digest = req.report_error(&error);
    let b = req.create_boundary(KeyPath::root(), KeyPath::root());
    let bb = &mut req.boundaries[b.index()];
    bb.status = BoundaryStatus::ClientRendered;
    bb.wire_id = Some(wire_id);
    bb.parent_flushed = true;
    bb.error_digest = digest;
    req.client_rendered_boundaries.push(b);
}

/// Renders a deferred node for real into a segment with the recorded wire
/// id; its output flushes as an out-of-band patch into the placeholder the
/// first pass delivered.
fn resume_node(req: &mut Request, task: &mut Task, node: &Node, wire_id: u32) -> Step {
    let seg_id = req.create_segment(0, None, task.format_context, false);
    {
        let seg = &mut req.segments[seg_id.index()];
        seg.wire_id = Some(wire_id);
        seg.parent_flushed = true;
    }
    let prev_replay = task.replay.take();
    let prev_segment = task.segment;
    task.segment = Some(seg_id);
    let result = render_node(req, task, node);
    task.replay = prev_replay;
    task.segment = prev_segment;

    match result {
        Ok(()) => {
            complete_segment(req, seg_id);
            match task.boundary {
                None => {
                    if req.completed_root_segment.is_some() {
                        return Err(RenderSignal::Fatal(RenderError::internal(
                            "there can only be one root segment",
                        )));
                    }
                    req.completed_root_segment = Some(seg_id);
                }
                Some(b) => {
                    queue_completed_segment(req, b, seg_id);
                    let bb = &req.boundaries[b.index()];
                    if bb.parent_flushed && bb.completed_segments.len() == 1 {
                        req.partial_boundaries.push(b);
                    }
                }
            }
            Ok(())
        }
        Err(RenderSignal::Suspend(awaitable)) => {
            // Not settled yet: hand the slot to a continuation task bound
            // to the already-numbered segment.
            let task_id = req.create_task(
                Some(node.clone()),
                -1,
                task.boundary,
                Some(seg_id),
                None,
                task.key_path.clone(),
                task.tree_context.clone(),
                task.format_context,
                task.context.clone(),
                AbortSet::Render,
            );
            awaitable.register_ping(req.pinged.clone(), task_id);
            Ok(())
        }
        Err(signal) => {
            req.segments[seg_id.index()].status = SegmentStatus::Aborted;
            Err(signal)
        }
    }
}

fn resume_boundary_full(
    req: &mut Request,
    task: &mut Task,
    suspense: &Suspense,
    key: KeyOrIndex,
    boundary_wire_id: u32,
) -> Step {
    let content_key = task.key_path.child(Some(SUSPENSE_NAME), key);
    let fallback_key = content_key.with_name(SUSPENSE_FALLBACK_NAME);
    let b = req.create_boundary(content_key.clone(), fallback_key);
    {
        let bb = &mut req.boundaries[b.index()];
        bb.wire_id = Some(boundary_wire_id);
        bb.parent_flushed = true;
    }
    let seg_id = req.create_segment(0, None, task.format_context, false);
    {
        let seg = &mut req.segments[seg_id.index()];
        seg.wire_id = Some(boundary_wire_id);
        seg.parent_flushed = true;
    }
    let task_id = req.create_task(
        Some(Node::fragment(suspense.children.clone())),
        -1,
        Some(b),
        Some(seg_id),
        None,
        content_key,
        task.tree_context.clone(),
        task.format_context,
        task.context.clone(),
        AbortSet::Render,
    );
    req.schedule(task_id);
    tracing::trace!(boundary = %b, wire_id = boundary_wire_id, "resuming boundary content");
    Ok(())
}

fn resume_boundary_partial(
    req: &mut Request,
    task: &mut Task,
    suspense: &Suspense,
    key: KeyOrIndex,
    boundary_wire_id: u32,
    rn: ResumeNode,
) -> Step {
    let content_key = task.key_path.child(Some(SUSPENSE_NAME), key);
    let fallback_key = content_key.with_name(SUSPENSE_FALLBACK_NAME);
    let b = req.create_boundary(content_key.clone(), fallback_key);
    {
        let bb = &mut req.boundaries[b.index()];
        bb.wire_id = Some(boundary_wire_id);
        bb.parent_flushed = true;
    }
    let prev_boundary = task.boundary;
    task.boundary = Some(b);
    task.key_path = content_key;
    task.child_index = -1;
    let result = replay_matched_children(req, task, &suspense.children, rn);
    task.boundary = prev_boundary;

    match result {
        Ok(()) => {
            let bb = &req.boundaries[b.index()];
            if bb.pending_tasks == 0 && bb.status == BoundaryStatus::Pending {
                req.boundaries[b.index()].status = BoundaryStatus::Completed;
                req.completed_boundaries.push(b);
            }
            Ok(())
        }
        Err(RenderSignal::Error(error)) => {
            // Mismatch or failure inside the resumed content: this
            // boundary falls back to client rendering.
            let digest = req.report_error(&error);
            let bb = &mut req.boundaries[b.index()];
            if bb.status != BoundaryStatus::ClientRendered {
                bb.status = BoundaryStatus::ClientRendered;
                bb.error_digest = digest;
                req.client_rendered_boundaries.push(b);
            }
            Ok(())
        }
        Err(signal) => Err(signal),
    }
}
