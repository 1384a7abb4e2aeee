//! The flush protocol: emitting completed work in document-preserving
//! order.
//!
//! One pass flushes, in order: the shell (once the root has no pending
//! tasks), client-render instructions for failed boundaries, completed
//! boundaries with their patch instructions, and finally completed segments
//! of still-partial boundaries. Every queue stops at the sink's capacity
//! signal and resumes from the same index on the next pass, so nothing is
//! emitted twice. A completed boundary larger than the progressive chunk
//! size is demoted to the pending form so it cannot block what follows it.

use crate::format::wire;
use crate::render::boundary::BoundaryStatus;
use crate::render::request::{Request, RequestStatus};
use crate::render::scheduler::fatal_error;
use crate::render::segment::SegmentStatus;
use crate::error::RenderError;
use crate::sink::ChunkSink;
use crate::types::{BoundaryId, SegmentId};

/// Runs one flush pass against the attached sink.
pub(crate) fn flush_completed_queues(req: &mut Request) {
    let Some(mut sink) = req.sink.take() else {
        return;
    };
    if req.status == RequestStatus::Fatal {
        if let Some(error) = req.fatal.clone() {
            sink.error(&error);
        }
        return;
    }
    if req.status.is_terminal() {
        req.sink = Some(sink);
        return;
    }
    sink.begin_pass();
    let prefix = req.identifier_prefix.clone();

    // Nothing is delivered before the shell settles.
    if req.pending_root_tasks > 0 {
        sink.flush();
        req.sink = Some(sink);
        return;
    }

    if let Some(root) = req.completed_root_segment {
        if req.segments[root.index()].status == SegmentStatus::Postponed {
            // The whole document was deferred; deliver nothing until the
            // resume pass.
            req.sink = Some(sink);
            return;
        }
        for chunk in req.resources.take_queued_chunks() {
            sink.write_chunk(&chunk);
        }
        flush_segment(req, &mut sink, root, &prefix);
        req.completed_root_segment = None;
        tracing::debug!("shell flushed");
    } else {
        // Hints registered after the shell still go out in front of any
        // patch instructions.
        for chunk in req.resources.take_queued_chunks() {
            sink.write_chunk(&chunk);
        }
    }

    // Failed boundaries: tell the client to take them over.
    let mut queue = std::mem::take(&mut req.client_rendered_boundaries);
    let mut flushed = 0;
    for (n, b) in queue.iter().enumerate() {
        flush_client_rendered_boundary(req, &mut sink, *b, &prefix);
        flushed = n + 1;
        if !sink.has_capacity() {
            break;
        }
    }
    requeue(&mut req.client_rendered_boundaries, queue, flushed);

    // Newly completed boundaries: hidden content plus the patch script.
    if sink.has_capacity() {
        let mut queue = std::mem::take(&mut req.completed_boundaries);
        let mut flushed = 0;
        for (n, b) in queue.iter().enumerate() {
            flush_completed_boundary(req, &mut sink, *b, &prefix);
            flushed = n + 1;
            if !sink.has_capacity() {
                break;
            }
        }
        requeue(&mut req.completed_boundaries, queue, flushed);
    }

    // Forward progress on boundaries that are still pending: their
    // finished segments stream out so the eventual completion is cheap.
    if sink.has_capacity() {
        let mut queue = std::mem::take(&mut req.partial_boundaries);
        let mut flushed = 0;
        for (n, b) in queue.iter().enumerate() {
            let done = flush_partial_boundary(req, &mut sink, *b, &prefix);
            if !done {
                break;
            }
            flushed = n + 1;
            if !sink.has_capacity() {
                break;
            }
        }
        requeue(&mut req.partial_boundaries, queue, flushed);
    }

    sink.flush();

    if req.status == RequestStatus::Fatal {
        // A bug guard fired mid-flush; end the stream abnormally.
        if let Some(error) = req.fatal.clone() {
            sink.error(&error);
        }
        return;
    }

    let everything_delivered = req.all_pending_tasks == 0
        && req.pinged.borrow().is_empty()
        && req.completed_root_segment.is_none()
        && req.client_rendered_boundaries.is_empty()
        && req.completed_boundaries.is_empty()
        && req.partial_boundaries.is_empty();
    if everything_delivered {
        tracing::debug!("stream complete; closing sink");
        sink.close();
        req.status = RequestStatus::Closed;
        return;
    }
    req.sink = Some(sink);
}

/// Splices a partially-flushed queue back together with entries added
/// during the pass, preserving completion order.
fn requeue(current: &mut Vec<BoundaryId>, mut taken: Vec<BoundaryId>, flushed: usize) {
    if flushed >= taken.len() && current.is_empty() {
        return;
    }
    let mut rest: Vec<BoundaryId> = taken.split_off(flushed);
    rest.append(current);
    *current = rest;
}

/// Emits one segment at its position: completed content inline, or the
/// boundary framing appropriate to the boundary owning this position.
fn flush_segment(req: &mut Request, sink: &mut ChunkSink, seg_id: SegmentId, prefix: &str) {
    let Some(b) = req.segments[seg_id.index()].boundary else {
        flush_subtree(req, sink, seg_id, prefix);
        return;
    };
    req.boundaries[b.index()].parent_flushed = true;
    let status = req.boundaries[b.index()].status;
    match status {
        BoundaryStatus::ClientRendered => {
            let digest = req.boundaries[b.index()].error_digest.clone();
            wire::write_start_client_rendered_boundary(sink, digest.as_deref());
            flush_subtree(req, sink, seg_id, prefix);
            wire::write_end_boundary(sink);
        }
        BoundaryStatus::Pending | BoundaryStatus::Postponed => {
            let id = boundary_wire_id(req, b);
            if !req.boundaries[b.index()].completed_segments.is_empty() {
                req.partial_boundaries.push(b);
            }
            wire::write_start_pending_boundary(sink, prefix, id);
            flush_subtree(req, sink, seg_id, prefix);
            wire::write_end_boundary(sink);
        }
        BoundaryStatus::Completed
            if req.boundaries[b.index()].byte_size > req.progressive_chunk_size =>
        {
            // Large boundary: ship the fallback now, the content out of
            // band, so everything after it keeps flowing.
            let id = boundary_wire_id(req, b);
            req.completed_boundaries.push(b);
            wire::write_start_pending_boundary(sink, prefix, id);
            flush_subtree(req, sink, seg_id, prefix);
            wire::write_end_boundary(sink);
        }
        BoundaryStatus::Completed => {
            wire::write_start_completed_boundary(sink);
            let content = {
                let segs = &req.boundaries[b.index()].completed_segments;
                if segs.len() != 1 {
                    fatal_error(
                        req,
                        RenderError::internal(
                            "a boundary flushed inline must have exactly one root segment",
                        ),
                    );
                    return;
                }
                segs[0]
            };
            flush_segment(req, sink, content, prefix);
            req.boundaries[b.index()].completed_segments.clear();
            wire::write_end_boundary(sink);
        }
    }
}

fn boundary_wire_id(req: &mut Request, b: BoundaryId) -> u32 {
    match req.boundaries[b.index()].wire_id {
        Some(id) => id,
        None => {
            let id = req.next_wire();
            req.boundaries[b.index()].wire_id = Some(id);
            id
        }
    }
}

fn segment_wire_id(req: &mut Request, seg_id: SegmentId) -> u32 {
    match req.segments[seg_id.index()].wire_id {
        Some(id) => id,
        None => {
            let id = req.next_wire();
            req.segments[seg_id.index()].wire_id = Some(id);
            id
        }
    }
}

/// Emits a segment's own chunks with child segments spliced in at their
/// recorded positions; pending children leave a placeholder anchor.
fn flush_subtree(req: &mut Request, sink: &mut ChunkSink, seg_id: SegmentId, prefix: &str) {
    req.segments[seg_id.index()].parent_flushed = true;
    match req.segments[seg_id.index()].status {
        SegmentStatus::Pending | SegmentStatus::Postponed => {
            let id = segment_wire_id(req, seg_id);
            wire::write_placeholder(sink, prefix, id);
        }
        SegmentStatus::Completed => {
            req.segments[seg_id.index()].status = SegmentStatus::Flushed;
            let chunks = std::mem::take(&mut req.segments[seg_id.index()].chunks);
            let children: Vec<SegmentId> =
                req.segments[seg_id.index()].children.iter().copied().collect();
            let mut chunk_idx = 0;
            for child in children {
                let splice = req.segments[child.index()].splice_index;
                while chunk_idx < splice && chunk_idx < chunks.len() {
                    sink.write_chunk(&chunks[chunk_idx]);
                    chunk_idx += 1;
                }
                flush_segment(req, sink, child, prefix);
            }
            while chunk_idx < chunks.len() {
                sink.write_chunk(&chunks[chunk_idx]);
                chunk_idx += 1;
            }
        }
        SegmentStatus::Flushed | SegmentStatus::Aborted => {
            fatal_error(
                req,
                RenderError::internal(
                    "aborted or already-flushed segments must not flush again",
                ),
            );
        }
    }
}

fn flush_client_rendered_boundary(
    req: &mut Request,
    sink: &mut ChunkSink,
    b: BoundaryId,
    prefix: &str,
) {
    let Some(id) = req.boundaries[b.index()].wire_id else {
        // Failed before its position ever flushed; the inline form already
        // carried the error marker.
        return;
    };
    let digest = req.boundaries[b.index()].error_digest.clone();
    wire::write_client_render_instruction(sink, &mut req.resumable, prefix, id, digest.as_deref());
}

fn flush_completed_boundary(req: &mut Request, sink: &mut ChunkSink, b: BoundaryId, prefix: &str) {
    if req.boundaries[b.index()].status != BoundaryStatus::Completed {
        return;
    }
    let segments: Vec<SegmentId> = req.boundaries[b.index()]
        .completed_segments
        .drain(..)
        .collect();
    for seg in segments {
        flush_partially_completed_segment(req, sink, b, seg, prefix);
    }
    let id = boundary_wire_id(req, b);
    wire::write_completed_boundary_instruction(sink, &mut req.resumable, prefix, id);
}

/// Returns false when the sink ran out of capacity before this boundary's
/// segments were all emitted; the remainder stays queued.
fn flush_partial_boundary(
    req: &mut Request,
    sink: &mut ChunkSink,
    b: BoundaryId,
    prefix: &str,
) -> bool {
    if req.boundaries[b.index()].status == BoundaryStatus::ClientRendered {
        // Failed after some segments completed; the client instruction
        // supersedes them.
        req.boundaries[b.index()].completed_segments.clear();
        return true;
    }
    let mut segments: Vec<SegmentId> = req.boundaries[b.index()]
        .completed_segments
        .drain(..)
        .collect();
    let mut done = 0;
    for (n, seg) in segments.iter().enumerate() {
        flush_partially_completed_segment(req, sink, b, *seg, prefix);
        done = n + 1;
        if !sink.has_capacity() {
            break;
        }
    }
    let complete = done == segments.len();
    let rest = segments.split_off(done);
    req.boundaries[b.index()]
        .completed_segments
        .extend(rest);
    complete
}

fn flush_partially_completed_segment(
    req: &mut Request,
    sink: &mut ChunkSink,
    b: BoundaryId,
    seg_id: SegmentId,
    prefix: &str,
) {
    if req.segments[seg_id.index()].status == SegmentStatus::Flushed {
        // A compacted duplicate already went out.
        return;
    }
    let root_id = req.boundaries[b.index()].wire_id;
    match req.segments[seg_id.index()].wire_id {
        None => {
            // The root segment of a late boundary adopts the boundary's
            // number; the completion instruction moves it into place.
            let Some(id) = root_id else {
                fatal_error(
                    req,
                    RenderError::internal("a root segment id must have been assigned by now"),
                );
                return;
            };
            req.segments[seg_id.index()].wire_id = Some(id);
            flush_segment_container(req, sink, seg_id, id, prefix);
        }
        Some(id) if root_id == Some(id) => {
            flush_segment_container(req, sink, seg_id, id, prefix);
        }
        Some(id) => {
            flush_segment_container(req, sink, seg_id, id, prefix);
            wire::write_completed_segment_instruction(sink, &mut req.resumable, prefix, id);
        }
    }
}

fn flush_segment_container(
    req: &mut Request,
    sink: &mut ChunkSink,
    seg_id: SegmentId,
    id: u32,
    prefix: &str,
) {
    let format = req.segments[seg_id.index()].format_context;
    wire::write_start_segment(sink, format, prefix, id);
    flush_subtree(req, sink, seg_id, prefix);
    wire::write_end_segment(sink, format);
}
