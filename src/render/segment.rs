//! Segment buffers: partially-rendered output held in tree form.
//!
//! A segment is pure data: an ordered chunk list interleaved with child
//! segments at recorded splice points. Tasks write into segments; the flush
//! protocol reads them back out in document order regardless of the order
//! in which they completed. A segment owns no async behavior.

use crate::format::FormatContext;
use crate::types::{BoundaryId, SegmentId};
use bytes::Bytes;
use smallvec::SmallVec;

/// Lifecycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentStatus {
    /// Renderable: a task has yet to finish writing into it.
    Pending,
    /// The owning task finished; chunks are final.
    Completed,
    /// Emitted to the sink; chunks have been released.
    Flushed,
    /// Deliberately deferred for a later resume pass.
    Postponed,
    /// The owning task errored or was aborted; never flushed.
    Aborted,
}

/// A node in the per-boundary output tree.
pub(crate) struct Segment {
    pub(crate) status: SegmentStatus,
    /// Numeric id on the wire; assigned lazily when a placeholder or late
    /// flush first needs it.
    pub(crate) wire_id: Option<u32>,
    /// The chunk index in the parent segment where this segment splices in.
    pub(crate) splice_index: usize,
    /// Finished output, in order.
    pub(crate) chunks: Vec<Bytes>,
    /// Child segments; their `splice_index` values are non-decreasing and
    /// bounded by this segment's final chunk count.
    pub(crate) children: SmallVec<[SegmentId; 4]>,
    /// The boundary whose position this segment marks, if any. Such a
    /// segment holds the boundary's fallback output.
    pub(crate) boundary: Option<BoundaryId>,
    /// True once the parent's output (or placeholder) reached the sink,
    /// which means this segment must flush out of band when it completes.
    pub(crate) parent_flushed: bool,
    /// Format state this segment's content renders under; selects the
    /// hidden-container wrapper for late flushes.
    pub(crate) format_context: FormatContext,
    /// Whether the most recently pushed chunk was text, for separator
    /// insertion between adjacent text runs.
    pub(crate) last_pushed_text: bool,
    /// Whether this segment begins directly after text in its parent.
    pub(crate) text_embedded: bool,
}

impl Segment {
    pub(crate) fn new(
        splice_index: usize,
        boundary: Option<BoundaryId>,
        format_context: FormatContext,
        text_embedded: bool,
    ) -> Self {
        Self {
            status: SegmentStatus::Pending,
            wire_id: None,
            splice_index,
            chunks: Vec::new(),
            children: SmallVec::new(),
            boundary,
            parent_flushed: false,
            format_context,
            last_pushed_text: false,
            text_embedded,
        }
    }

    /// Total bytes buffered in this segment's own chunks.
    pub(crate) fn byte_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_segment_is_pending_and_empty() {
        let seg = Segment::new(3, None, FormatContext::root(), false);
        assert_eq!(seg.status, SegmentStatus::Pending);
        assert_eq!(seg.splice_index, 3);
        assert!(seg.chunks.is_empty());
        assert!(seg.children.is_empty());
        assert_eq!(seg.wire_id, None);
    }

    #[test]
    fn byte_len_sums_chunks() {
        let mut seg = Segment::new(0, None, FormatContext::root(), false);
        seg.chunks.push(Bytes::from_static(b"abc"));
        seg.chunks.push(Bytes::from_static(b"de"));
        assert_eq!(seg.byte_len(), 5);
    }
}
