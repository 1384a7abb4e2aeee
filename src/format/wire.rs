//! The streaming-boundary wire protocol.
//!
//! Everything the receiving document needs to splice late content into
//! place: placeholder anchors, boundary framing comments, hidden segment
//! containers, and the three inline patch instructions. Instruction script
//! bodies are sent once per stream (tracked in [`ResumableState`]); later
//! instructions of the same kind emit only the call.
//!
//! Wire ids are hexadecimal and namespaced by the request's identifier
//! prefix: placeholder `P:`, segment container `S:`, boundary anchor `B:`.

use crate::format::writer::escape_attr_into;
use crate::format::{FormatContext, InsertionMode};
use crate::resources::{
    ResumableState, SENT_CLIENT_RENDER_FN, SENT_COMPLETE_BOUNDARY_FN, SENT_COMPLETE_SEGMENT_FN,
};
use crate::sink::ChunkSink;

/// Separator between adjacent text runs, so client-side hydration can split
/// what would otherwise coalesce into one text node.
pub(crate) const TEXT_SEPARATOR: &[u8] = b"<!-- -->";

const PLACEHOLDER_1: &[u8] = b"<template id=\"";
const PLACEHOLDER_2: &[u8] = b"\"></template>";

const START_COMPLETED_BOUNDARY: &[u8] = b"<!--$-->";
const START_PENDING_BOUNDARY_1: &[u8] = b"<!--$?--><template id=\"";
const START_PENDING_BOUNDARY_2: &[u8] = b"\"></template>";
const START_CLIENT_RENDERED_BOUNDARY: &[u8] = b"<!--$!-->";
const CLIENT_RENDERED_DIGEST_1: &[u8] = b"<template data-dgst=\"";
const CLIENT_RENDERED_DIGEST_2: &[u8] = b"\"></template>";
const END_BOUNDARY: &[u8] = b"<!--/$-->";

const START_SEGMENT_HTML_1: &[u8] = b"<div hidden id=\"";
const START_SEGMENT_HTML_2: &[u8] = b"\">";
const END_SEGMENT_HTML: &[u8] = b"</div>";
const START_SEGMENT_SVG_1: &[u8] = b"<svg aria-hidden=\"true\" style=\"display:none\" id=\"";
const START_SEGMENT_SVG_2: &[u8] = b"\">";
const END_SEGMENT_SVG: &[u8] = b"</svg>";
const START_SEGMENT_MATHML_1: &[u8] = b"<math aria-hidden=\"true\" style=\"display:none\" id=\"";
const START_SEGMENT_MATHML_2: &[u8] = b"\">";
const END_SEGMENT_MATHML: &[u8] = b"</math>";

const START_INLINE_SCRIPT: &[u8] = b"<script>";

// Moves a completed hidden segment into the place held by its placeholder.
const COMPLETE_SEGMENT_FN: &[u8] = b"$RS=function(a,b){a=document.getElementById(a);b=document.getElementById(b);for(a.parentNode.removeChild(a);a.firstChild;)b.parentNode.insertBefore(a.firstChild,b);b.parentNode.removeChild(b)};$RS(\"";
const COMPLETE_SEGMENT_CALL: &[u8] = b"$RS(\"";

// Replaces a pending boundary's fallback with its completed hidden content.
const COMPLETE_BOUNDARY_FN: &[u8] = b"$RC=function(b,c,e){c=document.getElementById(c);c.parentNode.removeChild(c);var a=document.getElementById(b);if(a){b=a.previousSibling;if(e)b.data=\"$!\",a.setAttribute(\"data-dgst\",e);else{e=b.parentNode;a=b.nextSibling;var f=0;do{if(a&&8===a.nodeType){var d=a.data;if(\"/$\"===d)if(0===f)break;else f--;else\"$\"!==d&&\"$?\"!==d&&\"$!\"!==d||f++}d=a.nextSibling;e.removeChild(a);a=d}while(a);for(;c.firstChild;)e.insertBefore(c.firstChild,a);b.data=\"$\"}b._hydrateRetry&&b._hydrateRetry()}};$RC(\"";
const COMPLETE_BOUNDARY_CALL: &[u8] = b"$RC(\"";

// Marks a delivered boundary as failed so the client re-renders it.
const CLIENT_RENDER_FN: &[u8] = b"$RX=function(b,c,d,e,f){var a=document.getElementById(b);a&&(b=a.previousSibling,b.data=\"$!\",a=a.dataset,c&&(a.dgst=c),d&&(a.msg=d),e&&(a.stck=e),f&&(a.cstck=f),b._hydrateRetry&&b._hydrateRetry())};$RX(\"";
const CLIENT_RENDER_CALL: &[u8] = b"$RX(\"";

const SCRIPT_ARG_SEP: &[u8] = b"\",\"";
const SCRIPT_END: &[u8] = b"\")</script>";

fn write_wire_id(sink: &mut ChunkSink, prefix: &str, kind: &str, id: u32) {
    let mut buf = String::with_capacity(prefix.len() + kind.len() + 8);
    buf.push_str(prefix);
    buf.push_str(kind);
    buf.push_str(&format!("{id:x}"));
    sink.write_chunk(buf.as_bytes());
}

/// Emits the placeholder anchor for a not-yet-ready segment.
pub(crate) fn write_placeholder(sink: &mut ChunkSink, prefix: &str, id: u32) {
    sink.write_chunk(PLACEHOLDER_1);
    write_wire_id(sink, prefix, "P:", id);
    sink.write_chunk(PLACEHOLDER_2);
}

/// Emits the opening of a boundary that completed before its position
/// flushed.
pub(crate) fn write_start_completed_boundary(sink: &mut ChunkSink) {
    sink.write_chunk(START_COMPLETED_BOUNDARY);
}

/// Emits the opening of a still-pending boundary, anchored for a later
/// patch instruction.
pub(crate) fn write_start_pending_boundary(sink: &mut ChunkSink, prefix: &str, id: u32) {
    sink.write_chunk(START_PENDING_BOUNDARY_1);
    write_wire_id(sink, prefix, "B:", id);
    sink.write_chunk(START_PENDING_BOUNDARY_2);
}

/// Emits the opening of a boundary that failed on the server, with the
/// opaque digest the client reports when it retries.
pub(crate) fn write_start_client_rendered_boundary(sink: &mut ChunkSink, digest: Option<&str>) {
    sink.write_chunk(START_CLIENT_RENDERED_BOUNDARY);
    if let Some(digest) = digest {
        sink.write_chunk(CLIENT_RENDERED_DIGEST_1);
        let mut escaped = String::with_capacity(digest.len());
        escape_attr_into(&mut escaped, digest);
        sink.write_chunk(escaped.as_bytes());
        sink.write_chunk(CLIENT_RENDERED_DIGEST_2);
    }
}

/// Closes any boundary framing.
pub(crate) fn write_end_boundary(sink: &mut ChunkSink) {
    sink.write_chunk(END_BOUNDARY);
}

/// Opens the hidden container a late segment streams into.
pub(crate) fn write_start_segment(
    sink: &mut ChunkSink,
    format: FormatContext,
    prefix: &str,
    id: u32,
) {
    let (start, after) = match format.insertion_mode {
        InsertionMode::Html => (START_SEGMENT_HTML_1, START_SEGMENT_HTML_2),
        InsertionMode::Svg => (START_SEGMENT_SVG_1, START_SEGMENT_SVG_2),
        InsertionMode::MathMl => (START_SEGMENT_MATHML_1, START_SEGMENT_MATHML_2),
    };
    sink.write_chunk(start);
    write_wire_id(sink, prefix, "S:", id);
    sink.write_chunk(after);
}

/// Closes the hidden container opened by [`write_start_segment`].
pub(crate) fn write_end_segment(sink: &mut ChunkSink, format: FormatContext) {
    let end = match format.insertion_mode {
        InsertionMode::Html => END_SEGMENT_HTML,
        InsertionMode::Svg => END_SEGMENT_SVG,
        InsertionMode::MathMl => END_SEGMENT_MATHML,
    };
    sink.write_chunk(end);
}

/// Emits `$RS("S:id","P:id")`, splicing a late segment into its
/// placeholder.
pub(crate) fn write_completed_segment_instruction(
    sink: &mut ChunkSink,
    resumable: &mut ResumableState,
    prefix: &str,
    id: u32,
) {
    sink.write_chunk(START_INLINE_SCRIPT);
    if resumable.mark_instruction(SENT_COMPLETE_SEGMENT_FN) {
        sink.write_chunk(COMPLETE_SEGMENT_FN);
    } else {
        sink.write_chunk(COMPLETE_SEGMENT_CALL);
    }
    write_wire_id(sink, prefix, "S:", id);
    sink.write_chunk(SCRIPT_ARG_SEP);
    write_wire_id(sink, prefix, "P:", id);
    sink.write_chunk(SCRIPT_END);
}

/// Emits `$RC("B:id","S:id")`, replacing a pending boundary's fallback
/// with its completed content.
pub(crate) fn write_completed_boundary_instruction(
    sink: &mut ChunkSink,
    resumable: &mut ResumableState,
    prefix: &str,
    id: u32,
) {
    sink.write_chunk(START_INLINE_SCRIPT);
    if resumable.mark_instruction(SENT_COMPLETE_BOUNDARY_FN) {
        sink.write_chunk(COMPLETE_BOUNDARY_FN);
    } else {
        sink.write_chunk(COMPLETE_BOUNDARY_CALL);
    }
    write_wire_id(sink, prefix, "B:", id);
    sink.write_chunk(SCRIPT_ARG_SEP);
    write_wire_id(sink, prefix, "S:", id);
    sink.write_chunk(SCRIPT_END);
}

/// Emits `$RX("B:id","digest")`, telling the client to take over a failed
/// boundary.
pub(crate) fn write_client_render_instruction(
    sink: &mut ChunkSink,
    resumable: &mut ResumableState,
    prefix: &str,
    id: u32,
    digest: Option<&str>,
) {
    sink.write_chunk(START_INLINE_SCRIPT);
    if resumable.mark_instruction(SENT_CLIENT_RENDER_FN) {
        sink.write_chunk(CLIENT_RENDER_FN);
    } else {
        sink.write_chunk(CLIENT_RENDER_CALL);
    }
    write_wire_id(sink, prefix, "B:", id);
    if let Some(digest) = digest {
        sink.write_chunk(SCRIPT_ARG_SEP);
        sink.write_chunk(escape_script_string(digest).as_bytes());
    }
    sink.write_chunk(SCRIPT_END);
}

// Digest strings end up inside a single-line script literal; keep them from
// closing the quote or the script element.
fn escape_script_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '<' => out.push_str("\\u003c"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}
