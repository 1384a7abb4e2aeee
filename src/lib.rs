//! Phloem: a streaming, interruptible renderer for declarative component
//! trees.
//!
//! # Overview
//!
//! Phloem converts a component tree into an incrementally-flushed output
//! stream. Parts of the tree can suspend on pending values without blocking
//! parts that are ready: suspended subtrees leave placeholder anchors in
//! the stream, and when they complete, their content follows out of band
//! together with a small patch instruction that splices it into place on
//! the receiving document. A resumable mode records deliberately deferred
//! subtrees into a serializable token so a later process can pick up the
//! render exactly where it stopped.
//!
//! # Core Guarantees
//!
//! - **Order preservation**: streaming never changes the final document,
//!   only its delivery timing; the segment tree restores document order
//!   regardless of completion order
//! - **Failure isolation**: an error below a boundary is absorbed there
//!   and converted to a client-rendered fallback; unrelated subtrees keep
//!   streaming
//! - **Cooperative scheduling**: one task runs at a time; suspension is
//!   explicit continuation state, never an unwind
//! - **Backpressure**: the flush protocol stops at the sink's capacity
//!   signal and resumes exactly where it stopped
//! - **Resumability**: deferred subtrees are addressable by structural key
//!   paths; a mismatched resume degrades to client rendering instead of
//!   corrupting output
//!
//! # Module Structure
//!
//! - [`types`]: id newtypes, key paths, tree contexts
//! - [`tree`]: the node model, awaitables, context snapshots
//! - [`format`]: format contexts, the markup writer collaborator, and the
//!   wire protocol
//! - [`resources`]: the resource-registry collaborator and resumable state
//! - [`sink`]: the byte destination collaborator and its batching buffer
//! - [`render`]: request, task, segment, boundary, scheduler, replay,
//!   flush
//! - [`api`]: the `render` / `prerender` / `resume` entry points
//!
//! # Example
//!
//! ```
//! use phloem::{render, BufferSink, Node, RenderCallbacks, RenderOptions};
//!
//! let tree = Node::element(
//!     "main",
//!     &[],
//!     vec![Node::element("h1", &[], vec![Node::text("hello")])],
//! );
//! let sink = BufferSink::new();
//! let mut handle = render(tree, RenderOptions::new(), RenderCallbacks::new());
//! handle.start_flowing(Box::new(sink.clone()));
//! assert_eq!(sink.contents_utf8(), "<main><h1>hello</h1></main>");
//! assert!(handle.is_complete());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod api;
pub mod error;
pub mod format;
pub mod render;
pub mod resources;
pub mod sink;
pub mod tree;
pub mod types;

pub use api::{
    prerender, prerender_with, render, render_with, resume, resume_with, PrerenderHandle,
    RenderHandle,
};
pub use error::{ErrorKind, RenderError, Result};
pub use format::{FormatContext, HtmlWriter, InsertionMode, MarkupWriter};
pub use render::{
    RenderCallbacks, RenderOptions, ResumeNode, ResumeSlot, ResumeToken, TokenError,
    DEFAULT_PROGRESSIVE_CHUNK_SIZE, RESUME_SCHEMA_VERSION,
};
pub use resources::{DedupResources, PreloadDescriptor, ResourceRegistry, ResumableState};
pub use sink::{BufferSink, Sink, DEFAULT_SINK_BUFFER};
pub use tree::{Awaitable, AwaitableStatus, ComponentOutput, ComponentScope, ContextMap, Node};
pub use types::{KeyOrIndex, KeyPath, TreeContext};
