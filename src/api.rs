//! Public entry points: [`render`], [`prerender`], and [`resume`].
//!
//! All three hand back a handle over the underlying request. The renderer
//! is externally driven: settle your awaitables, then call
//! [`RenderHandle::perform_work`] to run the scheduler and flush whatever
//! became ready. Attaching a sink with [`RenderHandle::start_flowing`]
//! starts delivery; until then completed work just accumulates.

use crate::format::MarkupWriter;
use crate::render::replay::{postponed_state, ResumeToken};
use crate::render::request::{RenderCallbacks, RenderMode, RenderOptions, Request, RequestStatus};
use crate::render::scheduler;
use crate::resources::ResourceRegistry;
use crate::sink::{ChunkSink, Sink};
use crate::tree::Node;
use crate::error::RenderError;

/// A live render session.
pub struct RenderHandle {
    req: Request,
}

impl RenderHandle {
    /// Attaches the byte destination and flushes everything already
    /// completed.
    pub fn start_flowing(&mut self, sink: Box<dyn Sink>) {
        let buffered = ChunkSink::new(sink, self.req.sink_buffer_size);
        self.req.attach_sink(buffered);
        crate::render::flush::flush_completed_queues(&mut self.req);
    }

    /// Runs the scheduler over every pinged task, then flushes if a sink
    /// is attached. Call after settling awaitables.
    pub fn perform_work(&mut self) {
        scheduler::perform_work(&mut self.req);
    }

    /// Fails all outstanding work with a uniform abort error. Idempotent.
    pub fn abort(&mut self, reason: Option<&str>) {
        scheduler::abort_request(&mut self.req, reason);
    }

    /// True once every byte was delivered and the sink closed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.req.status == RequestStatus::Closed
    }

    /// The fatal error that ended the request, if one did.
    #[must_use]
    pub fn fatal_error(&self) -> Option<&RenderError> {
        self.req.fatal.as_ref()
    }
}

/// A resumable render session.
///
/// Behaves like [`RenderHandle`]; additionally, once work has settled, the
/// deferred parts can be extracted as a [`ResumeToken`].
pub struct PrerenderHandle {
    inner: RenderHandle,
}

impl PrerenderHandle {
    /// See [`RenderHandle::start_flowing`].
    pub fn start_flowing(&mut self, sink: Box<dyn Sink>) {
        self.inner.start_flowing(sink);
    }

    /// See [`RenderHandle::perform_work`].
    pub fn perform_work(&mut self) {
        self.inner.perform_work();
    }

    /// See [`RenderHandle::abort`].
    pub fn abort(&mut self, reason: Option<&str>) {
        self.inner.abort(reason);
    }

    /// See [`RenderHandle::is_complete`].
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// See [`RenderHandle::fatal_error`].
    #[must_use]
    pub fn fatal_error(&self) -> Option<&RenderError> {
        self.inner.fatal_error()
    }

    /// Extracts the resume token, or `None` if nothing was deferred.
    ///
    /// Meaningful once the prerender has settled (all ready or aborted);
    /// extracting earlier misses deferrals that have not happened yet.
    pub fn into_resume_token(mut self) -> Option<ResumeToken> {
        postponed_state(&mut self.inner.req)
    }
}

/// Begins an immediately-flowing render of `tree`.
///
/// The initial synchronous pass runs before this returns: a tree with no
/// async boundaries is fully rendered (and fully flushed once a sink is
/// attached).
#[must_use]
pub fn render(tree: Node, options: RenderOptions, callbacks: RenderCallbacks) -> RenderHandle {
    let (writer, resources) = Request::default_collaborators();
    render_with(tree, options, callbacks, writer, resources)
}

/// [`render`] with explicit writer and resource-registry collaborators.
#[must_use]
pub fn render_with(
    tree: Node,
    options: RenderOptions,
    callbacks: RenderCallbacks,
    writer: Box<dyn MarkupWriter>,
    resources: Box<dyn ResourceRegistry>,
) -> RenderHandle {
    let mut req = Request::new(
        tree,
        RenderMode::Streaming,
        options,
        callbacks,
        writer,
        resources,
    );
    scheduler::perform_work(&mut req);
    RenderHandle { req }
}

/// Begins a resumable render: deliberate deferrals are recorded instead of
/// being errors, and the unfinished parts come back as a resume token.
#[must_use]
pub fn prerender(
    tree: Node,
    options: RenderOptions,
    callbacks: RenderCallbacks,
) -> PrerenderHandle {
    let (writer, resources) = Request::default_collaborators();
    prerender_with(tree, options, callbacks, writer, resources)
}

/// [`prerender`] with explicit collaborators.
#[must_use]
pub fn prerender_with(
    tree: Node,
    options: RenderOptions,
    callbacks: RenderCallbacks,
    writer: Box<dyn MarkupWriter>,
    resources: Box<dyn ResourceRegistry>,
) -> PrerenderHandle {
    let mut req = Request::new(
        tree,
        RenderMode::Resumable,
        options,
        callbacks,
        writer,
        resources,
    );
    scheduler::perform_work(&mut req);
    PrerenderHandle {
        inner: RenderHandle { req },
    }
}

/// Continues a previously deferred render from its token.
///
/// `tree` must structurally match the tree that produced the token; any
/// disagreement downgrades the affected boundaries to client-rendered
/// fallbacks.
#[must_use]
pub fn resume(
    tree: Node,
    token: ResumeToken,
    options: RenderOptions,
    callbacks: RenderCallbacks,
) -> RenderHandle {
    let (writer, resources) = Request::default_collaborators();
    resume_with(tree, token, options, callbacks, writer, resources)
}

/// [`resume`] with explicit collaborators.
#[must_use]
pub fn resume_with(
    tree: Node,
    token: ResumeToken,
    options: RenderOptions,
    callbacks: RenderCallbacks,
    writer: Box<dyn MarkupWriter>,
    resources: Box<dyn ResourceRegistry>,
) -> RenderHandle {
    let mut req = Request::resume(tree, token, options, callbacks, writer, resources);
    scheduler::perform_work(&mut req);
    RenderHandle { req }
}
