//! Resolvable cells that drive task suspension.
//!
//! An [`Awaitable`] is the single-threaded stand-in for a pending value: the
//! embedder creates one, hands it to the tree (via [`Node::async_node`] or a
//! component output), and resolves or rejects it later. Tasks that suspend
//! on an unsettled awaitable register a ping; settling the awaitable moves
//! those pings onto the owning request's ready queue, and the next
//! `perform_work` call picks the tasks back up.
//!
//! There is no waker machinery and no polling: the renderer is cooperative
//! and externally driven, so a ping is just a task id pushed onto a queue.
//!
//! [`Node::async_node`]: crate::tree::Node::async_node

use crate::error::RenderError;
use crate::tree::node::Node;
use crate::types::TaskId;
use core::fmt;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The shared ready queue tasks are pinged onto.
pub(crate) type PingQueue = Rc<RefCell<VecDeque<TaskId>>>;

/// Observable status of an awaitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitableStatus {
    /// Not yet settled.
    Pending,
    /// Settled with a node.
    Resolved,
    /// Settled with an error.
    Rejected,
}

enum AwaitableState {
    Pending,
    Resolved(Node),
    Rejected(RenderError),
}

struct AwaitableInner {
    state: AwaitableState,
    waiters: Vec<(PingQueue, TaskId)>,
}

/// A resolvable cell producing a [`Node`].
///
/// Cloning is cheap and all clones observe the same settlement. An
/// awaitable settles at most once; later settle calls are ignored.
#[derive(Clone)]
pub struct Awaitable {
    inner: Rc<RefCell<AwaitableInner>>,
}

impl Awaitable {
    /// Creates a new unsettled awaitable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AwaitableInner {
                state: AwaitableState::Pending,
                waiters: Vec::new(),
            })),
        }
    }

    /// Creates an awaitable that is already resolved with `node`.
    #[must_use]
    pub fn resolved(node: Node) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AwaitableInner {
                state: AwaitableState::Resolved(node),
                waiters: Vec::new(),
            })),
        }
    }

    /// Resolves the awaitable with a node, pinging every waiting task.
    ///
    /// A no-op if the awaitable already settled.
    pub fn resolve(&self, node: Node) {
        self.settle(AwaitableState::Resolved(node));
    }

    /// Rejects the awaitable with an error, pinging every waiting task.
    ///
    /// A no-op if the awaitable already settled.
    pub fn reject(&self, error: RenderError) {
        self.settle(AwaitableState::Rejected(error));
    }

    fn settle(&self, state: AwaitableState) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, AwaitableState::Pending) {
                return;
            }
            inner.state = state;
            std::mem::take(&mut inner.waiters)
        };
        for (queue, task) in waiters {
            queue.borrow_mut().push_back(task);
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> AwaitableStatus {
        match self.inner.borrow().state {
            AwaitableState::Pending => AwaitableStatus::Pending,
            AwaitableState::Resolved(_) => AwaitableStatus::Resolved,
            AwaitableState::Rejected(_) => AwaitableStatus::Rejected,
        }
    }

    /// Returns true once the awaitable resolved or rejected.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self.status(), AwaitableStatus::Pending)
    }

    /// Returns the settled value, if any.
    pub(crate) fn peek(&self) -> Option<Result<Node, RenderError>> {
        match &self.inner.borrow().state {
            AwaitableState::Pending => None,
            AwaitableState::Resolved(node) => Some(Ok(node.clone())),
            AwaitableState::Rejected(err) => Some(Err(err.clone())),
        }
    }

    /// Registers a ping for `task` on `queue`.
    ///
    /// If the awaitable already settled, the ping fires immediately.
    pub(crate) fn register_ping(&self, queue: PingQueue, task: TaskId) {
        let settled = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, AwaitableState::Pending) {
                inner.waiters.push((queue.clone(), task));
                false
            } else {
                true
            }
        };
        if settled {
            queue.borrow_mut().push_back(task);
        }
    }
}

impl Default for Awaitable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaitable")
            .field("status", &self.status())
            .field("waiters", &self.inner.borrow().waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> PingQueue {
        Rc::new(RefCell::new(VecDeque::new()))
    }

    #[test]
    fn resolve_pings_waiters() {
        let aw = Awaitable::new();
        let q = queue();
        aw.register_ping(q.clone(), TaskId(1));
        aw.register_ping(q.clone(), TaskId(2));
        assert!(q.borrow().is_empty());

        aw.resolve(Node::text("done"));
        let pinged: Vec<_> = q.borrow().iter().copied().collect();
        assert_eq!(pinged, vec![TaskId(1), TaskId(2)]);
    }

    #[test]
    fn ping_after_settlement_fires_immediately() {
        let aw = Awaitable::resolved(Node::text("x"));
        let q = queue();
        aw.register_ping(q.clone(), TaskId(9));
        assert_eq!(q.borrow().front(), Some(&TaskId(9)));
    }

    #[test]
    fn second_settlement_is_ignored() {
        let aw = Awaitable::new();
        aw.resolve(Node::text("first"));
        aw.reject(RenderError::component("late"));
        assert_eq!(aw.status(), AwaitableStatus::Resolved);
        assert!(aw.peek().expect("settled").is_ok());
    }
}
