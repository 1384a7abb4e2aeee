//! The component-tree model consumed by the renderer.
//!
//! The tree is a closed sum type ([`Node`]): text, host elements, fragments,
//! black-box components, async nodes, suspense boundaries, and context
//! providers. Component evaluation is a collaborator, not part of the core:
//! a component is a callback returning a tagged [`ComponentOutput`], never a
//! control-flow exception.
//!
//! - [`node`]: the node sum type and builders
//! - [`awaitable`]: single-threaded resolvable cells that drive suspension
//! - [`context`]: immutable component-context snapshots

pub mod awaitable;
pub mod context;
pub mod node;

pub use awaitable::{Awaitable, AwaitableStatus};
pub use context::ContextMap;
pub use node::{ComponentOutput, ComponentScope, Element, Node, Suspense};
