//! Error types and error handling strategy for phloem.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Suspension and deliberate deferral are *not* errors; they travel as
//!   scheduler signals and must never surface through this module
//! - Errors are classified by blast radius: a recoverable error is absorbed
//!   by the nearest enclosing boundary, a fatal error ends the request
//!
//! # Error Categories
//!
//! - **Render**: a component failed while producing its subtree
//! - **Cancellation**: the request was aborted by the caller
//! - **Config**: the caller asked for something the render mode cannot do
//! - **Replay**: a resumed tree disagrees with the recorded resume ledger
//! - **Markup**: the markup writer rejected a tag or attribute name
//! - **Internal**: invariant violations; always bugs, always fatal

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Render ===
    /// A component returned a failure while rendering.
    Component,
    /// A pending value was rejected instead of resolved.
    AwaitableRejected,
    /// A task exceeded the bounded synchronous re-render limit.
    TooManyRerenders,

    // === Cancellation ===
    /// The request was aborted by the caller.
    Aborted,

    // === Config ===
    /// Deliberate deferral was signalled outside a resumable render.
    PostponeOutsideResume,
    /// Deliberate deferral was signalled with no enclosing boundary.
    PostponeAtRoot,

    // === Replay ===
    /// The resumed tree does not match the recorded resume ledger.
    ReplayMismatch,
    /// The resume token could not be decoded.
    TokenDecode,

    // === Markup ===
    /// The markup writer rejected an element or attribute name.
    InvalidMarkup,

    // === Internal ===
    /// Invariant violation inside the renderer. Always a bug.
    Internal,
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Component render failures.
    Render,
    /// Caller-initiated cancellation.
    Cancellation,
    /// Render-mode configuration errors.
    Config,
    /// Resume-ledger disagreements.
    Replay,
    /// Markup writer rejections.
    Markup,
    /// Renderer bugs.
    Internal,
}

/// How far an error propagates when it occurs during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlastRadius {
    /// Absorbed by the nearest enclosing boundary; unrelated subtrees
    /// keep rendering. Escalates to fatal only with no boundary above.
    Boundary,
    /// Ends the whole request regardless of boundaries.
    Request,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Component | Self::AwaitableRejected | Self::TooManyRerenders => {
                ErrorCategory::Render
            }
            Self::Aborted => ErrorCategory::Cancellation,
            Self::PostponeOutsideResume | Self::PostponeAtRoot => ErrorCategory::Config,
            Self::ReplayMismatch | Self::TokenDecode => ErrorCategory::Replay,
            Self::InvalidMarkup => ErrorCategory::Markup,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the blast radius for this error kind.
    #[must_use]
    pub const fn blast_radius(&self) -> BlastRadius {
        match self {
            Self::Component
            | Self::AwaitableRejected
            | Self::Aborted
            | Self::PostponeOutsideResume
            | Self::ReplayMismatch
            | Self::TokenDecode
            | Self::InvalidMarkup => BlastRadius::Boundary,
            Self::TooManyRerenders | Self::PostponeAtRoot | Self::Internal => BlastRadius::Request,
        }
    }
}

/// The main error type for phloem operations.
#[derive(Debug, Clone)]
pub struct RenderError {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl RenderError {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error ends the whole request.
    #[must_use]
    pub const fn is_request_fatal(&self) -> bool {
        matches!(self.kind.blast_radius(), BlastRadius::Request)
    }

    /// Returns true if this error represents caller cancellation.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates a component render error.
    #[must_use]
    pub fn component(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Component).with_message(detail)
    }

    /// Creates an abort error from the caller-supplied reason.
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted).with_message(reason)
    }

    /// Creates a replay mismatch error.
    #[must_use]
    pub fn replay_mismatch(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReplayMismatch).with_message(detail)
    }

    /// Creates an internal error (renderer bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for phloem operations.
pub type Result<T> = core::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = RenderError::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_message() {
        let err = RenderError::component("boom");
        assert_eq!(err.to_string(), "Component: boom");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = RenderError::component("outer").with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn blast_radius_classification() {
        assert!(!RenderError::component("x").is_request_fatal());
        assert!(!RenderError::aborted("x").is_request_fatal());
        assert!(RenderError::new(ErrorKind::PostponeAtRoot).is_request_fatal());
        assert!(RenderError::internal("x").is_request_fatal());
    }

    #[test]
    fn categories_match_kind() {
        assert_eq!(ErrorKind::Aborted.category(), ErrorCategory::Cancellation);
        assert_eq!(ErrorKind::ReplayMismatch.category(), ErrorCategory::Replay);
        assert_eq!(ErrorKind::InvalidMarkup.category(), ErrorCategory::Markup);
    }
}
