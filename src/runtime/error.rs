//! Error taxonomy shared by contexts, timers, routing and workers.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Errors raised by the execution layer.
///
/// Each variant is one failure class callers are expected to tell apart:
/// argument validation, missing script resources, thread-confinement and
/// reentrancy violations, engine failures, and lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A primitive was called with a bad argument (type, arity, handle).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A worker script location does not name an existing regular file.
    #[error("script resource '{}' is unusable: {reason}", path.display())]
    Resource { path: PathBuf, reason: String },

    /// The engine of a context was touched from a thread that does not own it.
    #[error("engine of {context} accessed from a thread other than its owner")]
    ConfinementViolation { context: ContextId },

    /// A synchronous submission targeted the context whose thread is making it.
    ///
    /// Waiting would block the only thread able to run the task, so the call
    /// is refused instead of deadlocking.
    #[error("synchronous submission into {context} from its own thread would deadlock")]
    ReentrantSubmission { context: ContextId },

    /// The engine reported an error while evaluating script code.
    #[error("script error: {0}")]
    Script(String),

    /// The context thread or engine could not be brought up.
    #[error("failed to initialize context: {0}")]
    Init(String),

    /// The context has been stopped or its thread is gone.
    #[error("{context} is no longer running")]
    Terminated { context: ContextId },

    /// The engine lacks a capability a primitive depends on.
    #[error("{0} is not supported by this engine")]
    Unsupported(String),
}

impl ContextError {
    /// Short stable name of the failure class, surfaced to scripts as `error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::Validation(_) => "validation",
            ContextError::Resource { .. } => "resource",
            ContextError::ConfinementViolation { .. } => "confinement",
            ContextError::ReentrantSubmission { .. } => "reentrant",
            ContextError::Script(_) => "script",
            ContextError::Init(_) => "init",
            ContextError::Terminated { .. } => "terminated",
            ContextError::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_reentrant(&self) -> bool {
        matches!(self, ContextError::ReentrantSubmission { .. })
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ContextError::Validation(message.into())
    }

    pub(crate) fn script(err: impl fmt::Display) -> Self {
        ContextError::Script(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("ctx-{}", a.as_u64()));
    }

    #[test]
    fn test_error_kinds() {
        let id = ContextId::next();
        assert_eq!(ContextError::validation("x").kind(), "validation");
        assert_eq!(
            ContextError::ReentrantSubmission { context: id }.kind(),
            "reentrant"
        );
        assert!(ContextError::ReentrantSubmission { context: id }.is_reentrant());
        assert!(!ContextError::Terminated { context: id }.is_reentrant());
    }

    #[test]
    fn test_resource_error_message_names_path() {
        let err = ContextError::Resource {
            path: PathBuf::from("/tmp/missing.js"),
            reason: "file does not exist".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/missing.js"));
        assert!(message.contains("does not exist"));
    }
}
