//! Browser-style timers and workers on top of thread-confined V8 contexts.
//!
//! Every [`ExecutionContext`] owns one `deno_core` engine on a dedicated
//! thread. Other threads talk to it only by queueing work, so the engine is
//! never touched concurrently.

pub mod runtime;

pub use runtime::{
    ContextConfig, ContextCore, ContextError, ContextId, ExecutionContext, RouteKey, ScriptKind,
    TaskFuture, TimerHandle, TimerState, WorkerHandle, WorkerId, WorkerOptions,
};
