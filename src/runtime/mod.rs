//! Thread-confined execution contexts with timers, message routing and workers.
//!
//! Each context owns a single V8 isolate (through `deno_core`) running on a
//! dedicated OS thread with a Tokio event loop. Tasks, timer firings and
//! message deliveries for one context are executed on that thread in a single
//! FIFO order.

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
mod ops;
pub mod router;
pub mod runner;
pub mod source_path;
pub mod task;
pub mod timers;
pub mod worker;

// Re-export key types for convenience
pub use config::ContextConfig;
pub use engine::ScriptEngine;
pub use error::{ContextError, ContextId};
pub use handle::ExecutionContext;
pub use router::{MessageHandler, RouteKey};
pub use runner::ContextCore;
pub use task::TaskFuture;
pub use timers::{TimerCallback, TimerHandle, TimerState};
pub use worker::{ParentLink, ScriptKind, WorkerHandle, WorkerId, WorkerOptions};
