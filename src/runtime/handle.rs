//! Thread-safe handle for interacting with a context thread.

use crate::runtime::config::ContextConfig;
use crate::runtime::error::{ContextError, ContextId};
use crate::runtime::router::RouteKey;
use crate::runtime::runner::{spawn_context_thread, ContextCommand, ContextCore};
use crate::runtime::task::{Reply, Task, TaskFuture};
use crate::runtime::timers::TimerHandle;
use deno_core::v8;
use once_cell::sync::OnceCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Handle to an execution context.
///
/// The engine itself never leaves the context thread. Every operation on the
/// handle is turned into a command on the context's FIFO queue, so clones of
/// the handle may be shared with any number of threads.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextShared>,
}

struct ContextShared {
    id: ContextId,
    tx: async_mpsc::UnboundedSender<ContextCommand>,
    owner: OnceCell<ThreadId>,
    isolate: OnceCell<v8::IsolateHandle>,
    stopped: AtomicBool,
    terminating: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Spawn a context thread and wait until its engine is ready.
    pub fn create(config: ContextConfig) -> Result<Self, ContextError> {
        config.validate()?;

        let (tx, rx) = async_mpsc::unbounded_channel::<ContextCommand>();
        let context = Self {
            inner: Arc::new(ContextShared {
                id: ContextId::next(),
                tx,
                owner: OnceCell::new(),
                isolate: OnceCell::new(),
                stopped: AtomicBool::new(false),
                terminating: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        };

        let thread = spawn_context_thread(context.clone(), config, rx)?;
        *context.lock_thread() = Some(thread);
        tracing::debug!(context = %context.id(), "context created");
        Ok(context)
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// True when called from the thread that owns this context's engine.
    pub fn is_owner_thread(&self) -> bool {
        self.inner.owner.get() == Some(&thread::current().id())
    }

    pub(crate) fn bind_owner_thread(&self) {
        let _ = self.inner.owner.set(thread::current().id());
    }

    pub(crate) fn bind_isolate(&self, isolate: v8::IsolateHandle) {
        let _ = self.inner.isolate.set(isolate);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// True once [`terminate`](Self::terminate) was called.
    pub fn is_terminating(&self) -> bool {
        self.inner.terminating.load(Ordering::SeqCst)
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, command: ContextCommand) -> Result<(), ContextError> {
        if self.is_stopped() {
            return Err(self.terminated());
        }
        self.inner
            .tx
            .send(command)
            .map_err(|_| self.terminated())
    }

    fn terminated(&self) -> ContextError {
        ContextError::Terminated { context: self.id() }
    }

    /// Run `task` on the context thread and block until it returns.
    ///
    /// Fails with [`ContextError::ReentrantSubmission`] when called from the
    /// context's own thread.
    pub fn submit<F, R>(&self, task: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut ContextCore) -> Result<R, ContextError> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_owner_thread() {
            return Err(ContextError::ReentrantSubmission { context: self.id() });
        }

        let (result_tx, result_rx) = mpsc::channel();
        let task: Task = Box::new(move |core| {
            let _ = result_tx.send(task(core));
        });
        self.enqueue(ContextCommand::Run(task))?;

        result_rx.recv().map_err(|_| self.terminated())?
    }

    /// Queue `task` on the context thread without waiting for it.
    ///
    /// Allowed from any thread, including the context's own. If the context
    /// is stopped the returned future resolves to [`ContextError::Terminated`].
    pub fn submit_async<F, R>(&self, task: F) -> TaskFuture<R>
    where
        F: FnOnce(&mut ContextCore) -> Result<R, ContextError> + Send + 'static,
        R: Send + 'static,
    {
        self.submit_deferred(move |core, reply| {
            let _ = reply.send(task(core));
        })
    }

    /// Queue `task` and let it answer through `reply` whenever it is done,
    /// possibly from a later turn of the context loop.
    pub(crate) fn submit_deferred<F, R>(&self, task: F) -> TaskFuture<R>
    where
        F: FnOnce(&mut ContextCore, Reply<R>) + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let task: Task = Box::new(move |core| task(core, result_tx));
        if let Err(err) = self.enqueue(ContextCommand::Run(task)) {
            tracing::debug!(context = %self.id(), error = %err, "async submission rejected");
        }
        TaskFuture::new(self.clone(), result_rx)
    }

    /// Queue a message for the handler registered under `key`.
    ///
    /// Messages without a handler at delivery time are dropped.
    pub fn send_message(
        &self,
        key: RouteKey,
        payload: impl Into<String>,
    ) -> Result<(), ContextError> {
        self.enqueue(ContextCommand::Deliver {
            key,
            payload: payload.into(),
        })
    }

    /// Evaluate classic script source and return its completion value as a string.
    pub fn eval(&self, source: &str) -> Result<String, ContextError> {
        let source = source.to_string();
        self.submit(move |core| core.eval(&source))
    }

    /// Evaluate a classic script file.
    ///
    /// The script is named after its file URL, so `currentScriptPath()` works
    /// inside it.
    pub fn eval_file(&self, path: impl AsRef<Path>) -> Result<String, ContextError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        self.submit(move |core| core.engine().eval_file(&path))
    }

    /// Load and evaluate an ES module file together with its imports.
    ///
    /// Blocks until evaluation finishes, including any top-level `await`.
    pub fn eval_module(&self, path: impl AsRef<Path>) -> Result<(), ContextError> {
        self.eval_module_async(path).wait()
    }

    /// Start evaluating an ES module file without waiting for it.
    pub fn eval_module_async(&self, path: impl AsRef<Path>) -> TaskFuture<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        self.submit_deferred(move |core, reply| {
            core.engine().eval_module(&path, move |result| {
                let _ = reply.send(result);
            })
        })
    }

    /// Schedule `callback` to run once on the context thread after `delay`.
    pub fn set_timeout<F>(
        &self,
        delay: Duration,
        callback: F,
    ) -> Result<TimerHandle, ContextError>
    where
        F: FnOnce(&mut ContextCore) -> Result<(), ContextError> + Send + 'static,
    {
        self.submit(move |core| {
            let mut callback = Some(callback);
            Ok(core.set_timeout(
                delay,
                Box::new(move |core, _| match callback.take() {
                    Some(callback) => callback(core),
                    None => Ok(()),
                }),
            ))
        })
    }

    /// Schedule `callback` to run immediately and then every `period`.
    pub fn set_interval<F>(
        &self,
        period: Duration,
        mut callback: F,
    ) -> Result<TimerHandle, ContextError>
    where
        F: FnMut(&mut ContextCore) -> Result<(), ContextError> + Send + 'static,
    {
        self.submit(move |core| {
            Ok(core.set_interval(period, Box::new(move |core, _| callback(core))))
        })
    }

    pub fn clear_timer(&self, handle: TimerHandle) -> Result<(), ContextError> {
        self.submit(move |core| core.clear_timer(handle))
    }

    /// Register `handler` under `key`, replacing any previous one.
    ///
    /// Returns true if a handler was replaced.
    pub fn register_handler<F>(&self, key: RouteKey, handler: F) -> Result<bool, ContextError>
    where
        F: FnMut(&mut ContextCore, String) -> Result<(), ContextError> + Send + 'static,
    {
        self.submit(move |core| Ok(core.register_handler(key, Box::new(handler))))
    }

    pub fn unregister_handler(&self, key: RouteKey) -> Result<bool, ContextError> {
        self.submit(move |core| Ok(core.unregister_handler(&key)))
    }

    /// Stop the context and join its thread.
    ///
    /// Work already queued still runs, pending timers are cancelled and
    /// workers spawned by this context are terminated. Later submissions
    /// fail with [`ContextError::Terminated`]. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<(), ContextError> {
        if self.is_owner_thread() {
            return Err(ContextError::ReentrantSubmission { context: self.id() });
        }
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (done_tx, done_rx) = mpsc::channel();
        if self
            .inner
            .tx
            .send(ContextCommand::Shutdown { responder: done_tx })
            .is_ok()
        {
            let _ = done_rx.recv();
        }

        let thread = self.lock_thread().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!(context = %self.id(), "context thread panicked");
            }
        }
        tracing::debug!(context = %self.id(), "context stopped");
        Ok(())
    }

    /// Stop the context without waiting for it.
    ///
    /// A running script is interrupted and queued tasks and messages are
    /// discarded; callers waiting on them get [`ContextError::Terminated`].
    /// The thread winds down in the background.
    pub fn terminate(&self) -> Result<(), ContextError> {
        if self.is_owner_thread() {
            return Err(ContextError::ReentrantSubmission { context: self.id() });
        }
        if self.inner.terminating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stopping = self.inner.stopped.swap(true, Ordering::SeqCst);

        if let Some(isolate) = self.inner.isolate.get() {
            isolate.terminate_execution();
        }
        // A context already inside `stop` checks the flag while draining.
        if !stopping {
            let _ = self.inner.tx.send(ContextCommand::Terminate);
        }
        tracing::debug!(context = %self.id(), "context terminating");
        Ok(())
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
