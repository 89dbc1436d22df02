//! Context thread backed by `deno_core::JsRuntime`.
//!
//! Each execution context hosts its engine on a dedicated OS thread with a
//! single-threaded Tokio runtime. Work from other threads arrives as
//! [`ContextCommand`]s and is executed strictly in arrival order. Timer
//! firings are fed into the same queue, so a firing never interleaves with a
//! running task.

use crate::runtime::config::ContextConfig;
use crate::runtime::engine::ScriptEngine;
use crate::runtime::error::{ContextError, ContextId};
use crate::runtime::handle::ExecutionContext;
use crate::runtime::router::{MessageHandler, MessageRouter, RouteKey};
use crate::runtime::task::{Task, TaskFuture};
use crate::runtime::timers::{TimerCallback, TimerHandle, TimerService, TimerState};
use crate::runtime::worker::{self, ParentLink, WorkerHandle, WorkerId, WorkerOptions};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

type InitSignalChannel = (
    StdSender<Result<(), ContextError>>,
    StdReceiver<Result<(), ContextError>>,
);

/// Commands sent to a context thread.
pub(crate) enum ContextCommand {
    Run(Task),
    Deliver { key: RouteKey, payload: String },
    FireTimer(TimerHandle),
    Shutdown { responder: StdSender<()> },
    /// Wakes the loop after [`ExecutionContext::terminate`] set its flag.
    Terminate,
}

pub(crate) fn spawn_context_thread(
    context: ExecutionContext,
    config: ContextConfig,
    rx: mpsc::UnboundedReceiver<ContextCommand>,
) -> Result<JoinHandle<()>, ContextError> {
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let name = format!("{}-{}", config.thread_name_prefix, context.id());

    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            context.bind_owner_thread();
            let id = context.id();

            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(ContextError::Init(format!(
                        "failed to build tokio runtime: {}",
                        err
                    ))));
                    return;
                }
            };

            let core = {
                let _guard = tokio_rt.enter();
                ContextCore::new(context, config)
            };
            let mut core = match core {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    tracing::error!(context = %id, error = %err, "context failed to start");
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tracing::debug!(context = %id, "context thread running");
            tokio_rt.block_on(async move {
                core.run(rx).await;
            });
            tracing::debug!(context = %id, "context thread exiting");
        })
        .map_err(|err| ContextError::Init(format!("failed to spawn context thread: {}", err)))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(thread),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => Err(ContextError::Init(
            "context thread exited during initialization".to_string(),
        )),
    }
}

/// Host state shared between the context loop and the ops running inside
/// the engine. Only ever touched on the context thread.
pub(crate) struct HostState {
    pub(crate) context: ExecutionContext,
    pub(crate) config: ContextConfig,
    pub(crate) timers: RefCell<TimerService>,
    pub(crate) router: RefCell<MessageRouter>,
    pub(crate) workers: RefCell<HashMap<WorkerId, WorkerHandle>>,
    pub(crate) parent: RefCell<Option<ParentLink>>,
}

/// Everything that lives on a context thread.
///
/// Tasks, timer callbacks and message handlers receive `&mut ContextCore`,
/// which is the only way to reach the engine.
pub struct ContextCore {
    host: Rc<HostState>,
    engine: ScriptEngine,
}

impl ContextCore {
    fn new(context: ExecutionContext, config: ContextConfig) -> Result<Self, ContextError> {
        let id = context.id();
        let host = Rc::new(HostState {
            context,
            config,
            timers: RefCell::new(TimerService::new()),
            router: RefCell::new(MessageRouter::new(id)),
            workers: RefCell::new(HashMap::new()),
            parent: RefCell::new(None),
        });
        let mut engine = ScriptEngine::new(id, &host.config, host.clone())?;
        host.context.bind_isolate(engine.isolate_handle());
        Ok(Self { host, engine })
    }

    /// Handle to the context this core belongs to.
    pub fn context(&self) -> &ExecutionContext {
        &self.host.context
    }

    pub fn id(&self) -> ContextId {
        self.host.context.id()
    }

    pub fn engine(&mut self) -> &mut ScriptEngine {
        &mut self.engine
    }

    pub fn eval(&mut self, source: &str) -> Result<String, ContextError> {
        self.engine.eval_inline(source)
    }

    pub fn set_timeout(&mut self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.host
            .timers
            .borrow_mut()
            .set_timeout(Instant::now(), delay, callback)
    }

    pub fn set_interval(&mut self, period: Duration, callback: TimerCallback) -> TimerHandle {
        self.host
            .timers
            .borrow_mut()
            .set_interval(Instant::now(), period, callback)
    }

    pub fn clear_timer(&mut self, handle: TimerHandle) -> Result<(), ContextError> {
        self.host.timers.borrow_mut().clear(handle)
    }

    pub fn timer_state(&self, handle: TimerHandle) -> Option<TimerState> {
        self.host.timers.borrow().state(handle)
    }

    pub fn register_handler(&mut self, key: RouteKey, handler: MessageHandler) -> bool {
        self.host.router.borrow_mut().register(key, handler)
    }

    pub fn unregister_handler(&mut self, key: &RouteKey) -> bool {
        self.host.router.borrow_mut().unregister(key)
    }

    /// Spawn a worker running the script at `location`.
    ///
    /// `on_message` receives everything the worker posts back. The returned
    /// future resolves once the worker script has been evaluated.
    pub fn spawn_worker(
        &mut self,
        location: &str,
        options: WorkerOptions,
        on_message: MessageHandler,
    ) -> Result<(WorkerHandle, TaskFuture<()>), ContextError> {
        worker::spawn_worker(&self.host, WorkerId::next(), location, options, on_message)
    }

    pub fn worker(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.host.workers.borrow().get(&id).cloned()
    }

    /// Ids of the live workers spawned by this context.
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.host.workers.borrow().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop a worker spawned by this context and drop its route.
    pub fn terminate_worker(&mut self, id: WorkerId) -> Result<(), ContextError> {
        worker::terminate_worker(&self.host, id)
    }

    /// Link back to the spawning context, if this context is a worker.
    pub fn parent(&self) -> Option<ParentLink> {
        self.host.parent.borrow().clone()
    }

    pub(crate) fn set_parent(&mut self, link: ParentLink) {
        *self.host.parent.borrow_mut() = Some(link);
    }

    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<ContextCommand>) {
        loop {
            if self.host.context.is_terminating() {
                self.discard(&mut rx);
                break;
            }
            self.enqueue_due_timers();
            let deadline = self.host.timers.borrow_mut().next_deadline();

            let command = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = rx.recv() => command,
                        _ = tokio::time::sleep_until(deadline.into()) => continue,
                    }
                }
                None => rx.recv().await,
            };

            let Some(command) = command else {
                break;
            };
            if self.host.context.is_terminating() {
                continue;
            }

            match command {
                ContextCommand::Run(task) => task(self),
                ContextCommand::Deliver { key, payload } => self.deliver(key, payload),
                ContextCommand::FireTimer(handle) => self.fire_timer(handle),
                ContextCommand::Shutdown { responder } => {
                    self.shutdown(&mut rx);
                    let _ = responder.send(());
                    break;
                }
                ContextCommand::Terminate => continue,
            }
            self.engine.poll_modules();
        }
    }

    fn enqueue_due_timers(&mut self) {
        let due = self.host.timers.borrow_mut().take_due(Instant::now());
        for handle in due {
            if self
                .host
                .context
                .enqueue(ContextCommand::FireTimer(handle))
                .is_err()
            {
                break;
            }
        }
    }

    fn fire_timer(&mut self, handle: TimerHandle) {
        let callback = self.host.timers.borrow_mut().begin_fire(handle);
        let Some(mut callback) = callback else {
            return;
        };

        if let Err(err) = callback(self, handle) {
            tracing::warn!(
                context = %self.id(),
                timer = %handle,
                error = %err,
                "timer callback failed"
            );
        }
        self.host.timers.borrow_mut().finish_fire(handle, callback);
    }

    fn deliver(&mut self, key: RouteKey, payload: String) {
        let handler = self.host.router.borrow_mut().take(&key);
        let Some(mut handler) = handler else {
            tracing::debug!(
                context = %self.id(),
                route = %key,
                "no handler registered, message dropped"
            );
            return;
        };

        if let Err(err) = handler(self, payload) {
            tracing::warn!(
                context = %self.id(),
                route = %key,
                error = %err,
                "message handler failed"
            );
        }
        self.host.router.borrow_mut().restore(key, handler);
    }

    fn shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<ContextCommand>) {
        let mut cancelled = self.host.timers.borrow_mut().cancel_all();

        rx.close();
        let mut drained = 0usize;
        while !self.host.context.is_terminating() {
            let Ok(command) = rx.try_recv() else {
                break;
            };
            match command {
                ContextCommand::Run(task) => {
                    task(self);
                    drained += 1;
                }
                ContextCommand::Deliver { key, payload } => {
                    self.deliver(key, payload);
                    drained += 1;
                }
                ContextCommand::FireTimer(_) | ContextCommand::Terminate => {}
                ContextCommand::Shutdown { responder } => {
                    let _ = responder.send(());
                }
            }
            self.engine.poll_modules();
        }
        cancelled += self.host.timers.borrow_mut().cancel_all();
        self.engine.abandon_modules();
        let workers = self.terminate_workers();

        tracing::debug!(
            context = %self.id(),
            cancelled,
            drained,
            workers,
            "context drained"
        );
    }

    /// Shut down after [`ExecutionContext::terminate`]: nothing queued runs.
    fn discard(&mut self, rx: &mut mpsc::UnboundedReceiver<ContextCommand>) {
        let cancelled = self.host.timers.borrow_mut().cancel_all();

        rx.close();
        let mut discarded = 0usize;
        while let Ok(command) = rx.try_recv() {
            if !matches!(command, ContextCommand::Terminate) {
                discarded += 1;
            }
        }
        self.engine.abandon_modules();
        let workers = self.terminate_workers();

        tracing::debug!(
            context = %self.id(),
            cancelled,
            discarded,
            workers,
            "context terminated"
        );
    }

    fn terminate_workers(&mut self) -> usize {
        let workers: Vec<WorkerHandle> = self
            .host
            .workers
            .borrow_mut()
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        for worker in &workers {
            self.host
                .router
                .borrow_mut()
                .unregister(&RouteKey::Worker(worker.id()));
            if let Err(err) = worker.terminate() {
                tracing::warn!(
                    context = %self.id(),
                    worker = %worker.id(),
                    error = %err,
                    "failed to stop worker"
                );
            }
        }

        workers.len()
    }
}
