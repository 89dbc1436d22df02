//! Script engine owned by a context thread.
//!
//! [`ScriptEngine`] wraps one `deno_core::JsRuntime`. It is created on the
//! context thread and never leaves it; `JsRuntime` is `!Send`, and every
//! entry point additionally checks the calling thread against the thread
//! the engine was created on.

use crate::runtime::config::ContextConfig;
use crate::runtime::error::{ContextError, ContextId};
use crate::runtime::ops::jsevent_host;
use crate::runtime::runner::HostState;
use crate::runtime::source_path::{absolute_path, file_url};
use crate::runtime::timers::TimerHandle;
use crate::runtime::worker::WorkerId;
use deno_core::error::CoreError;
use deno_core::{
    v8, FsModuleLoader, JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions,
};
use futures::FutureExt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::rc::Rc;
use std::thread::{self, ThreadId};

const BINDINGS_SOURCE: &str = include_str!("bootstrap.js");
const BINDINGS_NAME: &str = "ext:jsevent/bootstrap.js";
const HOST_CALL_NAME: &str = "ext:jsevent/host_call.js";
const USER_BOOTSTRAP_NAME: &str = "<bootstrap>";
const INLINE_NAME: &str = "<eval>";

/// Rejects engine access from any thread but the one that created it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadGuard {
    context: ContextId,
    owner: ThreadId,
}

impl ThreadGuard {
    pub(crate) fn current(context: ContextId) -> Self {
        Self {
            context,
            owner: thread::current().id(),
        }
    }

    pub(crate) fn check(&self) -> Result<(), ContextError> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(ContextError::ConfinementViolation {
                context: self.context,
            })
        }
    }
}

/// Receives the outcome of an ES module evaluation.
pub type ModuleCallback = Box<dyn FnOnce(Result<(), ContextError>)>;

type Evaluation = Pin<Box<dyn Future<Output = Result<(), CoreError>>>>;

/// A module whose evaluation is waiting on a top-level `await`.
struct PendingModule {
    specifier: ModuleSpecifier,
    evaluation: Evaluation,
    done: ModuleCallback,
}

pub struct ScriptEngine {
    js_runtime: JsRuntime,
    guard: ThreadGuard,
    pending_modules: Vec<PendingModule>,
}

impl ScriptEngine {
    pub(crate) fn new(
        context: ContextId,
        config: &ContextConfig,
        host: Rc<HostState>,
    ) -> Result<Self, ContextError> {
        let create_params = config
            .heap_limits()
            .map(|(initial, max)| v8::CreateParams::default().heap_limits(initial, max));

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![jsevent_host::init()],
            create_params,
            module_loader: Some(Rc::new(FsModuleLoader)),
            ..Default::default()
        });
        js_runtime.op_state().borrow_mut().put(host);

        let mut engine = Self {
            js_runtime,
            guard: ThreadGuard::current(context),
            pending_modules: Vec::new(),
        };

        engine
            .execute(BINDINGS_NAME, BINDINGS_SOURCE.to_string())
            .map_err(|err| ContextError::Init(format!("failed to install bindings: {}", err)))?;

        if config.enable_console {
            engine
                .call_host("installConsole()".to_string())
                .map_err(|err| ContextError::Init(format!("failed to install console: {}", err)))?;
        }

        if let Some(script) = &config.bootstrap_script {
            engine
                .execute(USER_BOOTSTRAP_NAME, script.clone())
                .and_then(|_| engine.settle())
                .map_err(|err| ContextError::Init(format!("bootstrap script failed: {}", err)))?;
        }

        Ok(engine)
    }

    pub fn context_id(&self) -> ContextId {
        self.guard.context
    }

    /// Handle other threads use to interrupt running script.
    pub(crate) fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.js_runtime.v8_isolate().thread_safe_handle()
    }

    /// Evaluate classic script source under `name` and stringify the result.
    ///
    /// Microtasks queued by the script run before this returns.
    pub fn eval(&mut self, name: &str, source: &str) -> Result<String, ContextError> {
        self.guard.check()?;
        // deno_core requires a `'static` script name.
        let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let value = self.execute(name, source.to_string())?;
        self.settle()?;
        self.stringify(value)
    }

    pub fn eval_inline(&mut self, source: &str) -> Result<String, ContextError> {
        self.eval(INLINE_NAME, source)
    }

    /// Evaluate a classic script file, naming it after its `file:` URL.
    pub fn eval_file(&mut self, path: &Path) -> Result<String, ContextError> {
        self.guard.check()?;
        let path = absolute_path(path)?;
        let source = std::fs::read_to_string(&path).map_err(|err| ContextError::Resource {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let url = file_url(&path)?;
        self.eval(url.as_str(), &source)
    }

    /// Load an ES module file with its static imports and start evaluating it.
    ///
    /// `done` runs once evaluation finishes. A module that awaits timers or
    /// messages at top level finishes on a later turn of the context loop.
    pub fn eval_module<F>(&mut self, path: &Path, done: F)
    where
        F: FnOnce(Result<(), ContextError>) + 'static,
    {
        match self.load_module(path) {
            Ok((specifier, evaluation)) => {
                self.pending_modules.push(PendingModule {
                    specifier,
                    evaluation,
                    done: Box::new(done),
                });
                self.poll_modules();
            }
            Err(err) => done(Err(err)),
        }
    }

    fn load_module(&mut self, path: &Path) -> Result<(ModuleSpecifier, Evaluation), ContextError> {
        self.guard.check()?;
        let path = absolute_path(path)?;
        let specifier = file_url(&path)?;

        let module_id =
            futures::executor::block_on(self.js_runtime.load_side_es_module(&specifier))
                .map_err(|err| {
                    ContextError::Script(format!("failed to load module '{}': {}", specifier, err))
                })?;

        let evaluation = Box::pin(self.js_runtime.mod_evaluate(module_id));
        Ok((specifier, evaluation))
    }

    /// Run microtasks and report every module whose evaluation finished.
    pub(crate) fn poll_modules(&mut self) {
        if self.pending_modules.is_empty() {
            return;
        }
        // Never fails while modules are pending.
        let _ = self.settle();

        let mut finished = Vec::new();
        let mut index = 0;
        while index < self.pending_modules.len() {
            let ready = self.pending_modules[index].evaluation.as_mut().now_or_never();
            match ready {
                Some(result) => finished.push((self.pending_modules.remove(index), result)),
                None => index += 1,
            }
        }

        for (module, result) in finished {
            let result = result
                .map_err(|err| {
                    ContextError::Script(format!("module '{}' failed: {}", module.specifier, err))
                })
                .and_then(|()| {
                    // Rejections from the module body surface on the next turn
                    // of the event loop.
                    if self.pending_modules.is_empty() {
                        self.settle()
                    } else {
                        Ok(())
                    }
                });
            (module.done)(result);
        }
    }

    /// Fail every module still waiting on a top-level `await`.
    pub(crate) fn abandon_modules(&mut self) {
        let context = self.context_id();
        for module in self.pending_modules.drain(..) {
            tracing::debug!(
                context = %context,
                module = %module.specifier,
                "module evaluation abandoned"
            );
            (module.done)(Err(ContextError::Terminated { context }));
        }
    }

    pub(crate) fn fire_timer(&mut self, handle: TimerHandle) -> Result<(), ContextError> {
        self.call_host(format!("fireTimer({})", handle.as_u64()))
    }

    pub(crate) fn deliver_to_worker(
        &mut self,
        worker: WorkerId,
        data: &str,
    ) -> Result<(), ContextError> {
        self.call_host(format!(
            "deliverToWorker({}, {})",
            worker.as_u64(),
            js_string(data)?
        ))
    }

    /// Raise an `error` event on the script-side object of `worker`.
    pub(crate) fn worker_error(
        &mut self,
        worker: WorkerId,
        kind: &str,
        message: &str,
    ) -> Result<(), ContextError> {
        self.call_host(format!(
            "deliverWorkerError({}, {}, {})",
            worker.as_u64(),
            js_string(kind)?,
            js_string(message)?
        ))
    }

    pub(crate) fn deliver_to_self(&mut self, data: &str) -> Result<(), ContextError> {
        self.call_host(format!("deliverToSelf({})", js_string(data)?))
    }

    /// Install the worker-only globals (`self`, `postMessage`, `_postMessage`).
    pub(crate) fn setup_worker(&mut self) -> Result<(), ContextError> {
        self.call_host("setupWorker()".to_string())
    }

    fn call_host(&mut self, call: String) -> Result<(), ContextError> {
        self.guard.check()?;
        self.execute(
            HOST_CALL_NAME,
            format!("globalThis.__jsevent.{};", call),
        )?;
        self.settle()
    }

    fn execute(
        &mut self,
        name: &'static str,
        source: String,
    ) -> Result<v8::Global<v8::Value>, ContextError> {
        self.js_runtime
            .execute_script(name, source)
            .map_err(ContextError::script)
    }

    /// Run pending microtasks and op completions to quiescence.
    ///
    /// While a module awaits at top level the event loop would report it as
    /// stalled, so only the microtask queue is drained then.
    fn settle(&mut self) -> Result<(), ContextError> {
        if !self.pending_modules.is_empty() {
            let scope = &mut self.js_runtime.handle_scope();
            scope.perform_microtask_checkpoint();
            return Ok(());
        }
        let poll_options = PollEventLoopOptions::default();
        futures::executor::block_on(self.js_runtime.run_event_loop(poll_options))
            .map_err(ContextError::script)
    }

    fn stringify(&mut self, value: v8::Global<v8::Value>) -> Result<String, ContextError> {
        let scope = &mut self.js_runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        let string = local.to_string(scope).ok_or_else(|| {
            ContextError::Script("failed to convert result to a string".to_string())
        })?;
        Ok(string.to_rust_string_lossy(scope))
    }
}

fn js_string(data: &str) -> Result<String, ContextError> {
    serde_json::to_string(data).map_err(|err| ContextError::Validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_guard_accepts_owner() {
        let guard = ThreadGuard::current(ContextId::next());
        assert!(guard.check().is_ok());
    }

    #[test]
    fn test_thread_guard_rejects_other_threads() {
        let context = ContextId::next();
        let guard = ThreadGuard::current(context);
        let result = std::thread::spawn(move || guard.check()).join().unwrap();
        assert_eq!(
            result,
            Err(ContextError::ConfinementViolation { context })
        );
    }

    #[test]
    fn test_js_string_escapes_payload() {
        assert_eq!(js_string("ping").unwrap(), "\"ping\"");
        assert_eq!(
            js_string("a\"b\n</script>").unwrap(),
            "\"a\\\"b\\n</script>\""
        );
    }
}
