//! Worker contexts spawned from a parent context.
//!
//! A worker is a brand-new [`ExecutionContext`] running one script. The
//! parent reaches it through a [`WorkerHandle`] (delivering to the worker's
//! `RouteKey::SelfKey` route) and the worker answers through its
//! [`ParentLink`] (delivering to the parent's `RouteKey::Worker(id)` route).

use crate::runtime::error::ContextError;
use crate::runtime::handle::ExecutionContext;
use crate::runtime::router::{MessageHandler, RouteKey};
use crate::runtime::runner::{ContextCore, HostState};
use crate::runtime::source_path::path_from_location;
use crate::runtime::task::{Reply, TaskFuture};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a spawned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// How the worker script is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptKind {
    #[default]
    Classic,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerOptions {
    pub kind: ScriptKind,
}

impl WorkerOptions {
    pub fn classic() -> Self {
        Self {
            kind: ScriptKind::Classic,
        }
    }

    pub fn module() -> Self {
        Self {
            kind: ScriptKind::Module,
        }
    }

    /// Options for a script-side `{type}` value: `"module"` selects module
    /// evaluation, anything else classic.
    pub fn from_type(ty: Option<&str>) -> Self {
        match ty {
            Some("module") => Self::module(),
            _ => Self::classic(),
        }
    }
}

/// Resolve a worker location to an existing regular file.
pub fn resolve_script_location(location: &str) -> Result<PathBuf, ContextError> {
    let path = path_from_location(location)?;
    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ContextError::Resource {
                path,
                reason: "file does not exist".to_string(),
            })
        }
        Err(err) => {
            return Err(ContextError::Resource {
                path,
                reason: err.to_string(),
            })
        }
    };

    if metadata.is_dir() {
        return Err(ContextError::Resource {
            path,
            reason: "path is a directory".to_string(),
        });
    }
    if !metadata.is_file() {
        return Err(ContextError::Resource {
            path,
            reason: "not a regular file".to_string(),
        });
    }
    Ok(path)
}

/// A worker's way back to the context that spawned it.
#[derive(Debug, Clone)]
pub struct ParentLink {
    parent: ExecutionContext,
    worker: WorkerId,
}

impl ParentLink {
    pub fn parent(&self) -> &ExecutionContext {
        &self.parent
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Deliver `data` to the parent's handler for this worker.
    pub fn post(&self, data: impl Into<String>) -> Result<(), ContextError> {
        self.parent
            .send_message(RouteKey::Worker(self.worker), data)
    }

    /// Raise `err` as an `error` event on the parent's script-side worker.
    pub(crate) fn report_error(&self, err: &ContextError) {
        let worker = self.worker;
        let kind = err.kind();
        let message = err.to_string();
        let _ = self
            .parent
            .submit_async(move |core| core.engine().worker_error(worker, kind, &message));
    }
}

/// The parent's view of a spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    context: ExecutionContext,
    script: PathBuf,
    kind: ScriptKind,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Deliver `data` to the worker's own inbox.
    pub fn post_message(&self, data: impl Into<String>) -> Result<(), ContextError> {
        self.context.send_message(RouteKey::SelfKey, data)
    }

    /// Interrupt the worker and discard whatever it has queued.
    ///
    /// Returns without waiting for the worker thread.
    pub fn terminate(&self) -> Result<(), ContextError> {
        self.context.terminate()
    }
}

/// Create the worker context, wire both routes and queue the script start.
///
/// Location errors are reported before any thread is created. Script errors
/// surface through the returned future and as an `error` event on the
/// parent's script-side worker object.
pub(crate) fn spawn_worker(
    host: &Rc<HostState>,
    id: WorkerId,
    location: &str,
    options: WorkerOptions,
    on_message: MessageHandler,
) -> Result<(WorkerHandle, TaskFuture<()>), ContextError> {
    let script = resolve_script_location(location)?;
    let context = ExecutionContext::create(host.config.clone())?;

    host.router
        .borrow_mut()
        .register(RouteKey::Worker(id), on_message);

    let handle = WorkerHandle {
        id,
        context: context.clone(),
        script: script.clone(),
        kind: options.kind,
    };
    host.workers.borrow_mut().insert(id, handle.clone());

    let link = ParentLink {
        parent: host.context.clone(),
        worker: id,
    };
    let kind = options.kind;
    let started =
        context.submit_deferred(move |core, reply| start_worker(core, link, script, kind, reply));

    tracing::debug!(
        parent = %host.context.id(),
        worker = %id,
        context = %context.id(),
        "worker spawned"
    );
    Ok((handle, started))
}

fn start_worker(
    core: &mut ContextCore,
    link: ParentLink,
    script: PathBuf,
    kind: ScriptKind,
    reply: Reply<()>,
) {
    let context = core.context().clone();
    let path = script.clone();
    let parent = link.clone();
    let report = move |result: Result<(), ContextError>| {
        if let Err(err) = &result {
            if context.is_terminating() {
                tracing::debug!(
                    context = %context.id(),
                    worker = %parent.worker(),
                    "worker start interrupted"
                );
            } else {
                tracing::error!(
                    context = %context.id(),
                    worker = %parent.worker(),
                    script = %path.display(),
                    error = %err,
                    "worker failed to start"
                );
                parent.report_error(err);
            }
        }
        let _ = reply.send(result);
    };

    core.set_parent(link);
    if let Err(err) = core.engine().setup_worker() {
        return report(Err(err));
    }
    core.register_handler(
        RouteKey::SelfKey,
        Box::new(|core, data| core.engine().deliver_to_self(&data)),
    );

    match kind {
        ScriptKind::Classic => report(core.engine().eval_file(&script).map(|_| ())),
        ScriptKind::Module => core.engine().eval_module(&script, report),
    }
}

/// Remove a worker from its parent and terminate it without waiting.
pub(crate) fn terminate_worker(host: &HostState, id: WorkerId) -> Result<(), ContextError> {
    let worker = host
        .workers
        .borrow_mut()
        .remove(&id)
        .ok_or_else(|| ContextError::validation(format!("unknown worker {}", id)))?;
    host.router.borrow_mut().unregister(&RouteKey::Worker(id));
    worker.terminate()?;
    tracing::debug!(parent = %host.context.id(), worker = %id, "worker terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_worker_ids_are_unique() {
        let a = WorkerId::next();
        let b = WorkerId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("worker-{}", a.as_u64()));
        assert_eq!(WorkerId::from_raw(a.as_u64()), a);
    }

    #[test]
    fn test_options_from_type() {
        assert_eq!(WorkerOptions::from_type(Some("module")).kind, ScriptKind::Module);
        assert_eq!(WorkerOptions::from_type(Some("classic")).kind, ScriptKind::Classic);
        assert_eq!(WorkerOptions::from_type(None), WorkerOptions::default());
    }

    #[test]
    fn test_resolve_existing_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("worker.js");
        std::fs::write(&file, "postMessage('hi');").unwrap();

        let resolved = resolve_script_location(file.to_str().unwrap()).unwrap();
        assert_eq!(resolved, file);
    }

    #[test]
    fn test_resolve_sibling_of_module_url() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.js");
        let worker = dir.path().join("worker.js");
        std::fs::write(&worker, "").unwrap();

        let url = deno_core::ModuleSpecifier::from_file_path(&main).unwrap();
        let location = format!("{}/../worker.js", url);
        assert_eq!(resolve_script_location(&location).unwrap(), worker);
    }

    #[test]
    fn test_resolve_missing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.js");

        match resolve_script_location(missing.to_str().unwrap()) {
            Err(ContextError::Resource { path, reason }) => {
                assert_eq!(path, missing);
                assert!(reason.contains("does not exist"));
            }
            other => panic!("expected resource error, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_directory() {
        let dir = TempDir::new().unwrap();
        let err = resolve_script_location(dir.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.kind(), "resource");
        assert!(err.to_string().contains("directory"));
    }
}
