//! Units of work queued onto a context thread.

use crate::runtime::error::{ContextError, ContextId};
use crate::runtime::handle::ExecutionContext;
use crate::runtime::runner::ContextCore;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Type-erased closure executed on the owning thread of a context.
pub(crate) type Task = Box<dyn FnOnce(&mut ContextCore) + Send>;

/// Sending half of a [`TaskFuture`].
pub(crate) type Reply<R> = oneshot::Sender<Result<R, ContextError>>;

/// Result slot of a task queued with [`ExecutionContext::submit_async`].
///
/// Resolves once the task has run on the context thread. Resolves to
/// [`ContextError::Terminated`] if the context stopped before running it.
#[must_use = "dropping a TaskFuture discards the task's result"]
pub struct TaskFuture<R> {
    context: ExecutionContext,
    rx: oneshot::Receiver<Result<R, ContextError>>,
}

impl<R> TaskFuture<R> {
    pub(crate) fn new(
        context: ExecutionContext,
        rx: oneshot::Receiver<Result<R, ContextError>>,
    ) -> Self {
        Self { context, rx }
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    /// Block the calling thread until the task completes.
    ///
    /// Blocking on a task from the thread that has to run it can never
    /// finish, so that case returns [`ContextError::ReentrantSubmission`].
    pub fn wait(self) -> Result<R, ContextError> {
        if self.context.is_owner_thread() {
            return Err(ContextError::ReentrantSubmission {
                context: self.context.id(),
            });
        }
        futures::executor::block_on(self)
    }
}

impl<R> Future for TaskFuture<R> {
    type Output = Result<R, ContextError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let context = this.context.id();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ContextError::Terminated { context })))
    }
}
