use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The boxed form a submitted callback is stored in while queued.
///
/// The token it receives is the task's effective cancellation scope for this
/// one execution: the caller's token (or a fresh one), possibly bounded by
/// the group's configured task timeout.
pub(crate) type TaskCallback = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send + 'static>;

/// The cancellation scope a task was submitted with.
pub(crate) enum TaskContext {
  /// Caller supplied a token via `submit_with_context`.
  Provided(CancellationToken),
  /// No token supplied; the task runs under a fresh token of its own.
  Default,
}

impl TaskContext {
  /// Resolves to the concrete base token for one execution.
  pub(crate) fn resolve(self) -> CancellationToken {
    match self {
      TaskContext::Provided(token) => token,
      TaskContext::Default => CancellationToken::new(),
    }
  }
}

/// Internal representation of one queued unit of work. Owned exclusively by
/// its key's queue entry and consumed exactly once by that key's worker.
pub(crate) struct QueuedTask {
  pub(crate) task_id: u64,
  pub(crate) callback: TaskCallback,
  pub(crate) context: TaskContext,
}
