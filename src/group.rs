use crate::error::DispatchError;
use crate::task::{QueuedTask, TaskCallback, TaskContext};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// One per-key queue plus the single worker bound to it for the life of the
/// group. Entries are created lazily on first submission and never removed,
/// even once the worker has stopped.
struct KeyWorker {
  queue_tx: mpsc::Sender<QueuedTask>,
  join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for a [`DispatchGroup`]. Options are applied in order; setting the
/// same option twice keeps the later value. Construction cannot fail.
pub struct DispatchGroupBuilder {
  name: String,
  max_queue_depth: usize,
  task_timeout: Option<Duration>,
  tokio_handle: Option<TokioHandle>,
}

impl DispatchGroupBuilder {
  /// Label used in log output and tracing spans for this group.
  pub fn name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Capacity applied to every per-key queue. The default of 0 keeps the
  /// "no buffering" intent: a submission blocks until the key's worker can
  /// take the task, up to the single in-flight slot a Rust channel needs.
  pub fn max_queue_depth(mut self, depth: usize) -> Self {
    self.max_queue_depth = depth;
    self
  }

  /// Deadline applied to every executed task, measured from the start of its
  /// execution. A zero duration disables the timeout (the default). The
  /// timeout is advisory: the task's token is cancelled when it elapses, but
  /// the callback is never forcibly interrupted.
  pub fn task_timeout(mut self, timeout: Duration) -> Self {
    self.task_timeout = if timeout.is_zero() { None } else { Some(timeout) };
    self
  }

  /// Runtime handle workers are spawned on. Defaults to the runtime the
  /// builder's `build` is called within.
  pub fn tokio_handle(mut self, handle: TokioHandle) -> Self {
    self.tokio_handle = Some(handle);
    self
  }

  /// Constructs the group with an empty key mapping and a fresh shutdown
  /// scope.
  ///
  /// # Panics
  /// Panics if no handle was supplied via [`Self::tokio_handle`] and this is
  /// called outside a Tokio runtime.
  pub fn build(self) -> Arc<DispatchGroup> {
    let tokio_handle = self.tokio_handle.unwrap_or_else(TokioHandle::current);
    Arc::new(DispatchGroup {
      group_name: Arc::new(self.name),
      workers: DashMap::new(),
      shutdown_token: CancellationToken::new(),
      max_queue_depth: self.max_queue_depth,
      task_timeout: self.task_timeout,
      tokio_handle,
      next_task_id: AtomicU64::new(0),
    })
  }
}

/// A keyed task dispatcher.
///
/// Tasks submitted under the same key execute strictly one at a time in
/// submission order on that key's dedicated worker; tasks under distinct
/// keys run concurrently with each other. The group spawns one worker per
/// distinct key, lazily, and keeps it for the group's lifetime.
pub struct DispatchGroup {
  group_name: Arc<String>,
  workers: DashMap<String, KeyWorker>,
  shutdown_token: CancellationToken,
  max_queue_depth: usize,
  task_timeout: Option<Duration>,
  tokio_handle: TokioHandle,
  next_task_id: AtomicU64,
}

impl DispatchGroup {
  pub fn builder() -> DispatchGroupBuilder {
    DispatchGroupBuilder {
      name: "dispatch_group".to_string(),
      max_queue_depth: 0,
      task_timeout: None,
      tokio_handle: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.group_name
  }

  /// Number of distinct keys a worker has been started for.
  pub fn key_count(&self) -> usize {
    self.workers.len()
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Enqueues `callback` for execution under `key`, behind every task
  /// already queued for that key. The callback runs under a fresh
  /// cancellation token of its own (bounded by the group's task timeout, if
  /// one is configured).
  ///
  /// Waits while the key's queue is full; returns once the task is queued,
  /// not once it runs.
  ///
  /// # Errors
  /// [`DispatchError::ShuttingDown`] if [`Self::shutdown`] has been called.
  pub async fn submit<F, Fut>(&self, key: impl Into<String>, callback: F) -> Result<(), DispatchError>
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self
      .submit_task(key.into(), TaskContext::Default, box_callback(callback))
      .await
  }

  /// Like [`Self::submit`], but the caller's `context` token seeds the
  /// callback's effective cancellation scope: cancelling `context` cancels
  /// the token the callback observes, while a task-timeout expiry never
  /// cancels `context` itself.
  pub async fn submit_with_context<F, Fut>(
    &self,
    key: impl Into<String>,
    context: CancellationToken,
    callback: F,
  ) -> Result<(), DispatchError>
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self
      .submit_task(key.into(), TaskContext::Provided(context), box_callback(callback))
      .await
  }

  /// Cancels the group's shutdown scope and waits for every worker loop to
  /// exit. Workers finish their current task before stopping; tasks still
  /// queued behind it are abandoned and never run.
  ///
  /// Idempotent: later calls find nothing left to signal or join and return
  /// immediately.
  pub async fn shutdown(&self) -> Result<(), DispatchError> {
    if !self.shutdown_token.is_cancelled() {
      info!(group = %self.group_name, "Initiating group shutdown.");
      self.shutdown_token.cancel();
    } else {
      debug!(group = %self.group_name, "Shutdown already initiated; nothing further to signal.");
    }

    // Take the join handles out from under the map guards first; awaiting
    // while holding a DashMap ref would hold its shard lock across the await.
    let mut pending: Vec<(String, JoinHandle<()>)> = Vec::new();
    for entry in self.workers.iter() {
      let mut guard = entry.value().join_handle.lock().unwrap();
      if let Some(handle) = guard.take() {
        pending.push((entry.key().clone(), handle));
      }
    }

    for (key, handle) in pending {
      if let Err(join_error) = handle.await {
        error!(group = %self.group_name, %key, "Error joining worker loop during shutdown: {:?}", join_error);
      } else {
        trace!(group = %self.group_name, %key, "Worker loop joined.");
      }
    }

    info!(group = %self.group_name, "Group shutdown complete.");
    Ok(())
  }

  async fn submit_task(
    &self,
    key: String,
    context: TaskContext,
    callback: TaskCallback,
  ) -> Result<(), DispatchError> {
    if self.shutdown_token.is_cancelled() {
      warn!(group = %self.group_name, %key, "Submit rejected: group is shut down.");
      return Err(DispatchError::ShuttingDown);
    }

    let task_id = self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed);
    let task = QueuedTask { task_id, callback, context };

    // Atomic check-then-create via the entry API: the shard lock covers only
    // worker creation, never the enqueue, so a full queue on one key cannot
    // stall submissions to any other key.
    let queue_tx = {
      let entry = self
        .workers
        .entry(key.clone())
        .or_insert_with(|| self.start_worker(&key));
      entry.queue_tx.clone()
    };

    debug!(group = %self.group_name, %key, %task_id, "Submitting task to key queue.");

    tokio::select! {
      biased;
      _ = self.shutdown_token.cancelled() => {
        warn!(group = %self.group_name, %key, %task_id, "Submit abandoned: group shut down while waiting for queue capacity.");
        Err(DispatchError::ShuttingDown)
      }
      send_result = queue_tx.send(task) => match send_result {
        Ok(()) => Ok(()),
        Err(_) => {
          // The worker exited and dropped its receiver, which only happens
          // once the group's shutdown scope has fired.
          warn!(group = %self.group_name, %key, %task_id, "Submit rejected: key worker has stopped.");
          Err(DispatchError::ShuttingDown)
        }
      }
    }
  }

  fn start_worker(&self, key: &str) -> KeyWorker {
    let (queue_tx, queue_rx) = mpsc::channel(self.max_queue_depth.max(1));

    info!(group = %self.group_name, %key, "Starting worker for new key.");
    let join_handle = self.tokio_handle.spawn(
      Self::run_worker_loop(
        self.group_name.clone(),
        key.to_string(),
        queue_rx,
        self.shutdown_token.clone(),
        self.task_timeout,
      )
      .instrument(info_span!("key_worker_loop", group = %self.group_name, key = %key)),
    );

    KeyWorker {
      queue_tx,
      join_handle: Mutex::new(Some(join_handle)),
    }
  }

  async fn run_worker_loop(
    group_name: Arc<String>,
    key: String,
    mut queue_rx: mpsc::Receiver<QueuedTask>,
    shutdown_token: CancellationToken,
    task_timeout: Option<Duration>,
  ) {
    info!(group = %group_name, %key, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(group = %group_name, %key, "Shutdown signal received. Worker loop terminating.");
          break;
        }

        next = queue_rx.recv() => match next {
          Some(task) => Self::execute_task(&group_name, &key, task, task_timeout).await,
          None => {
            info!(group = %group_name, %key, "Task queue closed and empty. Worker loop terminating.");
            break;
          }
        }
      }
    }

    let abandoned = queue_rx.len();
    if abandoned > 0 {
      debug!(group = %group_name, %key, abandoned, "Worker stopped with undelivered tasks; they will never run.");
    }
    info!(group = %group_name, %key, "Worker loop stopped.");
  }

  async fn execute_task(group_name: &str, key: &str, task: QueuedTask, task_timeout: Option<Duration>) {
    let task_id = task.task_id;
    let base_token = task.context.resolve();

    // The deadline is armed against a child token so that its expiry can
    // never cancel the caller's own token.
    let (exec_token, deadline_timer) = match task_timeout {
      Some(timeout) => {
        let child = base_token.child_token();
        let timer_token = child.clone();
        let timer = tokio::spawn(async move {
          tokio::time::sleep(timeout).await;
          trace!("Task deadline elapsed; signalling its token.");
          timer_token.cancel();
        });
        (child, Some(timer))
      }
      None => (base_token, None),
    };

    debug!(group = %group_name, %key, %task_id, "Executing task.");

    // The callback runs to completion on this worker before the next task is
    // dequeued; the timeout above is advisory and never aborts it. A panic
    // is caught here so one bad callback cannot take the worker down.
    let callback = task.callback;
    let run_result = AssertUnwindSafe(async move { callback(exec_token).await })
      .catch_unwind()
      .await;

    match run_result {
      Ok(()) => trace!(group = %group_name, %key, %task_id, "Task completed."),
      Err(_panic_payload) => {
        error!(group = %group_name, %key, %task_id, "Task callback panicked; worker continues with the next task.");
      }
    }

    if let Some(timer) = deadline_timer {
      timer.abort();
    }
  }
}

impl Drop for DispatchGroup {
  fn drop(&mut self) {
    // Best-effort implicit shutdown when the caller never called shutdown():
    // signal the workers to stop, but never block in drop waiting for them.
    if !self.shutdown_token.is_cancelled() {
      info!(
        group = %*self.group_name,
        "DispatchGroup dropped without explicit shutdown. Signalling workers to stop."
      );
      self.shutdown_token.cancel();
    } else {
      trace!(group = %*self.group_name, "Drop: shutdown already initiated. No new signals sent.");
    }
  }
}

fn box_callback<F, Fut>(callback: F) -> TaskCallback
where
  F: FnOnce(CancellationToken) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  Box::new(move |token| callback(token).boxed())
}
