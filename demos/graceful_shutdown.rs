use keyed_dispatch::DispatchGroup;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Graceful Shutdown Example ---");

  let group = DispatchGroup::builder()
    .name("shutdown_group")
    .max_queue_depth(4)
    .task_timeout(Duration::from_millis(250))
    .build();

  // A cooperative task: it watches its token and returns promptly once the
  // configured task timeout elapses.
  group
    .submit("resource-a", |token| async move {
      info!("Long task started; waiting on its cancellation token.");
      token.cancelled().await;
      info!("Long task observed its deadline and is returning.");
    })
    .await
    .expect("submit failed");

  // Queued behind the long task; after shutdown fires it will be abandoned
  // if the worker sees the signal first.
  group
    .submit("resource-a", |_token| async {
      info!("Follow-up task ran.");
    })
    .await
    .expect("submit failed");

  tokio::time::sleep(Duration::from_millis(100)).await;
  info!("Initiating shutdown; the in-flight task finishes, queued work is abandoned.");
  group.shutdown().await.expect("group shutdown failed");

  match group.submit("resource-a", |_token| async {}).await {
    Err(e) => info!("Post-shutdown submission rejected as expected: {}", e),
    Ok(()) => info!("Unexpected: submission accepted after shutdown."),
  }

  info!("--- Graceful Shutdown Example End ---");
}
