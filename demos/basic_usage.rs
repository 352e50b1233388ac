use keyed_dispatch::DispatchGroup;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let group = DispatchGroup::builder()
    .name("basic_group")
    .max_queue_depth(10)
    .build();

  // Tasks under one key run strictly in submission order; "user-1" and
  // "user-2" make progress independently of each other.
  for key in ["user-1", "user-2"] {
    for i in 0..3 {
      let delay_ms = 100 + i as u64 * 50;
      group
        .submit(key, move |_token| async move {
          info!("Task {} starting, will sleep for {}ms", i, delay_ms);
          tokio::time::sleep(Duration::from_millis(delay_ms)).await;
          info!("Task {} finished after {}ms", i, delay_ms);
        })
        .await
        .expect("submit failed");
      info!("Submitted task {} under key {}", i, key);
    }
  }

  info!("All tasks submitted. Shutting down once workers drain their current task.");
  tokio::time::sleep(Duration::from_millis(600)).await;
  group.shutdown().await.expect("group shutdown failed");
  info!("Group shutdown complete.");
  info!("--- Basic Usage Example End ---");
}
