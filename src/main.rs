use task_pools::{Harness, HarnessConfig, PoolError};
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), PoolError> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .init();

  let harness = Harness::new(HarnessConfig::default(), Handle::current());
  let report = harness.run().await?;

  // Task failures stay inside their handles; they never change the exit code.
  info!(?report, "All pools shut down and terminated.");
  Ok(())
}
