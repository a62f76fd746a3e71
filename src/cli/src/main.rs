#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]

mod config;
mod process;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::Manager::new().await?;

  let log_level = config.values().await.log_level;
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy(),
    )
    .init();

  // NOTE: reloaded so device validation is logged by the subscriber
  let services_config = config.reload().await;

  let services = service::Container::new(services_config);
  services.store().migrate().await?;
  tracing::info!(
    "Monitoring {} devices",
    services.registry().enabled().count()
  );

  let processes = process::Container::new(config, services.clone());

  processes.spawn().await;
  tokio::signal::ctrl_c().await?;
  processes.cancel().await;
  services.terminate().await;

  Ok(())
}
