use crate::service::db;
use crate::service::shift::Clock;
use crate::{config, service};

pub(crate) struct Process {
  config: config::Manager,
  services: service::Container,
}

impl Process {
  pub(crate) fn new(
    config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self { config, services }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    let config = self.config.reload().await;
    let now = self.services.clock().now();

    let report = db::prune(
      self.services.store().as_ref(),
      now,
      config.history_retention,
      config.production_retention,
    )
    .await?;
    tracing::info!(
      "Pruned {} register and {} connection rows",
      report.history.registers,
      report.history.connections
    );
    if let Some(pruned) = report.production {
      tracing::info!("Pruned {} production rows", pruned);
    }

    Ok(())
  }
}
