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
    let config = self.config.values().await;
    let Some(path) = config.snapshot_file else {
      return Ok(());
    };

    let snapshots = self.services.pool().get_snapshot(None).await?;
    let json = serde_json::to_string_pretty(&snapshots)?;

    // NOTE: write then rename so readers never see a partial file
    let temporary = format!("{path}.tmp");
    tokio::fs::write(&temporary, json).await?;
    tokio::fs::rename(&temporary, &path).await?;

    tracing::trace!("Wrote {} snapshots to {}", snapshots.len(), path);

    Ok(())
  }
}
