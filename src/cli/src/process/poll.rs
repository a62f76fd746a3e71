use crate::{config, service};

pub(crate) struct Process {
  #[allow(dead_code, reason = "process")]
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
    let tick = self.services.acquisition().tick();
    if tick.busy > 0 {
      tracing::debug!("{} devices still busy, {} queued", tick.busy, tick.queued);
    }

    tracing::trace!("Queued {} device cycles", tick.queued);

    Ok(())
  }
}
