mod poll;
mod prune;
mod snapshot;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{config, service};

pub(crate) trait Process {
  fn process_name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }
}

#[async_trait::async_trait]
pub(crate) trait Recurring: Process {
  async fn execute(&self) -> anyhow::Result<()>;
}

pub(crate) struct Container {
  config: config::Manager,
  services: service::Container,
  handles: Arc<Mutex<Option<Vec<Handle>>>>,
}

impl Container {
  pub(crate) fn new(
    config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self {
      config,
      services,
      handles: Arc::new(Mutex::new(None)),
    }
  }

  pub(crate) async fn cancel(&self) {
    {
      let mut handles = self.handles.clone().lock_owned().await;
      if let Some(handles) = &mut *handles {
        for handle in handles.iter() {
          handle.token.cancel();
        }

        for handle in handles.drain(0..) {
          if let Err(error) = handle.join.await {
            tracing::error! {
              %error,
              "Joining process handle on cancel failed"
            }
          }
        }
      }
      *handles = None;
    }
  }
}

macro_rules! make_recurring_spec {
  ($self: ident, $type: ty, $trigger: expr) => {
    RecurringSpec {
      process: Box::new(<$type>::new(
        $self.config.clone(),
        $self.services.clone(),
      )),
      trigger: $trigger,
    }
  };
}

impl Container {
  pub(crate) async fn spawn(&self) {
    let config = self.config.values().await;
    let mut specs = vec![
      make_recurring_spec!(
        self,
        poll::Process,
        Trigger::Interval(config.poll_interval)
      ),
      make_recurring_spec!(
        self,
        prune::Process,
        Trigger::Cron(config.prune_schedule.clone(), config.timezone)
      ),
    ];
    if config.snapshot_file.is_some() {
      specs.push(make_recurring_spec!(
        self,
        snapshot::Process,
        Trigger::Interval(config.snapshot_interval)
      ));
    }

    {
      let mut handles = self.handles.clone().lock_owned().await;
      *handles = Some(specs.into_iter().map(Handle::recurring).collect());
    }
  }
}

struct Handle {
  token: tokio_util::sync::CancellationToken,
  join: tokio::task::JoinHandle<()>,
}

enum Trigger {
  Interval(chrono::Duration),
  Cron(cron::Schedule, chrono_tz::Tz),
}

impl Trigger {
  /// Time left until the next run, `None` when the schedule is exhausted.
  fn delay(&self) -> Option<std::time::Duration> {
    match self {
      Trigger::Interval(interval) => Some(std::time::Duration::from_millis(
        interval.num_milliseconds().max(1) as u64,
      )),
      Trigger::Cron(schedule, timezone) => {
        let now = Utc::now().with_timezone(timezone);
        let next = schedule.after(&now).next()?;
        (next - now).to_std().ok()
      }
    }
  }
}

struct RecurringSpec {
  process: Box<dyn Recurring + Sync + Send>,
  trigger: Trigger,
}

impl Handle {
  fn recurring(spec: RecurringSpec) -> Self {
    let token = tokio_util::sync::CancellationToken::new();
    let child_token = token.child_token();
    let join = tokio::spawn(async move {
      if let Trigger::Interval(_) = spec.trigger {
        spec.execute().await;
      }
      loop {
        let delay = match spec.trigger.delay() {
          Some(delay) => delay,
          None => {
            tracing::warn!(
              "Schedule of {} has no upcoming runs",
              spec.process.process_name()
            );
            return;
          }
        };
        tokio::select! {
            _ = child_token.cancelled() => { return; },
            _ = tokio::time::sleep(delay) => {
              spec.execute().await;
            }
        }
      }
    });
    Self { token, join }
  }
}

impl RecurringSpec {
  async fn execute(&self) {
    if let Err(error) = self.process.execute().await {
      tracing::error!(
        "Process execution failed {} for {}",
        error,
        self.process.process_name()
      );
    }
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
  use std::str::FromStr;

  use super::*;

  #[test]
  fn interval_delay_is_the_interval() {
    let trigger = Trigger::Interval(chrono::Duration::milliseconds(3000));

    assert_eq!(
      trigger.delay(),
      Some(std::time::Duration::from_millis(3000))
    );
  }

  #[test]
  fn hourly_cron_fires_within_an_hour() {
    let trigger = Trigger::Cron(
      cron::Schedule::from_str("0 0 * * * * *").unwrap(),
      chrono_tz::US::Eastern,
    );

    let delay = trigger.delay().unwrap();
    assert!(delay <= std::time::Duration::from_secs(3600));
  }
}
