mod args;
mod env;
mod file;

use std::sync::Arc;

use rust_decimal_macros::dec;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::service::acquisition::Layout;
use crate::service::connection::Params;
use crate::service::registry::Registry;
use crate::service::shift::{CalendarLayout, ProductionLayout};

#[derive(Debug, Clone)]
pub(crate) struct Db {
  pub(crate) timeout: chrono::Duration,
  pub(crate) ssl: bool,
  pub(crate) domain: String,
  pub(crate) port: Option<u16>,
  pub(crate) user: String,
  pub(crate) password: Option<String>,
  pub(crate) name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) log_level: tracing::level_filters::LevelFilter,
  pub(crate) poll_interval: chrono::Duration,
  pub(crate) params: Params,
  pub(crate) termination_timeout: chrono::Duration,
  pub(crate) history_retention: chrono::Duration,
  pub(crate) production_retention: Option<chrono::Duration>,
  pub(crate) prune_schedule: cron::Schedule,
  pub(crate) timezone: chrono_tz::Tz,
  pub(crate) snapshot_file: Option<String>,
  pub(crate) snapshot_interval: chrono::Duration,
  pub(crate) push_capacity: usize,
  pub(crate) history_queue_capacity: usize,
  pub(crate) layout: Layout,
  pub(crate) registry: Registry,
  pub(crate) db: Option<Db>,
}

#[derive(Debug, Clone)]
struct Unparsed {
  from_args: args::Values,
  from_env: env::Values,
  from_file: file::Values,
}

#[derive(Debug)]
struct Parsed {
  unparsed: Unparsed,
  values: Values,
}

#[derive(Debug, Clone)]
pub(crate) struct Manager {
  lock: Arc<Mutex<Parsed>>,
}

#[derive(Debug, Error)]
pub(crate) enum ReadError {
  #[error("Failed reading file")]
  FileReadError(#[from] file::ParseError),

  #[error("Failed reading env")]
  EnvReadError(#[from] env::ParseError),
}

impl Manager {
  pub(crate) async fn new() -> Result<Self, ReadError> {
    let config = Self::read_async().await?;

    Ok(Self::with(config))
  }

  fn with(config: Unparsed) -> Self {
    let values = Self::parse(config.clone());

    Self {
      lock: Arc::new(Mutex::new(Parsed {
        unparsed: config,
        values,
      })),
    }
  }

  /// Values parsed on construction or on the last reload.
  pub(crate) async fn values(&self) -> Values {
    self.lock.lock().await.values.clone()
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn reload(&self) -> Values {
    let mut parsed = self.lock.lock().await;
    let from_file =
      file::parse_async(parsed.unparsed.from_args.config.as_deref()).await;
    match from_file {
      Ok(from_file) => parsed.unparsed.from_file = from_file,
      Err(error) => {
        tracing::error!("Failed parsing config file {}", error)
      }
    }
    parsed.values = Self::parse(parsed.unparsed.clone());

    parsed.values.clone()
  }

  fn parse(config: Unparsed) -> Values {
    let from_file = config.from_file;

    let hourly_target = from_file.production.hourly_target.unwrap_or(60);
    let cycle_time = from_file.production.cycle_time.unwrap_or(dec!(60));
    let devices = from_file.devices.unwrap_or_else(file::default_devices);
    let registry = Registry::new(devices.into_iter().filter_map(
      |(id, device)| {
        match file::to_device(id.clone(), device, hourly_target, cycle_time) {
          Ok(device) => Some(device),
          Err(error) => {
            tracing::error!("Skipping device {} {}", id, error);
            None
          }
        }
      },
    ));

    let calendar = &from_file.production.calendar;
    let blocks = &from_file.production.blocks;
    let layout = Layout {
      calendar: CalendarLayout {
        day_month: file::to_address(&calendar.day_month, 700),
        day_date: file::to_address(&calendar.day_date, 710),
        previous_month: file::to_address(&calendar.previous_month, 701),
        previous_date: file::to_address(&calendar.previous_date, 711),
      },
      production: ProductionLayout {
        current: file::to_address(&blocks.current, 800),
        previous: file::to_address(&blocks.previous, 850),
      },
    };

    Values {
      log_level: from_file.log_level.map_or_else(
        || {
          if config.from_args.trace {
            tracing::level_filters::LevelFilter::TRACE
          } else {
            #[cfg(debug_assertions)]
            {
              tracing::level_filters::LevelFilter::DEBUG
            }
            #[cfg(not(debug_assertions))]
            {
              tracing::level_filters::LevelFilter::INFO
            }
          }
        },
        |log_level| match log_level {
          file::LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
          file::LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
          file::LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
          file::LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
          file::LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
        },
      ),
      poll_interval: file::seconds_to_chrono(
        from_file.poll_interval.unwrap_or(3),
      ),
      params: Params::new(
        file::seconds_to_chrono(from_file.connection_timeout.unwrap_or(10)),
        file::seconds_to_chrono(from_file.retry_delay.unwrap_or(5)),
        from_file.max_retries.unwrap_or(3),
      ),
      termination_timeout: file::seconds_to_chrono(
        from_file.termination_timeout.unwrap_or(10),
      ),
      history_retention: chrono::Duration::hours(
        from_file.history_retention_hours.unwrap_or(24) as i64,
      ),
      production_retention: from_file
        .production_retention_days
        .map(|days| chrono::Duration::days(days as i64)),
      prune_schedule: file::string_to_cron(
        &from_file.schedule.prune,
        // NOTE: sec | min | hour | day of month | month | day of week | year
        "0 0 * * * * *",
      ),
      timezone: from_file
        .schedule
        .timezone
        .unwrap_or(chrono_tz::US::Eastern),
      snapshot_file: from_file.snapshot_file,
      snapshot_interval: file::seconds_to_chrono(
        from_file.snapshot_interval.unwrap_or(3),
      ),
      push_capacity: from_file.push_capacity.unwrap_or(64),
      history_queue_capacity: from_file.history_queue_capacity.unwrap_or(256),
      layout,
      registry,
      db: config.from_env.db.map(|db| Db {
        timeout: file::seconds_to_chrono(from_file.db.timeout.unwrap_or(30)),
        ssl: db.ssl,
        domain: db.domain,
        port: db.port.and_then(|port| port.parse::<u16>().ok()),
        user: db.user,
        password: db.password,
        name: db.name,
      }),
    }
  }

  async fn read_async() -> Result<Unparsed, ReadError> {
    let from_args = args::parse();
    let from_env = env::parse()?;
    let from_file = file::parse_async(from_args.config.as_deref()).await?;

    Ok(Unparsed {
      from_args,
      from_env,
      from_file,
    })
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
  use super::*;

  fn unparsed(raw: &str) -> Unparsed {
    Unparsed {
      from_args: args::Values {
        config: None,
        trace: false,
      },
      from_env: env::Values { db: None },
      from_file: file::parse_str(raw, Some("yaml")).unwrap(),
    }
  }

  #[test]
  fn empty_file_yields_defaults() {
    let values = Manager::parse(unparsed("{}"));

    assert_eq!(values.poll_interval, chrono::Duration::seconds(3));
    assert_eq!(values.history_retention, chrono::Duration::hours(24));
    assert_eq!(values.production_retention, None);
    assert_eq!(values.timezone, chrono_tz::US::Eastern);
    assert_eq!(values.layout.production.current.index(), 800);
    assert_eq!(values.layout.calendar.previous_date.index(), 711);
    assert!(values.db.is_none());

    let ids = values
      .registry
      .all()
      .map(|device| device.id.clone())
      .collect::<Vec<_>>();
    assert_eq!(ids, vec!["1A".to_owned(), "1B".to_owned()]);
    assert!(values
      .registry
      .all()
      .all(|device| device.hourly_target == 60));
  }

  #[test]
  fn invalid_device_is_skipped() {
    let values = Manager::parse(unparsed(
      r#"
production:
  hourly_target: 30
devices:
  2A:
    address: 10.0.0.8
    ranges:
      - start: D800
        count: 24
  2B:
    address: 10.0.0.9
    ranges: []
"#,
    ));

    let devices = values.registry.all().collect::<Vec<_>>();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "2A");
    assert_eq!(devices[0].hourly_target, 30);
  }

  #[test]
  fn durations_are_read_as_seconds() {
    let values = Manager::parse(unparsed(
      "poll_interval: 3\nsnapshot_interval: 2\ntermination_timeout: 7\n",
    ));

    assert_eq!(values.poll_interval, chrono::Duration::seconds(3));
    assert_eq!(values.snapshot_interval, chrono::Duration::seconds(2));
    assert_eq!(values.termination_timeout, chrono::Duration::seconds(7));
  }

  #[tokio::test]
  async fn values_are_parsed_once() {
    let manager = Manager::with(unparsed(
      r#"
devices:
  2A:
    address: 10.0.0.8
    ranges:
      - start: D800
        count: 24
"#,
    ));

    let first = manager.values().await;
    let second = manager.values().await;
    let first = first.registry.get("2A").unwrap();
    let second = second.registry.get("2A").unwrap();
    assert!(Arc::ptr_eq(first, second));
  }
}
