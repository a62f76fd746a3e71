pub(crate) mod memory;
pub(crate) mod postgres;

use std::fmt::Debug;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;

use super::cache::Snapshot;
use super::production::achievement_rate;
use super::shift::{Hour, HourError, Shift};

/// One hour of production for one device and shift.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ShiftRecord {
  pub(crate) date: NaiveDate,
  pub(crate) device_id: String,
  pub(crate) shift: Shift,
  pub(crate) hour: Hour,
  pub(crate) target: i64,
  pub(crate) actual: i64,
  pub(crate) downtime: i64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct DailySummary {
  pub(crate) date: NaiveDate,
  pub(crate) device_id: String,
  pub(crate) shift: Shift,
  pub(crate) total_target: i64,
  pub(crate) total_actual: i64,
  pub(crate) total_downtime: i64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[allow(dead_code, reason = "queried by the distribution layer")]
pub(crate) struct HistoryEntry {
  pub(crate) date: NaiveDate,
  pub(crate) device_id: String,
  pub(crate) shift: Shift,
  pub(crate) total_target: i64,
  pub(crate) total_actual: i64,
  pub(crate) achievement_rate: Decimal,
}

impl HistoryEntry {
  pub(crate) fn new(
    date: NaiveDate,
    device_id: String,
    shift: Shift,
    total_target: i64,
    total_actual: i64,
  ) -> Self {
    Self {
      date,
      device_id,
      shift,
      total_target,
      total_actual,
      achievement_rate: achievement_rate(total_actual, total_target),
    }
  }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[allow(dead_code, reason = "queried by the distribution layer")]
pub(crate) struct HourlyEntry {
  pub(crate) hour: Hour,
  pub(crate) target: i64,
  pub(crate) actual: i64,
  pub(crate) downtime: i64,
  pub(crate) achievement_rate: Decimal,
}

impl HourlyEntry {
  pub(crate) fn new(hour: Hour, target: i64, actual: i64, downtime: i64) -> Self {
    Self {
      hour,
      target,
      actual,
      downtime,
      achievement_rate: achievement_rate(actual, target),
    }
  }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Pruned {
  pub(crate) registers: u64,
  pub(crate) connections: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PruneReport {
  pub(crate) history: Pruned,
  pub(crate) production: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
  #[error("Sqlx error")]
  Sqlx(#[from] sqlx::Error),

  #[error("Stored hour is invalid")]
  Hour(#[from] HourError),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum MigrateError {
  #[error("Migration failed")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

#[async_trait::async_trait]
pub(crate) trait Store: Debug + Send + Sync {
  async fn migrate(&self) -> Result<(), MigrateError>;

  /// Appends the connection status and, for live snapshots, the registers.
  async fn insert_history(&self, snapshot: &Snapshot) -> Result<(), Error>;

  async fn upsert_hourly(&self, record: &ShiftRecord) -> Result<(), Error>;

  async fn upsert_daily_summary(
    &self,
    summary: &DailySummary,
  ) -> Result<(), Error>;

  /// Sums the persisted hourly rows of one shift.
  async fn summarize_shift(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Option<DailySummary>, Error>;

  #[allow(dead_code, reason = "queried by the distribution layer")]
  async fn get_history(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<HistoryEntry>, Error>;

  #[allow(dead_code, reason = "queried by the distribution layer")]
  async fn get_hourly(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Vec<HourlyEntry>, Error>;

  #[allow(dead_code, reason = "queried by the distribution layer")]
  async fn get_summaries(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<DailySummary>, Error>;

  /// Deletes raw register and connection rows older than `cutoff`.
  async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<Pruned, Error>;

  /// Deletes hourly and summary rows dated before `cutoff`.
  async fn prune_production(&self, cutoff: NaiveDate) -> Result<u64, Error>;
}

/// Applies both retention windows relative to `now`. Production rows are
/// kept forever without a production retention.
pub(crate) async fn prune(
  store: &dyn Store,
  now: DateTime<Tz>,
  history_retention: chrono::Duration,
  production_retention: Option<chrono::Duration>,
) -> Result<PruneReport, Error> {
  let history = store
    .prune_history((now - history_retention).with_timezone(&Utc))
    .await?;

  let production = match production_retention {
    Some(retention) => Some(
      store
        .prune_production((now - retention).date_naive())
        .await?,
    ),
    None => None,
  };

  Ok(PruneReport {
    history,
    production,
  })
}
