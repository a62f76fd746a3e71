use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::*;

type HourlyKey = (NaiveDate, String, Shift, Hour);
type SummaryKey = (NaiveDate, String, Shift);

#[derive(Debug, Clone)]
pub(crate) struct RegisterRow {
  pub(crate) device_id: String,
  pub(crate) timestamp: DateTime<Utc>,
  pub(crate) register_name: String,
  pub(crate) value: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionRow {
  pub(crate) device_id: String,
  pub(crate) timestamp: DateTime<Utc>,
  pub(crate) connected: bool,
  pub(crate) error: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
  registers: Vec<RegisterRow>,
  connections: Vec<ConnectionRow>,
  hourly: BTreeMap<HourlyKey, ShiftRecord>,
  summaries: BTreeMap<SummaryKey, DailySummary>,
}

/// Volatile store used when no database is configured.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
  tables: RwLock<Tables>,
}

impl MemoryStore {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub(crate) async fn registers(&self) -> Vec<RegisterRow> {
    self.tables.read().await.registers.clone()
  }

  #[cfg(test)]
  pub(crate) async fn connections(&self) -> Vec<ConnectionRow> {
    self.tables.read().await.connections.clone()
  }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
  async fn migrate(&self) -> Result<(), MigrateError> {
    tracing::info!("Using volatile in-memory store");

    Ok(())
  }

  async fn insert_history(&self, snapshot: &Snapshot) -> Result<(), Error> {
    let Some(timestamp) = snapshot.timestamp else {
      return Ok(());
    };
    let mut tables = self.tables.write().await;
    if snapshot.connected {
      tables.registers.extend(snapshot.registers.iter().map(
        |(register, value)| RegisterRow {
          device_id: snapshot.device_id.clone(),
          timestamp,
          register_name: register.to_string(),
          value: *value,
        },
      ));
    }
    tables.connections.push(ConnectionRow {
      device_id: snapshot.device_id.clone(),
      timestamp,
      connected: snapshot.connected,
      error: snapshot.error.clone(),
    });

    Ok(())
  }

  async fn upsert_hourly(&self, record: &ShiftRecord) -> Result<(), Error> {
    self.tables.write().await.hourly.insert(
      (
        record.date,
        record.device_id.clone(),
        record.shift,
        record.hour,
      ),
      record.clone(),
    );

    Ok(())
  }

  async fn upsert_daily_summary(
    &self,
    summary: &DailySummary,
  ) -> Result<(), Error> {
    self.tables.write().await.summaries.insert(
      (summary.date, summary.device_id.clone(), summary.shift),
      summary.clone(),
    );

    Ok(())
  }

  async fn summarize_shift(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Option<DailySummary>, Error> {
    let tables = self.tables.read().await;
    let rows = tables
      .hourly
      .values()
      .filter(|row| {
        row.date == date && row.device_id == device_id && row.shift == shift
      })
      .collect::<Vec<_>>();
    if rows.is_empty() {
      return Ok(None);
    }

    Ok(Some(DailySummary {
      date,
      device_id: device_id.to_owned(),
      shift,
      total_target: rows.iter().map(|row| row.target).sum(),
      total_actual: rows.iter().map(|row| row.actual).sum(),
      total_downtime: rows.iter().map(|row| row.downtime).sum(),
    }))
  }

  async fn get_history(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<HistoryEntry>, Error> {
    let tables = self.tables.read().await;
    let mut groups = BTreeMap::<SummaryKey, (i64, i64)>::new();
    for row in tables
      .hourly
      .values()
      .filter(|row| row.date >= start && row.date <= end)
    {
      let totals = groups
        .entry((row.date, row.device_id.clone(), row.shift))
        .or_default();
      totals.0 += row.target;
      totals.1 += row.actual;
    }

    let mut history = groups
      .into_iter()
      .map(|((date, device_id, shift), (target, actual))| {
        HistoryEntry::new(date, device_id, shift, target, actual)
      })
      .collect::<Vec<_>>();
    history.sort_by(|x, y| {
      y.date
        .cmp(&x.date)
        .then_with(|| x.device_id.cmp(&y.device_id))
        .then_with(|| x.shift.cmp(&y.shift))
    });

    Ok(history)
  }

  async fn get_hourly(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Vec<HourlyEntry>, Error> {
    let tables = self.tables.read().await;

    Ok(
      tables
        .hourly
        .values()
        .filter(|row| {
          row.date == date && row.device_id == device_id && row.shift == shift
        })
        .map(|row| {
          HourlyEntry::new(row.hour, row.target, row.actual, row.downtime)
        })
        .collect(),
    )
  }

  async fn get_summaries(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<DailySummary>, Error> {
    let tables = self.tables.read().await;
    let mut summaries = tables
      .summaries
      .values()
      .filter(|summary| summary.date >= start && summary.date <= end)
      .cloned()
      .collect::<Vec<_>>();
    summaries.sort_by(|x, y| {
      y.date
        .cmp(&x.date)
        .then_with(|| x.device_id.cmp(&y.device_id))
        .then_with(|| x.shift.cmp(&y.shift))
    });

    Ok(summaries)
  }

  async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<Pruned, Error> {
    let mut tables = self.tables.write().await;

    let registers = tables.registers.len();
    tables.registers.retain(|row| row.timestamp >= cutoff);
    let connections = tables.connections.len();
    tables.connections.retain(|row| row.timestamp >= cutoff);

    Ok(Pruned {
      registers: (registers - tables.registers.len()) as u64,
      connections: (connections - tables.connections.len()) as u64,
    })
  }

  async fn prune_production(&self, cutoff: NaiveDate) -> Result<u64, Error> {
    let mut tables = self.tables.write().await;

    let before = tables.hourly.len() + tables.summaries.len();
    tables.hourly.retain(|key, _| key.0 >= cutoff);
    tables.summaries.retain(|key, _| key.0 >= cutoff);

    Ok((before - tables.hourly.len() - tables.summaries.len()) as u64)
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
  use rust_decimal_macros::dec;

  use crate::service::cache::tests::snapshot;
  use super::*;

  fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
  }

  fn record(day: u32, shift: Shift, hour: u32, actual: i64) -> ShiftRecord {
    ShiftRecord {
      date: date(day),
      device_id: "1A".to_owned(),
      shift,
      hour: Hour::new(hour).unwrap(),
      target: 20,
      actual,
      downtime: 60 - actual,
    }
  }

  #[tokio::test]
  async fn hourly_upsert_keeps_latest_value() {
    let store = MemoryStore::default();
    store
      .upsert_hourly(&record(10, Shift::Day, 9, 3))
      .await
      .unwrap();
    store
      .upsert_hourly(&record(10, Shift::Day, 9, 5))
      .await
      .unwrap();

    let hourly = store.get_hourly(date(10), "1A", Shift::Day).await.unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].actual, 5);
    assert_eq!(hourly[0].achievement_rate, dec!(25.0));
  }

  #[tokio::test]
  async fn summary_sums_persisted_hours() {
    let store = MemoryStore::default();
    for hour in 7..19 {
      store
        .upsert_hourly(&record(10, Shift::Day, hour, 5))
        .await
        .unwrap();
    }
    store
      .upsert_hourly(&record(10, Shift::Night, 20, 50))
      .await
      .unwrap();

    let summary = store
      .summarize_shift(date(10), "1A", Shift::Day)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(summary.total_target, 240);
    assert_eq!(summary.total_actual, 60);
    assert_eq!(summary.total_downtime, 12 * 55);

    assert!(store
      .summarize_shift(date(11), "1A", Shift::Day)
      .await
      .unwrap()
      .is_none());

    store.upsert_daily_summary(&summary).await.unwrap();
    store.upsert_daily_summary(&summary).await.unwrap();
    assert_eq!(
      store.get_summaries(date(1), date(31)).await.unwrap(),
      vec![summary]
    );
  }

  #[tokio::test]
  async fn history_groups_by_shift_newest_first() {
    let store = MemoryStore::default();
    store
      .upsert_hourly(&record(9, Shift::Night, 22, 10))
      .await
      .unwrap();
    store
      .upsert_hourly(&record(10, Shift::Day, 8, 5))
      .await
      .unwrap();
    store
      .upsert_hourly(&record(10, Shift::Day, 9, 5))
      .await
      .unwrap();

    let history = store.get_history(date(9), date(10)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].date, date(10));
    assert_eq!(history[0].total_target, 40);
    assert_eq!(history[0].total_actual, 10);
    assert_eq!(history[0].achievement_rate, dec!(25.0));
    assert_eq!(history[1].shift, Shift::Night);
  }

  #[tokio::test]
  async fn prunes_exactly_rows_older_than_cutoff() {
    let store = MemoryStore::default();
    let now = Utc::now();
    let cutoff = now - chrono::Duration::hours(24);
    for age in [25, 24, 1] {
      store
        .insert_history(&snapshot(
          "1A",
          now - chrono::Duration::hours(age),
          &[(800, 1), (801, 2)],
        ))
        .await
        .unwrap();
    }

    let pruned = store.prune_history(cutoff).await.unwrap();

    assert_eq!(
      pruned,
      Pruned {
        registers: 2,
        connections: 1
      }
    );
    assert_eq!(store.registers().await.len(), 4);
    assert!(store
      .connections()
      .await
      .iter()
      .all(|row| row.timestamp >= cutoff));
  }

  #[tokio::test]
  async fn prunes_production_before_cutoff_date() {
    let store = MemoryStore::default();
    store
      .upsert_hourly(&record(8, Shift::Day, 8, 5))
      .await
      .unwrap();
    store
      .upsert_hourly(&record(10, Shift::Day, 8, 5))
      .await
      .unwrap();

    assert_eq!(store.prune_production(date(9)).await.unwrap(), 1);
    assert_eq!(store.get_history(date(1), date(31)).await.unwrap().len(), 1);
  }
}
