use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::connection::ConnectionStatus;
use super::production::{HourlyTable, ShiftTotals};
use super::registry::RegisterAddress;
use super::shift::ShiftDates;

#[derive(Clone, Debug, Serialize)]
pub(crate) struct Snapshot {
  pub(crate) device_id: String,
  pub(crate) timestamp: Option<DateTime<Utc>>,
  pub(crate) registers: BTreeMap<RegisterAddress, i64>,
  pub(crate) connected: bool,
  pub(crate) error: Option<String>,
  pub(crate) connection: ConnectionStatus,
  pub(crate) dates: Option<ShiftDates>,
  pub(crate) production: HourlyTable,
  pub(crate) totals: Option<ShiftTotals>,
}

impl Snapshot {
  pub(crate) fn empty(device_id: String) -> Self {
    Self {
      device_id,
      timestamp: None,
      registers: BTreeMap::new(),
      connected: false,
      error: None,
      connection: ConnectionStatus::default(),
      dates: None,
      production: HourlyTable::default(),
      totals: None,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Cache {
  snapshots: Arc<RwLock<HashMap<String, Arc<Snapshot>>>>,
}

impl Cache {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Replaces the device snapshot unless a newer one is already cached.
  #[tracing::instrument(skip_all, fields(device = %snapshot.device_id))]
  pub(crate) async fn update(&self, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
    let mut snapshots = self.snapshots.write().await;
    if let Some(current) = snapshots.get(&snapshot.device_id) {
      if current.timestamp > snapshot.timestamp {
        tracing::debug!(
          "Discarded stale snapshot from {:?} older than {:?}",
          snapshot.timestamp,
          current.timestamp
        );
        return None;
      }
    }

    let snapshot = Arc::new(snapshot);
    snapshots.insert(snapshot.device_id.clone(), snapshot.clone());
    tracing::trace!("Cached snapshot");

    Some(snapshot)
  }

  /// Caches a failed cycle while keeping the last known readings.
  #[tracing::instrument(skip(self, connection))]
  pub(crate) async fn fail(
    &self,
    device_id: &str,
    timestamp: DateTime<Utc>,
    error: String,
    connection: ConnectionStatus,
  ) -> Option<Arc<Snapshot>> {
    let mut snapshots = self.snapshots.write().await;
    let previous = snapshots.get(device_id).cloned();
    if let Some(previous) = &previous {
      if previous.timestamp > Some(timestamp) {
        return None;
      }
    }

    let base = previous.map_or_else(
      || Snapshot::empty(device_id.to_owned()),
      |previous| (*previous).clone(),
    );
    let snapshot = Arc::new(Snapshot {
      timestamp: Some(timestamp),
      connected: false,
      error: Some(error),
      connection,
      ..base
    });
    snapshots.insert(device_id.to_owned(), snapshot.clone());

    Some(snapshot)
  }

  pub(crate) async fn get(&self, device_id: &str) -> Option<Arc<Snapshot>> {
    self.snapshots.read().await.get(device_id).cloned()
  }

  pub(crate) async fn all(&self) -> Vec<Arc<Snapshot>> {
    let mut snapshots = self
      .snapshots
      .read()
      .await
      .values()
      .cloned()
      .collect::<Vec<_>>();
    snapshots.sort_by(|x, y| x.device_id.cmp(&y.device_id));
    snapshots
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn snapshot(
    device_id: &str,
    timestamp: DateTime<Utc>,
    registers: &[(u32, i64)],
  ) -> Snapshot {
    Snapshot {
      timestamp: Some(timestamp),
      connected: true,
      registers: registers
        .iter()
        .map(|(address, value)| {
          (RegisterAddress::new(*address).unwrap(), *value)
        })
        .collect(),
      ..Snapshot::empty(device_id.to_owned())
    }
  }

  #[tokio::test]
  async fn discards_stale_snapshots() {
    let cache = Cache::new();
    let now = Utc::now();

    assert!(cache.update(snapshot("1A", now, &[(800, 5)])).await.is_some());
    assert!(cache
      .update(snapshot("1A", now - chrono::Duration::seconds(3), &[(800, 1)]))
      .await
      .is_none());

    let cached = cache.get("1A").await.unwrap();
    assert_eq!(cached.timestamp, Some(now));
    assert_eq!(cached.registers.values().copied().collect::<Vec<_>>(), [5]);
  }

  #[tokio::test]
  async fn failure_keeps_previous_registers() {
    let cache = Cache::new();
    let now = Utc::now();
    cache.update(snapshot("1A", now, &[(800, 5), (801, 7)])).await;

    let failed = cache
      .fail(
        "1A",
        now + chrono::Duration::seconds(3),
        "all ranges failed".to_owned(),
        ConnectionStatus::default(),
      )
      .await
      .unwrap();

    assert!(!failed.connected);
    assert_eq!(failed.error.as_deref(), Some("all ranges failed"));
    assert_eq!(failed.registers.len(), 2);
  }

  #[tokio::test]
  async fn failure_without_history_is_empty() {
    let cache = Cache::new();
    let failed = cache
      .fail(
        "1B",
        Utc::now(),
        "refused".to_owned(),
        ConnectionStatus::default(),
      )
      .await
      .unwrap();

    assert!(failed.registers.is_empty());
    assert_eq!(cache.all().await.len(), 1);
  }

  #[test]
  fn unpolled_placeholder_has_no_timestamp() {
    let placeholder = Snapshot::empty("1A".to_owned());

    let json = serde_json::to_value(&placeholder).unwrap();

    assert!(json["timestamp"].is_null());
    assert_eq!(json["connected"], false);
  }

  #[tokio::test]
  async fn readers_keep_their_copy() {
    let cache = Cache::new();
    let now = Utc::now();
    cache.update(snapshot("1A", now, &[(800, 5)])).await;
    let held = cache.get("1A").await.unwrap();

    cache
      .update(snapshot("1A", now + chrono::Duration::seconds(3), &[(800, 9)]))
      .await;

    assert_eq!(held.registers.values().copied().collect::<Vec<_>>(), [5]);
    assert_eq!(
      cache
        .get("1A")
        .await
        .unwrap()
        .registers
        .values()
        .copied()
        .collect::<Vec<_>>(),
      [9]
    );
  }
}
