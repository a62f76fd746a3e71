use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::cache::{Cache, Snapshot};
use super::db::{self, DailySummary, HistoryEntry, HourlyEntry, Store};
use super::push::{Publisher, Update};
use super::registry::{Device, RegisterAddress, Registry};
use super::shift::{Clock, Shift};

#[derive(Debug, thiserror::Error)]
pub(crate) enum QueryError {
  #[error("Device {0} is not configured")]
  UnknownDevice(String),

  #[error("Start date {start} is after end date {end}")]
  InvalidRange { start: NaiveDate, end: NaiveDate },

  #[error("Store query failed")]
  Store(#[from] db::Error),
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct DeviceHealth {
  pub(crate) device_id: String,
  pub(crate) name: String,
  pub(crate) enabled: bool,
  pub(crate) connected: bool,
  pub(crate) last_update: Option<DateTime<Utc>>,
  pub(crate) age_seconds: Option<i64>,
  pub(crate) register_count: usize,
  pub(crate) retries: u32,
  pub(crate) last_error: Option<String>,
}

/// Read side handed to consumers: snapshots, history and push updates.
#[derive(Clone, Debug)]
pub(crate) struct Pool {
  registry: Registry,
  cache: Cache,
  store: Arc<dyn Store>,
  publisher: Publisher,
  clock: Arc<dyn Clock>,
}

impl Pool {
  pub(crate) fn new(
    registry: Registry,
    cache: Cache,
    store: Arc<dyn Store>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      registry,
      cache,
      store,
      publisher,
      clock,
    }
  }

  /// Latest snapshot per configured device, placeholders for unpolled ones.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_snapshot(
    &self,
    device_id: Option<&str>,
  ) -> Result<Vec<Arc<Snapshot>>, QueryError> {
    match device_id {
      Some(device_id) => {
        let device = self.device(device_id)?;
        Ok(vec![self.snapshot_or_placeholder(device).await])
      }
      None => {
        let mut snapshots = Vec::new();
        for device in self.registry.all() {
          snapshots.push(self.snapshot_or_placeholder(device).await);
        }
        Ok(snapshots)
      }
    }
  }

  /// Named register values; an empty request returns every register and
  /// malformed or unknown names are left out.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_registers(
    &self,
    device_id: &str,
    names: &[String],
  ) -> Result<BTreeMap<String, i64>, QueryError> {
    let device = self.device(device_id)?;
    let snapshot = self.snapshot_or_placeholder(device).await;

    if names.is_empty() {
      return Ok(
        snapshot
          .registers
          .iter()
          .map(|(address, value)| (address.to_string(), *value))
          .collect(),
      );
    }

    let mut registers = BTreeMap::new();
    for name in names {
      let address = match name.parse::<RegisterAddress>() {
        Ok(address) => address,
        Err(error) => {
          tracing::debug!("Skipping register {}", error);
          continue;
        }
      };
      if let Some(value) = snapshot.registers.get(&address) {
        registers.insert(name.clone(), *value);
      }
    }

    Ok(registers)
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_history(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<HistoryEntry>, QueryError> {
    if start > end {
      return Err(QueryError::InvalidRange { start, end });
    }

    Ok(self.store.get_history(start, end).await?)
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_hourly(
    &self,
    date: NaiveDate,
    device_id: &str,
    shift: Shift,
  ) -> Result<Vec<HourlyEntry>, QueryError> {
    self.device(device_id)?;

    Ok(self.store.get_hourly(date, device_id, shift).await?)
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_summaries(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<DailySummary>, QueryError> {
    if start > end {
      return Err(QueryError::InvalidRange { start, end });
    }

    Ok(self.store.get_summaries(start, end).await?)
  }

  pub(crate) async fn health(&self) -> Vec<DeviceHealth> {
    let now = self.clock.now().with_timezone(&Utc);
    let mut health = Vec::new();
    for device in self.registry.all() {
      let snapshot = self.cache.get(&device.id).await;
      let last_update = snapshot.as_ref().and_then(|snapshot| snapshot.timestamp);
      health.push(DeviceHealth {
        device_id: device.id.clone(),
        name: device.name.clone(),
        enabled: device.enabled,
        connected: snapshot
          .as_ref()
          .map_or(false, |snapshot| snapshot.connected),
        last_update,
        age_seconds: last_update
          .map(|last_update| (now - last_update).num_seconds()),
        register_count: snapshot
          .as_ref()
          .map_or(0, |snapshot| snapshot.registers.len()),
        retries: snapshot
          .as_ref()
          .map_or(0, |snapshot| snapshot.connection.retries),
        last_error: snapshot.and_then(|snapshot| snapshot.error.clone()),
      });
    }

    health
  }

  pub(crate) fn devices(&self) -> Vec<Arc<Device>> {
    self.registry.all().cloned().collect()
  }

  pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<Update>> {
    self.publisher.subscribe()
  }

  fn device(&self, device_id: &str) -> Result<&Arc<Device>, QueryError> {
    self
      .registry
      .get(device_id)
      .ok_or_else(|| QueryError::UnknownDevice(device_id.to_owned()))
  }

  async fn snapshot_or_placeholder(&self, device: &Device) -> Arc<Snapshot> {
    match self.cache.get(&device.id).await {
      Some(snapshot) => snapshot,
      None => Arc::new(Snapshot::empty(device.id.clone())),
    }
  }
}
