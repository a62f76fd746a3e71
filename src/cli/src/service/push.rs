use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::cache::{Cache, Snapshot};
use super::connection::ConnectionStatus;
use super::registry::RegisterAddress;
use super::shift::ShiftDates;

#[derive(Clone, Debug, Serialize)]
pub(crate) struct DeviceUpdate {
  pub(crate) registers: BTreeMap<RegisterAddress, i64>,
  pub(crate) connected: bool,
}

/// Message sent to subscribers after each successful cycle.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct Update {
  pub(crate) origin: String,
  pub(crate) timestamp: Option<DateTime<Utc>>,
  pub(crate) devices: BTreeMap<String, DeviceUpdate>,
  pub(crate) shift_dates: Option<ShiftDates>,
  pub(crate) connection: BTreeMap<String, ConnectionStatus>,
}

#[derive(Clone, Debug)]
pub(crate) struct Publisher {
  cache: Cache,
  sender: broadcast::Sender<Arc<Update>>,
}

impl Publisher {
  pub(crate) fn new(cache: Cache, capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));

    Self { cache, sender }
  }

  #[allow(dead_code, reason = "queried by the distribution layer")]
  pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<Update>> {
    self.sender.subscribe()
  }

  #[tracing::instrument(skip_all, fields(device = %origin.device_id))]
  pub(crate) async fn publish(&self, origin: &Snapshot) -> usize {
    let snapshots = self.cache.all().await;
    let update = Update {
      origin: origin.device_id.clone(),
      timestamp: origin.timestamp,
      devices: snapshots
        .iter()
        .map(|snapshot| {
          (
            snapshot.device_id.clone(),
            DeviceUpdate {
              registers: snapshot.registers.clone(),
              connected: snapshot.connected,
            },
          )
        })
        .collect(),
      shift_dates: origin.dates,
      connection: snapshots
        .iter()
        .map(|snapshot| {
          (snapshot.device_id.clone(), snapshot.connection.clone())
        })
        .collect(),
    };

    match self.sender.send(Arc::new(update)) {
      Ok(receivers) => {
        tracing::trace!("Published update to {} subscribers", receivers);
        receivers
      }
      Err(_) => {
        tracing::trace!("No subscribers for update");
        0
      }
    }
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
  use super::super::cache::tests::snapshot;
  use super::*;

  #[tokio::test]
  async fn publishes_every_cached_device() {
    let cache = Cache::new();
    let publisher = Publisher::new(cache.clone(), 8);
    let mut receiver = publisher.subscribe();
    let now = Utc::now();
    cache.update(snapshot("1B", now, &[(800, 2)])).await;
    let origin = cache.update(snapshot("1A", now, &[(800, 1)])).await.unwrap();

    assert_eq!(publisher.publish(&origin).await, 1);

    let update = receiver.recv().await.unwrap();
    assert_eq!(update.origin, "1A");
    assert_eq!(
      update.devices.keys().cloned().collect::<Vec<_>>(),
      vec!["1A".to_owned(), "1B".to_owned()]
    );
    assert!(update.devices["1B"].connected);
  }

  #[tokio::test]
  async fn publishing_without_subscribers_is_quiet() {
    let cache = Cache::new();
    let publisher = Publisher::new(cache.clone(), 8);
    let origin = cache
      .update(snapshot("1A", Utc::now(), &[(800, 1)]))
      .await
      .unwrap();

    assert_eq!(publisher.publish(&origin).await, 0);
  }
}
