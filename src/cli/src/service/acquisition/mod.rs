mod worker;

use std::{collections::BTreeMap, sync::Arc};

use super::cache::Cache;
use super::connection::Params;
use super::field::Client;
use super::push::Publisher;
use super::recorder::Recorder;
use super::registry::Registry;
use super::shift::{CalendarLayout, Clock, ProductionLayout};

use worker::{TickError, Worker};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Layout {
  pub(crate) calendar: CalendarLayout,
  pub(crate) production: ProductionLayout,
}

/// Dependencies every device worker shares.
#[derive(Clone, Debug)]
pub(crate) struct Shared {
  pub(crate) cache: Cache,
  pub(crate) recorder: Recorder,
  pub(crate) publisher: Publisher,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) client: Arc<dyn Client>,
  pub(crate) params: Params,
  pub(crate) layout: Layout,
  pub(crate) termination_timeout: chrono::Duration,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Tick {
  pub(crate) queued: usize,
  pub(crate) busy: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Service {
  workers: Arc<BTreeMap<String, Worker>>,
}

impl Service {
  pub(crate) fn new(registry: &Registry, shared: Shared) -> Self {
    let workers = registry
      .enabled()
      .map(|device| {
        (device.id.clone(), Worker::new(device.clone(), shared.clone()))
      })
      .collect::<BTreeMap<_, _>>();

    tracing::info!("Started {} device workers", workers.len());

    Self {
      workers: Arc::new(workers),
    }
  }

  /// Queues one cycle per device, skipping devices still mid-cycle.
  #[tracing::instrument(skip(self))]
  pub(crate) fn tick(&self) -> Tick {
    let mut tick = Tick::default();
    for worker in self.workers.values() {
      match worker.tick() {
        Ok(()) => tick.queued += 1,
        Err(TickError::Busy) => {
          tracing::debug!(
            "Skipped {} since its previous cycle is in flight",
            worker.device().id
          );
          tick.busy += 1;
        }
        Err(error) => {
          tracing::error!("Failed ticking {} {}", worker.device().id, error)
        }
      }
    }

    tick
  }

  pub(crate) async fn terminate(&self) {
    let results = futures::future::join_all(
      self.workers.values().map(|worker| worker.terminate()),
    )
    .await;
    for (id, result) in self.workers.keys().zip(results) {
      if let Err(error) = result {
        tracing::error!("Failed terminating worker {} {}", id, error);
      }
    }
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
  use std::time::Duration;

  use chrono::NaiveDate;

  use super::super::db::{memory::MemoryStore, Store};
  use super::super::field::fake::Plc;
  use super::super::registry::{tests as devices, RegisterAddress};
  use super::super::shift::{
    tests::{at, layout, FixedClock},
    Shift,
  };
  use super::*;

  pub(crate) struct Rig {
    pub(crate) plc: Plc,
    pub(crate) clock: FixedClock,
    pub(crate) cache: Cache,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) recorder: Recorder,
    pub(crate) publisher: Publisher,
    pub(crate) acquisition: Service,
    pub(crate) registry: Registry,
  }

  pub(crate) fn calendar() -> CalendarLayout {
    CalendarLayout {
      day_month: RegisterAddress::new(700).unwrap(),
      day_date: RegisterAddress::new(710).unwrap(),
      previous_month: RegisterAddress::new(701).unwrap(),
      previous_date: RegisterAddress::new(711).unwrap(),
    }
  }

  pub(crate) fn rig(registry: Registry, hour: u32) -> Rig {
    let plc = Plc::default();
    plc.set(700, 3);
    plc.set(710, 10);
    plc.set(701, 3);
    plc.set(711, 9);
    let clock = FixedClock::new(at(2024, 3, 10, hour));
    let cache = Cache::new();
    let store = Arc::new(MemoryStore::default());
    let recorder = Recorder::new(store.clone(), 16, chrono::Duration::seconds(5));
    let publisher = Publisher::new(cache.clone(), 16);
    let acquisition = Service::new(
      &registry,
      Shared {
        cache: cache.clone(),
        recorder: recorder.clone(),
        publisher: publisher.clone(),
        clock: Arc::new(clock.clone()),
        client: Arc::new(plc.clone()),
        params: Params::new(
          chrono::Duration::seconds(1),
          chrono::Duration::zero(),
          2,
        ),
        layout: Layout {
          calendar: calendar(),
          production: layout(),
        },
        termination_timeout: chrono::Duration::seconds(5),
      },
    );

    Rig {
      plc,
      clock,
      cache,
      store,
      recorder,
      publisher,
      acquisition,
      registry,
    }
  }

  pub(crate) fn line_registry() -> Registry {
    Registry::new(vec![devices::device(
      "1A",
      vec![
        devices::range(700, 20, "Date info"),
        devices::range(800, 24, "Current production"),
        devices::range(850, 24, "Previous production"),
      ],
    )])
  }

  // NOTE: cycles run on worker tasks, so wait for the cache to move
  pub(crate) async fn run_cycle(rig: &Rig, device_id: &str) {
    let before = rig.cache.get(device_id).await.map(|s| s.timestamp);
    let mut receiver = rig.publisher.subscribe();
    rig.acquisition.tick();
    for _ in 0..200 {
      if rig.cache.get(device_id).await.map(|s| s.timestamp) != before {
        break;
      }
      tokio::select! {
        _ = receiver.recv() => {},
        _ = tokio::time::sleep(Duration::from_millis(10)) => {},
      }
    }
  }

  #[tokio::test]
  async fn cycle_caches_registers_and_dates() {
    let rig = rig(line_registry(), 14);
    rig.plc.set(810, 42);

    run_cycle(&rig, "1A").await;

    let snapshot = rig.cache.get("1A").await.unwrap();
    assert!(snapshot.connected);
    assert_eq!(snapshot.error, None);
    assert_eq!(snapshot.registers[&RegisterAddress::new(810).unwrap()], 42);
    let dates = snapshot.dates.unwrap();
    assert_eq!(dates.night, NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
    assert_eq!(snapshot.totals.unwrap().actual, 42);
  }

  #[tokio::test]
  async fn failed_cycle_keeps_previous_registers() {
    let rig = rig(line_registry(), 14);
    rig.plc.set(810, 42);
    run_cycle(&rig, "1A").await;

    rig.plc.set_down(true);
    rig.clock.set(at(2024, 3, 10, 15));
    run_cycle(&rig, "1A").await;

    let snapshot = rig.cache.get("1A").await.unwrap();
    assert!(!snapshot.connected);
    assert!(snapshot.error.is_some());
    assert_eq!(snapshot.registers[&RegisterAddress::new(810).unwrap()], 42);
  }

  #[tokio::test]
  async fn shift_end_persists_hours_and_summary() {
    let rig = rig(line_registry(), 18);
    for hour in 7..19 {
      rig.plc.set(800 + hour, 5);
    }
    run_cycle(&rig, "1A").await;

    rig.clock.set(at(2024, 3, 10, 19));
    run_cycle(&rig, "1A").await;
    rig.acquisition.terminate().await;
    rig.recorder.terminate().await.unwrap();

    let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
    let hourly = rig.store.get_hourly(date, "1A", Shift::Day).await.unwrap();
    assert_eq!(hourly.len(), 12);
    let summaries = rig.store.get_summaries(date, date).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_actual, 60);
    assert_eq!(summaries[0].total_target, 240);

    let history = rig.store.get_history(date, date).await.unwrap();
    assert_eq!(history[0].achievement_rate, rust_decimal_macros::dec!(25.0));
  }

  #[tokio::test]
  async fn night_end_persists_hours_from_previous_block() {
    let rig = rig(line_registry(), 6);
    let night = [19, 20, 21, 22, 23, 0, 1, 2, 3, 4, 5, 6];
    rig.plc.set(710, 9);
    rig.plc.set(711, 8);
    for hour in night {
      rig.plc.set(800 + hour, 4);
    }
    run_cycle(&rig, "1A").await;

    rig.plc.set(710, 10);
    rig.plc.set(711, 9);
    for hour in night {
      rig.plc.set(800 + hour, 0);
      rig.plc.set(850 + hour, 4);
    }
    rig.clock.set(at(2024, 3, 10, 7));
    run_cycle(&rig, "1A").await;
    rig.acquisition.terminate().await;
    rig.recorder.terminate().await.unwrap();

    let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
    let hourly = rig
      .store
      .get_hourly(date, "1A", Shift::Night)
      .await
      .unwrap();
    assert_eq!(hourly.len(), 12);
    assert!(hourly.iter().all(|entry| entry.actual == 4));
    let summaries = rig.store.get_summaries(date, date).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].shift, Shift::Night);
    assert_eq!(summaries[0].total_actual, 48);
    assert_eq!(summaries[0].total_target, 240);
  }

  #[tokio::test]
  async fn failed_range_keeps_the_device_connected() {
    let registry = Registry::new(vec![devices::device(
      "1A",
      vec![
        devices::range(700, 20, "Date info"),
        devices::range(5000, 10, "Alarms"),
        devices::range(800, 24, "Current production"),
      ],
    )]);
    let rig = rig(registry, 14);
    rig.plc.set(810, 42);
    rig.plc.fail_reads_at(5000);

    run_cycle(&rig, "1A").await;

    let snapshot = rig.cache.get("1A").await.unwrap();
    assert!(snapshot.connected);
    assert!(snapshot.error.as_deref().unwrap().contains("D5000"));
    assert_eq!(snapshot.registers[&RegisterAddress::new(810).unwrap()], 42);
    assert!(!snapshot
      .registers
      .contains_key(&RegisterAddress::new(5000).unwrap()));
  }

  #[tokio::test]
  async fn terminate_closes_sessions() {
    let rig = rig(line_registry(), 10);
    run_cycle(&rig, "1A").await;

    rig.acquisition.terminate().await;

    assert_eq!(rig.plc.closes(), 1);
    assert!(rig.registry.get("1A").is_some());
  }
}
