use std::sync::Arc;

use chrono::Utc;
use futures_time::future::FutureExt;
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::*;
use crate::service::cache::Snapshot;
use crate::service::connection;
use crate::service::db::ShiftRecord;
use crate::service::poller;
use crate::service::production::HourlyTable;
use crate::service::recorder::{Job, SendError};
use crate::service::registry::Device;
use crate::service::shift::{
  resolve_active_ranges, resolve_shift, Hour, Shift, ShiftDates,
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TickError {
  #[error("Device is still busy with the previous cycle")]
  Busy,

  #[error("Channel was disconnected before the cycle could be queued")]
  ChannelDisconnected,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TerminateError {
  #[error("Channel was disconnected before termination")]
  ChannelDisconnected(anyhow::Error),

  #[error("Termination timed out")]
  Timeout(anyhow::Error),

  #[error("Failed joining inner handle")]
  Join(anyhow::Error),
}

type TaskHandle = tokio::task::JoinHandle<()>;

#[derive(Debug)]
enum TaskRequest {
  Cycle,
  Terminate,
}

/// Owns one device: its session, retries and hourly table.
#[derive(Debug, Clone)]
pub(crate) struct Worker {
  device: Arc<Device>,
  sender: flume::Sender<TaskRequest>,
  handle: Arc<Mutex<Option<TaskHandle>>>,
  termination_timeout: futures_time::time::Duration,
}

impl Worker {
  pub(crate) fn new(device: Arc<Device>, shared: Shared) -> Self {
    // NOTE: one slot so a slow device never queues more than one cycle
    let (sender, receiver) = flume::bounded(1);
    let termination_timeout = futures_time::time::Duration::from_millis(
      shared.termination_timeout.num_milliseconds().max(0) as u64,
    );
    let task = Task {
      connection: connection::Manager::new(
        device.clone(),
        shared.client.clone(),
        shared.params,
      ),
      device: device.clone(),
      shared,
      table: HourlyTable::default(),
      last_hour: None,
      receiver,
    };
    let handle = tokio::spawn(task.execute());

    Self {
      device,
      sender,
      handle: Arc::new(Mutex::new(Some(handle))),
      termination_timeout,
    }
  }

  pub(crate) fn device(&self) -> &Arc<Device> {
    &self.device
  }

  pub(crate) fn tick(&self) -> Result<(), TickError> {
    self
      .sender
      .try_send(TaskRequest::Cycle)
      .map_err(|error| match error {
        flume::TrySendError::Full(_) => TickError::Busy,
        flume::TrySendError::Disconnected(_) => TickError::ChannelDisconnected,
      })
  }

  pub(crate) async fn terminate(&self) -> Result<(), TerminateError> {
    let result = self.sender.send_async(TaskRequest::Terminate).await;

    let handle = {
      let mut handle = self.handle.clone().lock_owned().await;
      (*handle).take()
    };
    if let Some(handle) = handle {
      let abort_handle = handle.abort_handle();
      match handle.timeout(self.termination_timeout).await {
        Ok(Ok(_)) => {}
        Err(error) => {
          abort_handle.abort();
          return Err(TerminateError::Timeout(error.into()));
        }
        Ok(Err(error)) => {
          abort_handle.abort();
          return Err(TerminateError::Join(error.into()));
        }
      };
    }

    result.map_err(|error| {
      TerminateError::ChannelDisconnected(anyhow::anyhow!("{error}"))
    })
  }
}

struct Task {
  device: Arc<Device>,
  shared: Shared,
  connection: connection::Manager,
  table: HourlyTable,
  last_hour: Option<Hour>,
  receiver: flume::Receiver<TaskRequest>,
}

impl Task {
  async fn execute(mut self) {
    while let Ok(request) = self.receiver.recv_async().await {
      match request {
        TaskRequest::Cycle => {
          let span = tracing::debug_span!(
            "cycle",
            device = %self.device.id,
            id = %uuid::Uuid::new_v4()
          );
          self.cycle().instrument(span).await;
        }
        TaskRequest::Terminate => break,
      }
    }

    self.connection.close().await;
    tracing::debug!("Worker for {} terminated", self.device.id);
  }

  async fn cycle(&mut self) {
    let now = self.shared.clock.now();
    let timestamp = now.with_timezone(&Utc);

    let session = match self.connection.ensure_connected().await {
      Ok(session) => session,
      Err(error) => {
        self.fail(timestamp, error.to_string()).await;
        return;
      }
    };

    let timeout = self.shared.params.timeout();
    let outcome = match poller::poll(session, &self.device.ranges, timeout).await
    {
      Ok(outcome) => outcome,
      Err(error) => {
        self.connection.disconnect(error.to_string()).await;
        self.fail(timestamp, error.to_string()).await;
        return;
      }
    };

    let hour = Hour::of(&now);
    let reading = self.shared.layout.calendar.read(&outcome.registers);
    let dates = resolve_shift(now, reading);
    let slots = resolve_active_ranges(hour, &self.shared.layout.production);
    self
      .table
      .apply(&slots, &outcome.registers, self.device.cycle_time);
    let totals = self.table.totals(
      slots.in_progress,
      slots.elapsed.iter().chain(slots.live.iter()).map(|slot| slot.hour),
      self.device.hourly_target,
    );

    let error = if outcome.errors.is_empty() {
      None
    } else {
      Some(outcome.errors.iter().map(ToString::to_string).join("; "))
    };
    let snapshot = Snapshot {
      device_id: self.device.id.clone(),
      timestamp: Some(timestamp),
      registers: outcome.registers,
      connected: true,
      error,
      connection: self.connection.status().clone(),
      dates: Some(dates),
      production: self.table.clone(),
      totals: Some(totals),
    };
    let snapshot = match self.shared.cache.update(snapshot).await {
      Some(snapshot) => snapshot,
      None => return,
    };

    self.record(Job::History(snapshot.clone()));
    if let Some(last_hour) = self.last_hour {
      if last_hour != hour {
        self.persist_hour_change(last_hour, hour, &dates);
      }
    }
    self.last_hour = Some(hour);

    self.shared.publisher.publish(&snapshot).await;
    tracing::trace!("Cycle finished");
  }

  async fn fail(&mut self, timestamp: chrono::DateTime<Utc>, error: String) {
    tracing::warn!("Cycle failed for {} {}", self.device.id, error);

    let snapshot = self
      .shared
      .cache
      .fail(
        &self.device.id,
        timestamp,
        error,
        self.connection.status().clone(),
      )
      .await;
    if let Some(snapshot) = snapshot {
      self.record(Job::History(snapshot));
    }
  }

  /// Saves the hours that just finished and closes any shift that ended.
  fn persist_hour_change(
    &self,
    last_hour: Hour,
    hour: Hour,
    dates: &ShiftDates,
  ) {
    let in_progress = Shift::for_hour(hour);
    let steps = (hour.value() + 24 - last_hour.value()) % 24;
    let crossed = (1..=steps).any(|step| {
      let passed = (last_hour.value() + step) % 24;
      [Shift::Day, Shift::Night]
        .iter()
        .any(|shift| shift.start().value() == passed)
    });

    if crossed {
      let ended = in_progress.other();
      self.persist_hours(ended, ended.hours(), dates);
      self.record(Job::Summary {
        date: dates.for_shift(ended),
        device_id: self.device.id.clone(),
        shift: ended,
      });
    }

    let process_hour = hour.previous();
    if Shift::for_hour(process_hour) == in_progress {
      self.persist_hours(
        in_progress,
        in_progress.hours_through(process_hour),
        dates,
      );
    }
  }

  fn persist_hours<TIntoIterator: IntoIterator<Item = Hour>>(
    &self,
    shift: Shift,
    hours: TIntoIterator,
    dates: &ShiftDates,
  ) {
    let date = dates.for_shift(shift);
    for hour in hours {
      if let Some(entry) = self.table.get(hour) {
        self.record(Job::Hourly(ShiftRecord {
          date,
          device_id: self.device.id.clone(),
          shift,
          hour,
          target: self.device.hourly_target,
          actual: entry.units,
          downtime: entry.downtime,
        }));
      }
    }
  }

  fn record(&self, job: Job) {
    match self.shared.recorder.record(job) {
      Ok(()) => {}
      Err(SendError::Full) => {
        tracing::warn!("Skipped history for {}", self.device.id);
      }
      Err(error) => {
        tracing::error!("Failed queueing job for {} {}", self.device.id, error);
      }
    }
  }
}
