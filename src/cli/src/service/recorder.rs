use std::sync::Arc;

use chrono::NaiveDate;
use futures_time::future::FutureExt;
use tokio::sync::Mutex;

use super::cache::Snapshot;
use super::db::{ShiftRecord, Store};
use super::shift::Shift;

/// Durable writes queued behind the cache so they never block a cycle.
/// History goes through a bounded queue and is dropped when the store falls
/// behind. Hourly rows and summaries are never dropped.
#[derive(Clone, Debug)]
pub(crate) enum Job {
  History(Arc<Snapshot>),
  Hourly(ShiftRecord),
  Summary {
    date: NaiveDate,
    device_id: String,
    shift: Shift,
  },
}

#[derive(Debug)]
enum TaskRequest {
  Job(Job),
  Terminate,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
  #[error("History queue is full")]
  Full,

  #[error("Recorder was terminated")]
  ChannelDisconnected(anyhow::Error),
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

#[derive(Debug, Clone)]
pub(crate) struct Recorder {
  sender: flume::Sender<TaskRequest>,
  history: flume::Sender<Arc<Snapshot>>,
  handle: Arc<Mutex<Option<TaskHandle>>>,
  termination_timeout: futures_time::time::Duration,
}

impl Recorder {
  pub(crate) fn new(
    store: Arc<dyn Store>,
    history_capacity: usize,
    termination_timeout: chrono::Duration,
  ) -> Self {
    let (sender, receiver) = flume::unbounded();
    let (history, history_receiver) = flume::bounded(history_capacity.max(1));
    let task = Task {
      store,
      receiver,
      history: history_receiver,
    };
    let handle = tokio::spawn(task.execute());

    Self {
      sender,
      history,
      handle: Arc::new(Mutex::new(Some(handle))),
      termination_timeout: futures_time::time::Duration::from_millis(
        termination_timeout.num_milliseconds().max(0) as u64,
      ),
    }
  }

  pub(crate) fn record(&self, job: Job) -> Result<(), SendError> {
    match job {
      Job::History(snapshot) => {
        self.history.try_send(snapshot).map_err(|error| match error {
          flume::TrySendError::Full(snapshot) => {
            tracing::warn!(
              "History queue is full, dropping snapshot of {}",
              snapshot.device_id
            );
            SendError::Full
          }
          flume::TrySendError::Disconnected(_) => {
            SendError::ChannelDisconnected(anyhow::anyhow!(
              "History channel disconnected"
            ))
          }
        })
      }
      job => self.sender.send(TaskRequest::Job(job)).map_err(|error| {
        SendError::ChannelDisconnected(anyhow::anyhow!("{error}"))
      }),
    }
  }

  /// Drains queued jobs and stops the task.
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
  store: Arc<dyn Store>,
  receiver: flume::Receiver<TaskRequest>,
  history: flume::Receiver<Arc<Snapshot>>,
}

impl Task {
  async fn execute(self) {
    loop {
      let request = tokio::select! {
        biased;
        request = self.receiver.recv_async() => match request {
          Ok(request) => request,
          Err(_) => return,
        },
        snapshot = self.history.recv_async() => match snapshot {
          Ok(snapshot) => TaskRequest::Job(Job::History(snapshot)),
          Err(_) => return,
        },
      };
      match request {
        TaskRequest::Job(job) => self.handle(job).await,
        TaskRequest::Terminate => {
          let pending = self.history.try_iter().collect::<Vec<_>>();
          for snapshot in pending {
            self.handle(Job::History(snapshot)).await;
          }
          tracing::debug!("Recorder terminated");
          return;
        }
      }
    }
  }

  #[tracing::instrument(skip_all)]
  async fn handle(&self, job: Job) {
    match job {
      Job::History(snapshot) => {
        if let Err(error) = self.store.insert_history(&snapshot).await {
          tracing::error!(
            "Failed inserting history for {} {}",
            snapshot.device_id,
            error
          );
        }
      }
      Job::Hourly(record) => {
        if let Err(error) = self.store.upsert_hourly(&record).await {
          tracing::error!(
            "Failed saving {} {} hour {} for {} {}",
            record.date,
            record.shift,
            record.hour,
            record.device_id,
            error
          );
        }
      }
      Job::Summary {
        date,
        device_id,
        shift,
      } => {
        let summary =
          match self.store.summarize_shift(date, &device_id, shift).await {
            Ok(Some(summary)) => summary,
            Ok(None) => {
              tracing::warn!(
                "No hourly rows to summarize for {} {} {}",
                device_id,
                date,
                shift
              );
              return;
            }
            Err(error) => {
              tracing::error!(
                "Failed summarizing {} {} {} {}",
                device_id,
                date,
                shift,
                error
              );
              return;
            }
          };

        match self.store.upsert_daily_summary(&summary).await {
          Ok(()) => tracing::info!(
            "Saved {} summary for {} {}: {}/{} units, {} min downtime",
            shift,
            device_id,
            date,
            summary.total_actual,
            summary.total_target,
            summary.total_downtime
          ),
          Err(error) => {
            tracing::error!("Failed saving summary for {} {}", device_id, error)
          }
        }
      }
    }
  }
}
