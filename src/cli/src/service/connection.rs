use std::sync::Arc;

use futures_time::future::FutureExt;
use serde::Serialize;

use super::field::{Client, OpenError, Session};
use super::registry::Device;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ConnectionStatus {
  pub(crate) state: ConnectionState,
  pub(crate) retries: u32,
  pub(crate) last_error: Option<String>,
}

impl Default for ConnectionStatus {
  fn default() -> Self {
    Self {
      state: ConnectionState::Disconnected,
      retries: 0,
      last_error: None,
    }
  }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Params {
  timeout: futures_time::time::Duration,
  retry_delay: tokio::time::Duration,
  max_retries: u32,
}

impl Params {
  pub(crate) fn new(
    timeout: chrono::Duration,
    retry_delay: chrono::Duration,
    max_retries: u32,
  ) -> Self {
    Self {
      timeout: futures_time::time::Duration::from_millis(
        timeout.num_milliseconds().max(0) as u64,
      ),
      retry_delay: tokio::time::Duration::from_millis(
        retry_delay.num_milliseconds().max(0) as u64,
      ),
      max_retries: max_retries.max(1),
    }
  }

  pub(crate) fn timeout(self) -> futures_time::time::Duration {
    self.timeout
  }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
  #[error("Failed connecting after {attempts} attempts: {last}")]
  Exhausted { attempts: u32, last: String },
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub(crate) struct Manager {
  device: Arc<Device>,
  #[derivative(Debug = "ignore")]
  client: Arc<dyn Client>,
  params: Params,
  session: Option<Box<dyn Session>>,
  status: ConnectionStatus,
}

impl Manager {
  pub(crate) fn new(
    device: Arc<Device>,
    client: Arc<dyn Client>,
    params: Params,
  ) -> Self {
    Self {
      device,
      client,
      params,
      session: None,
      status: ConnectionStatus::default(),
    }
  }

  pub(crate) fn status(&self) -> &ConnectionStatus {
    &self.status
  }

  #[tracing::instrument(skip(self), fields(device = %self.device.id))]
  pub(crate) async fn ensure_connected(
    &mut self,
  ) -> Result<&mut Box<dyn Session>, ConnectError> {
    if self.session.is_none() {
      let session = self.connect().await?;
      self.session = Some(session);
    }

    match self.session.as_mut() {
      Some(session) => Ok(session),
      None => Err(ConnectError::Exhausted {
        attempts: 0,
        last: "session vanished".to_owned(),
      }),
    }
  }

  async fn connect(&mut self) -> Result<Box<dyn Session>, ConnectError> {
    self.status.state = ConnectionState::Connecting;
    self.status.retries = 0;

    loop {
      let attempt = self
        .client
        .open(&self.device.address, self.device.port)
        .timeout(self.params.timeout)
        .await;
      let error = match attempt {
        Ok(Ok(session)) => {
          self.status.state = ConnectionState::Connected;
          self.status.retries = 0;
          if let Some(error) = self.status.last_error.take() {
            tracing::info!(
              "Connection to {} recovered after {}",
              self.device.id,
              error
            );
          }
          tracing::debug!(
            "Connected to {} ({}) at {}:{}",
            self.device.id,
            self.device.name,
            self.device.address,
            self.device.port
          );

          return Ok(session);
        }
        Ok(Err(error)) => error,
        Err(timeout) => OpenError::Connect(timeout),
      };

      self.status.retries += 1;
      self.status.last_error = Some(error.to_string());
      tracing::warn!(
        "Failed connecting to {} attempt {}/{} {}",
        self.device.id,
        self.status.retries,
        self.params.max_retries,
        error
      );

      if self.status.retries >= self.params.max_retries {
        self.status.state = ConnectionState::Failed;
        return Err(ConnectError::Exhausted {
          attempts: self.status.retries,
          last: error.to_string(),
        });
      }

      tokio::time::sleep(self.params.retry_delay).await;
    }
  }

  #[tracing::instrument(skip(self), fields(device = %self.device.id))]
  pub(crate) async fn disconnect(&mut self, error: String) {
    self.close().await;
    self.status.state = ConnectionState::Disconnected;
    self.status.last_error = Some(error);
  }

  pub(crate) async fn close(&mut self) {
    if let Some(mut session) = self.session.take() {
      if let Err(error) = session.close().await {
        // NOTE: error -> trace because the session is usually already dead
        tracing::trace!("Failed closing session {}", error);
      }
    }
    if self.status.state == ConnectionState::Connected {
      self.status.state = ConnectionState::Disconnected;
    }
  }
}
