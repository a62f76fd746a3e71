pub(crate) mod modbus;

use std::fmt::Debug;

use super::registry::RegisterAddress;

pub(crate) type Words = Vec<u16>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum OpenError {
  #[error("Failed to connect")]
  Connect(#[from] std::io::Error),

  #[error("Failed to resolve {0}")]
  Resolve(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadError {
  #[error("Read failed")]
  Io(#[from] std::io::Error),

  #[error("Device rejected the read with {0}")]
  Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CloseError {
  #[error("Close failed")]
  Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub(crate) trait Client: Debug + Send + Sync {
  async fn open(
    &self,
    address: &str,
    port: u16,
  ) -> Result<Box<dyn Session>, OpenError>;
}

#[async_trait::async_trait]
pub(crate) trait Session: Debug + Send {
  async fn read_words(
    &mut self,
    start: RegisterAddress,
    count: u16,
  ) -> Result<Words, ReadError>;

  async fn close(&mut self) -> Result<(), CloseError>;
}
