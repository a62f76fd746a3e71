use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_modbus::{client::Context, prelude::Reader};

use super::*;

// NOTE: D registers are served as holding registers by the gateway

#[derive(Debug, Clone, Default)]
pub(crate) struct Client {}

impl Client {
  pub(crate) fn new() -> Self {
    Self {}
  }
}

#[derive(Debug)]
pub(crate) struct Session {
  socket: SocketAddr,
  ctx: Option<Context>,
}

#[async_trait::async_trait]
impl super::Client for Client {
  #[tracing::instrument(skip(self))]
  async fn open(
    &self,
    address: &str,
    port: u16,
  ) -> Result<Box<dyn super::Session>, OpenError> {
    let socket = tokio::net::lookup_host((address, port))
      .await?
      .next()
      .ok_or_else(|| OpenError::Resolve(format!("{address}:{port}")))?;
    let stream = TcpStream::connect(socket).await?;
    let ctx = tokio_modbus::prelude::tcp::attach(stream);

    tracing::trace!("Opened session to {}", socket);

    Ok(Box::new(Session {
      socket,
      ctx: Some(ctx),
    }))
  }
}

#[async_trait::async_trait]
impl super::Session for Session {
  async fn read_words(
    &mut self,
    start: RegisterAddress,
    count: u16,
  ) -> Result<Words, ReadError> {
    let ctx = match self.ctx.as_mut() {
      Some(ctx) => ctx,
      None => {
        return Err(ReadError::Io(std::io::Error::new(
          std::io::ErrorKind::NotConnected,
          "session closed",
        )))
      }
    };

    let address = u16::try_from(start.index())
      .map_err(|_| ReadError::Rejected(format!("address {start}")))?;
    let words = ctx.read_holding_registers(address, count).await?;

    Ok(words)
  }

  async fn close(&mut self) -> Result<(), CloseError> {
    if let Some(mut ctx) = self.ctx.take() {
      ctx.disconnect().await?;
      tracing::trace!("Closed session to {}", self.socket);
    }

    Ok(())
  }
}
