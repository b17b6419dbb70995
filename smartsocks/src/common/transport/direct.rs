// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
  net::TcpStream,
};

use super::{BoxedTransport, Transport, TransportError, TransportProvider};

pub const DIRECT_PROVIDER_NAME: &str = "direct";

/// Plain TCP dial with no tunnel in between; always available.
#[derive(Debug, Default)]
pub struct DirectProvider;

impl TransportProvider for DirectProvider {
  fn name(&self) -> &str {
    DIRECT_PROVIDER_NAME
  }

  fn is_available(&self) -> BoxFuture<'_, bool> {
    futures::future::ready(true).boxed()
  }

  fn connect<'a>(
    &'a self,
    host: &'a str,
    port: u16,
    timeout: Duration,
  ) -> BoxFuture<'a, Result<BoxedTransport, TransportError>> {
    async move {
      let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
          host: host.to_string(),
          port,
        })?
        .map_err(|cause| TransportError::Io {
          host: host.to_string(),
          port,
          cause,
        })?;
      stream.set_nodelay(true).ok();
      tracing::trace!(host, port, "direct transport established");
      Ok(Box::new(TcpTransport(stream)) as BoxedTransport)
    }
    .boxed()
  }
}

/// A [`TcpStream`] wearing the [`Transport`] contract.
pub struct TcpTransport(pub TcpStream);

impl AsyncRead for TcpTransport {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_read(cx, buf)
  }
}

impl AsyncWrite for TcpTransport {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.0).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_shutdown(cx)
  }
}

impl Transport for TcpTransport {
  fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
    async move {
      let _ = self.0.shutdown().await;
    }
    .boxed()
  }
}
