// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Accept-loop shell around the SOCKS5 front-end.
//!
//! One [`Server`] owns one listening socket's worth of policy: whether direct
//! connections are permitted and how many connections may be in flight at
//! once. Connections are isolated tasks; a misbehaving client never takes the
//! accept loop down with it.

use std::{
  sync::atomic::{AtomicU64, Ordering},
  sync::Arc,
  time::Duration,
};

use futures::StreamExt;
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpListener,
  sync::Semaphore,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  routing::{RelayError, RouteOutcome, Router},
  socks5::{self, HandshakeError},
};

/// Ceiling on the whole greeting-plus-request exchange; clients that stall
/// mid-handshake are cut loose rather than pinning a connection slot.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error("socks handshake did not finish in time")]
  HandshakeTimeout,
  #[error(transparent)]
  Handshake(#[from] HandshakeError),
  #[error("relay failure")]
  Relay(#[from] RelayError),
}

pub struct Server {
  router: Arc<Router>,
  allow_direct: bool,
  limiter: Arc<Semaphore>,
  next_connection_id: AtomicU64,
}

impl Server {
  pub fn new(router: Arc<Router>, allow_direct: bool, max_connections: usize) -> Self {
    Self {
      router,
      allow_direct,
      limiter: Arc::new(Semaphore::new(max_connections)),
      next_connection_id: AtomicU64::new(0),
    }
  }

  /// Runs the accept loop until the listener fails terminally or `shutdown`
  /// fires. In-flight connections are not awaited on shutdown; dropping the
  /// runtime (or the process exiting) ends them.
  pub async fn serve(
    &self,
    listener: TcpListener,
    shutdown: CancellationToken,
  ) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(
      addr = %local_addr,
      allow_direct = self.allow_direct,
      "socks5 listener started"
    );
    let mut incoming = TcpListenerStream::new(listener);
    loop {
      let permit = tokio::select! {
        _ = shutdown.cancelled() => break,
        permit = self.limiter.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };
      let stream = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = incoming.next() => match accepted {
          Some(Ok(stream)) => stream,
          Some(Err(error)) => {
            tracing::error!(?error, "accept failure");
            continue;
          }
          None => break,
        },
      };
      stream.set_nodelay(true).ok();
      let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
      let peer = stream.peer_addr().ok();
      let span = tracing::span!(tracing::Level::DEBUG, "connection", id, peer = ?peer);
      let router = Arc::clone(&self.router);
      let allow_direct = self.allow_direct;
      tokio::spawn(
        async move {
          if let Err(error) = handle_connection(stream, router, allow_direct).await {
            tracing::warn!(error = %error, "connection ended with error");
          }
          drop(permit);
        }
        .instrument(span),
      );
    }
    tracing::info!(addr = %local_addr, "socks5 listener stopped");
    Ok(())
  }
}

/// Drives one client from SOCKS5 greeting through relay completion. The
/// success reply is written before routing begins; routing failures surface
/// to the client only as the connection closing.
async fn handle_connection<S>(
  mut stream: S,
  router: Arc<Router>,
  allow_direct: bool,
) -> Result<(), ConnectionError>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
    socks5::greet(&mut stream).await?;
    socks5::read_connect_request(&mut stream).await
  })
  .await
  .map_err(|_| ConnectionError::HandshakeTimeout)??;
  socks5::write_success_reply(&mut stream).await?;
  tracing::debug!(host = %request.host, port = request.port, "connect request accepted");

  match router
    .route(stream, &request.host, request.port, allow_direct)
    .await?
  {
    RouteOutcome::Relayed { provider } => {
      tracing::debug!(provider = %provider, "relay complete");
    }
    RouteOutcome::Exhausted => {
      tracing::warn!(
        host = %request.host,
        port = request.port,
        "no transport could serve destination"
      );
    }
  }
  Ok(())
}
