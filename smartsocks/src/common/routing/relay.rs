// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relay engine: full-duplex byte copy between one client connection and one
//! candidate remote transport, with enough bookkeeping to decide whether the
//! attempt was usable or should trigger fallback.
//!
//! The engine outlives individual attempts: the client's leading bytes are
//! buffered until a remote responds, so a failed attempt can be replayed
//! verbatim against the next candidate while the client connection stays
//! open and none the wiser.

use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::common::transport::BoxedTransport;

const RELAY_BUFFER_SIZE: usize = 4096;
/// An attempt ends once this long passes with no bytes moved either way.
const IDLE_CEILING: Duration = Duration::from_secs(10 * 60);
/// Individual reads time out this often purely to re-check the idle ceiling.
const READ_POLL: Duration = Duration::from_secs(15);
/// Ceiling on the replayable client prefix. Past this, a faithful replay is
/// impossible and the connection becomes non-retryable.
pub const REPLAY_CAP: usize = 256 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  #[error("relay resumed after a response was already observed")]
  Resumed,
  #[error("relay resumed after its local side was closed")]
  LocalClosed,
  #[error("relay peer task failed")]
  PeerTask(
    #[from]
    #[source]
    tokio::task::JoinError,
  ),
}

/// What the router should do with the attempt that just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayVerdict {
  /// The attempt is acceptable: the client never sent anything, or at least
  /// one byte came back from the remote.
  Done,
  /// The client sent data and nothing ever came back; try the next candidate.
  TryNext,
}

/// Per-connection relay state, reused across every failover attempt for that
/// connection.
pub struct Piper<L> {
  local_read: ReadHalf<L>,
  local_write: Option<WriteHalf<L>>,
  replay: Vec<u8>,
  replay_overflowed: bool,
  sent: Arc<AtomicU64>,
  received: Arc<AtomicU64>,
}

impl<L> Piper<L>
where
  L: AsyncRead + AsyncWrite + Send + 'static,
{
  pub fn new(local: L) -> Self {
    let (local_read, local_write) = tokio::io::split(local);
    Self {
      local_read,
      local_write: Some(local_write),
      replay: Vec::new(),
      replay_overflowed: false,
      sent: Arc::new(AtomicU64::new(0)),
      received: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn sent_bytes(&self) -> u64 {
    self.sent.load(Ordering::Acquire)
  }

  pub fn received_bytes(&self) -> u64 {
    self.received.load(Ordering::Acquire)
  }

  /// Runs one relay attempt against `remote`, which is always closed before
  /// returning. Re-entry after a response has been observed is a contract
  /// violation and fails loudly.
  pub async fn pipe(&mut self, remote: BoxedTransport) -> Result<RelayVerdict, RelayError> {
    if self.received_bytes() > 0 {
      let remote_close = remote.close();
      remote_close.await;
      return Err(RelayError::Resumed);
    }
    let local_write = match self.local_write.take() {
      Some(half) => half,
      None => {
        remote.close().await;
        return Err(RelayError::LocalClosed);
      }
    };

    let (remote_read, mut remote_write) = tokio::io::split(remote);
    let done = CancellationToken::new();
    let activity = Activity::start();

    let downlink = tokio::spawn(run_downlink(
      remote_read,
      local_write,
      self.received.clone(),
      activity.clone(),
      done.clone(),
    ));
    self
      .run_uplink(&mut remote_write, &activity, &done)
      .await;
    done.cancel();
    let (remote_read, local_write) = match downlink.await {
      Ok(halves) => halves,
      Err(join_error) => {
        // The local write half is lost with the panicked task; nothing left
        // to relay on this connection.
        let _ = remote_write.shutdown().await;
        return Err(RelayError::PeerTask(join_error));
      }
    };
    self.local_write = Some(local_write);

    let remote = remote_read.unsplit(remote_write);
    remote.close().await;

    let sent = self.sent_bytes();
    let received = self.received_bytes();
    tracing::debug!(sent, received, "relay attempt ended");

    if sent == 0 || received > 0 || self.replay_overflowed {
      Ok(RelayVerdict::Done)
    } else {
      Ok(RelayVerdict::TryNext)
    }
  }

  /// Closes the local side. Called once the connection is resolved; never
  /// while an attempt may still be replayed elsewhere.
  pub async fn shutdown_local(&mut self) {
    if let Some(mut half) = self.local_write.take() {
      let _ = half.shutdown().await;
    }
  }

  async fn run_uplink<W>(&mut self, remote_write: &mut W, activity: &Activity, done: &CancellationToken)
  where
    W: AsyncWrite + Send + Unpin,
  {
    // Replay bytes from earlier attempts before any fresh client bytes, so
    // failed candidates are invisible to the destination.
    if !self.replay.is_empty() {
      if let Err(error) = write_chunk(remote_write, &self.replay).await {
        tracing::debug!(%error, "uplink replay ended");
        return;
      }
    }

    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    loop {
      let read = tokio::select! {
        _ = done.cancelled() => break,
        read = tokio::time::timeout(READ_POLL, self.local_read.read(&mut buf)) => read,
      };
      match read {
        Err(_elapsed) => {
          if activity.idle_for() > IDLE_CEILING {
            tracing::debug!("uplink idle ceiling reached");
            break;
          }
        }
        Ok(Ok(0)) => break,
        Ok(Ok(n)) => {
          activity.touch();
          if self.received.load(Ordering::Acquire) == 0 && !self.replay_overflowed {
            if self.replay.len() + n > REPLAY_CAP {
              tracing::warn!(
                buffered = self.replay.len(),
                "replay buffer cap exceeded, connection is no longer retryable"
              );
              self.replay_overflowed = true;
              self.replay = Vec::new();
            } else {
              self.replay.extend_from_slice(&buf[..n]);
            }
          }
          self.sent.fetch_add(n as u64, Ordering::AcqRel);
          if let Err(error) = write_chunk(remote_write, &buf[..n]).await {
            tracing::debug!(%error, "uplink ended");
            break;
          }
        }
        Ok(Err(error)) => {
          tracing::debug!(%error, "uplink read ended");
          break;
        }
      }
    }
  }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(chunk).await?;
  writer.flush().await
}

/// Remote-to-local forwarding, run as the one extra worker per attempt.
/// Returns both halves so the attempt can rejoin and close the remote while
/// keeping the local write half for later attempts.
async fn run_downlink<R, W>(
  mut remote_read: R,
  mut local_write: W,
  received: Arc<AtomicU64>,
  activity: Activity,
  done: CancellationToken,
) -> (R, W)
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  let mut buf = [0u8; RELAY_BUFFER_SIZE];
  loop {
    let read = tokio::select! {
      _ = done.cancelled() => break,
      read = tokio::time::timeout(READ_POLL, remote_read.read(&mut buf)) => read,
    };
    match read {
      Err(_elapsed) => {
        if activity.idle_for() > IDLE_CEILING {
          tracing::debug!("downlink idle ceiling reached");
          break;
        }
      }
      Ok(Ok(0)) => break,
      Ok(Ok(n)) => {
        activity.touch();
        received.fetch_add(n as u64, Ordering::AcqRel);
        if let Err(error) = write_chunk(&mut local_write, &buf[..n]).await {
          tracing::debug!(%error, "downlink ended");
          break;
        }
      }
      Ok(Err(error)) => {
        tracing::debug!(%error, "downlink read ended");
        break;
      }
    }
  }
  // Either direction finishing ends the whole attempt.
  done.cancel();
  (remote_read, local_write)
}

/// Shared last-activity clock for the two directions of one attempt.
#[derive(Clone)]
struct Activity {
  epoch: Instant,
  last_millis: Arc<AtomicU64>,
}

impl Activity {
  fn start() -> Self {
    Self {
      epoch: Instant::now(),
      last_millis: Arc::new(AtomicU64::new(0)),
    }
  }

  fn touch(&self) {
    let elapsed = self.epoch.elapsed().as_millis() as u64;
    self.last_millis.store(elapsed, Ordering::Release);
  }

  fn idle_for(&self) -> Duration {
    let now = self.epoch.elapsed().as_millis() as u64;
    let last = self.last_millis.load(Ordering::Acquire);
    Duration::from_millis(now.saturating_sub(last))
  }
}
