// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Transport contracts shared by every provider variant.
//!
//! A [`TransportProvider`] is a named strategy for reaching arbitrary
//! `(host, port)` destinations; a [`Transport`] is one open duplex byte stream
//! it produced. The routing layer depends only on these traits and never on a
//! concrete provider.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod direct;
pub mod ssh;

pub use self::direct::DirectProvider;
pub use self::ssh::SshTransportProvider;

/// Boxed transport as handed to the relay engine, which owns it exclusively
/// for the duration of one relay attempt and closes it afterwards.
pub type BoxedTransport = Box<dyn Transport + 'static>;

/// An open duplex byte stream to one destination.
///
/// Closing is explicit rather than drop-based so providers can release pooled
/// resources (an SSH channel's session slot) on the async path.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
  fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("i/o failure reaching {host}:{port}")]
  Io {
    host: String,
    port: u16,
    #[source]
    cause: std::io::Error,
  },
  #[error("timed out connecting to {host}:{port}")]
  ConnectTimeout { host: String, port: u16 },
  #[error("ssh endpoint rejected credentials for user {user}")]
  AuthenticationRejected { user: String },
  #[error("ssh session failure")]
  Ssh(
    #[from]
    #[source]
    russh::Error,
  ),
}

/// A named strategy for producing transports.
///
/// `is_available` is a fast, non-authoritative readiness check the router uses
/// to decide whether a candidate is worth attempting; `connect` is the
/// authoritative (and fallible) operation.
pub trait TransportProvider: Send + Sync {
  /// Stable identifier used for sticky-route bookkeeping and logging.
  fn name(&self) -> &str;

  fn is_available(&self) -> BoxFuture<'_, bool>;

  fn connect<'a>(
    &'a self,
    host: &'a str,
    port: u16,
    timeout: Duration,
  ) -> BoxFuture<'a, Result<BoxedTransport, TransportError>>;
}
