// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Minimal SOCKS5 front-end codec: method negotiation, CONNECT request
//! decoding, and the fixed success reply. Only the slice of RFC 1928 the
//! proxy actually speaks is implemented; everything else is a
//! [`ProtocolViolation`].

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// The client sent bytes outside the supported protocol subset. Fatal to the
/// connection that produced it, harmless to everything else.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
  #[error("socks version {0:#04x} is not supported")]
  Version(u8),
  #[error("no acceptable authentication method offered")]
  NoAcceptableMethod,
  #[error("command {0:#04x} is not supported")]
  Command(u8),
  #[error("reserved byte must be zero, got {0:#04x}")]
  Reserved(u8),
  #[error("address type {0:#04x} is not supported")]
  AddressType(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error(transparent)]
  Violation(#[from] ProtocolViolation),
  #[error("i/o failure during socks handshake")]
  Io(#[from] std::io::Error),
}

/// Destination named by a CONNECT request. IP literals are rendered to their
/// textual form so the routing layer deals in host strings uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
  pub host: String,
  pub port: u16,
}

/// Performs method negotiation: requires version 5 and the "no
/// authentication" method among the client's offers, then acknowledges it.
pub async fn greet<S>(stream: &mut S) -> Result<(), HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != SOCKS_VERSION {
    return Err(ProtocolViolation::Version(version).into());
  }
  let method_count = stream.read_u8().await? as usize;
  let mut methods = vec![0u8; method_count];
  stream.read_exact(&mut methods).await?;
  if !methods.contains(&METHOD_NO_AUTH) {
    return Err(ProtocolViolation::NoAcceptableMethod.into());
  }
  stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
  stream.flush().await?;
  Ok(())
}

/// Reads the request that follows a successful greeting. Only CONNECT is
/// accepted; BIND and UDP ASSOCIATE are violations.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<ConnectRequest, HandshakeError>
where
  S: AsyncRead + Unpin,
{
  let version = stream.read_u8().await?;
  if version != SOCKS_VERSION {
    return Err(ProtocolViolation::Version(version).into());
  }
  let command = stream.read_u8().await?;
  if command != CMD_CONNECT {
    return Err(ProtocolViolation::Command(command).into());
  }
  let reserved = stream.read_u8().await?;
  if reserved != 0 {
    return Err(ProtocolViolation::Reserved(reserved).into());
  }

  let address_type = stream.read_u8().await?;
  let host = match address_type {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      stream.read_exact(&mut octets).await?;
      Ipv4Addr::from(octets).to_string()
    }
    ATYP_DOMAIN => {
      let len = stream.read_u8().await? as usize;
      let mut name = vec![0u8; len];
      stream.read_exact(&mut name).await?;
      String::from_utf8_lossy(&name).into_owned()
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      stream.read_exact(&mut octets).await?;
      Ipv6Addr::from(octets).to_string()
    }
    other => return Err(ProtocolViolation::AddressType(other).into()),
  };
  let port = stream.read_u16().await?;
  Ok(ConnectRequest { host, port })
}

/// Acknowledges the CONNECT before any routing is attempted. The bound
/// address field is a fixed placeholder; clients ignore it for CONNECT.
pub async fn write_success_reply<S>(stream: &mut S) -> Result<(), HandshakeError>
where
  S: AsyncWrite + Unpin,
{
  stream
    .write_all(&[
      SOCKS_VERSION,
      0x00,
      0x00,
      ATYP_IPV4,
      0x00,
      0x00,
      0x00,
      0x00,
      0xFF,
      0xFF,
    ])
    .await?;
  stream.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::*;

  #[tokio::test]
  async fn greeting_accepts_no_auth_among_offers() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
    greet(&mut server).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
  }

  #[tokio::test]
  async fn greeting_rejects_wrong_version() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let err = greet(&mut server).await.unwrap_err();
    assert!(matches!(
      err,
      HandshakeError::Violation(ProtocolViolation::Version(0x04))
    ));
  }

  #[tokio::test]
  async fn greeting_requires_no_auth_method() {
    let (mut client, mut server) = duplex(64);
    // GSSAPI and username/password only.
    client.write_all(&[0x05, 0x02, 0x01, 0x02]).await.unwrap();
    let err = greet(&mut server).await.unwrap_err();
    assert!(matches!(
      err,
      HandshakeError::Violation(ProtocolViolation::NoAcceptableMethod)
    ));
  }

  #[tokio::test]
  async fn connect_request_with_domain_address() {
    let (mut client, mut server) = duplex(64);
    let mut request = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let parsed = read_connect_request(&mut server).await.unwrap();
    assert_eq!(
      parsed,
      ConnectRequest {
        host: "example.com".to_string(),
        port: 443,
      }
    );
  }

  #[tokio::test]
  async fn connect_request_with_ipv4_address() {
    let (mut client, mut server) = duplex(64);
    let mut request = vec![0x05, 0x01, 0x00, ATYP_IPV4, 192, 168, 0, 1];
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let parsed = read_connect_request(&mut server).await.unwrap();
    assert_eq!(parsed.host, "192.168.0.1");
    assert_eq!(parsed.port, 80);
  }

  #[tokio::test]
  async fn connect_request_with_ipv6_address() {
    let (mut client, mut server) = duplex(64);
    let mut request = vec![0x05, 0x01, 0x00, ATYP_IPV6];
    request.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    request.extend_from_slice(&8080u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let parsed = read_connect_request(&mut server).await.unwrap();
    assert_eq!(parsed.host, "::1");
    assert_eq!(parsed.port, 8080);
  }

  #[tokio::test]
  async fn bind_command_is_rejected() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&[0x05, 0x02, 0x00]).await.unwrap();
    let err = read_connect_request(&mut server).await.unwrap_err();
    assert!(matches!(
      err,
      HandshakeError::Violation(ProtocolViolation::Command(0x02))
    ));
  }

  #[tokio::test]
  async fn nonzero_reserved_byte_is_rejected() {
    let (mut client, mut server) = duplex(64);
    client.write_all(&[0x05, 0x01, 0x07]).await.unwrap();
    let err = read_connect_request(&mut server).await.unwrap_err();
    assert!(matches!(
      err,
      HandshakeError::Violation(ProtocolViolation::Reserved(0x07))
    ));
  }

  #[tokio::test]
  async fn success_reply_has_fixed_shape() {
    let (mut client, mut server) = duplex(64);
    write_success_reply(&mut server).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
      reply,
      [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]
    );
  }
}
