// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SOCKS5 proxy frontend supporting CONNECT and UDP ASSOCIATE without authentication
use std::{
  net::{Ipv4Addr, SocketAddr},
  time::Duration,
};

use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::{TcpListener, UdpSocket},
};
use tokio_util::sync::CancellationToken;

use super::{accept_loop, ArcOpener, StreamOpener};
use crate::{
  common::protocol::{
    socks::{self, ReadAddressError, ReplyCode},
    Destination, ProtocolError, TunnelError, UdpRelayMessage,
  },
  util::proxy_bidirectional,
};

pub const DEFAULT_SOCKS_BIND: &str = "127.0.0.1:1080";

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Socks5Error {
  #[error("IO failure on the client connection: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error("Client offered no acceptable authentication method")]
  NoAcceptableMethod,
  #[error("Unsupported SOCKS command {0:#04x}")]
  UnsupportedCommand(u8),
  #[error(transparent)]
  Tunnel(#[from] TunnelError),
}

impl From<ReadAddressError> for Socks5Error {
  fn from(error: ReadAddressError) -> Self {
    match error {
      ReadAddressError::Io(error) => Socks5Error::Io(error),
      ReadAddressError::Protocol(error) => Socks5Error::Protocol(error),
    }
  }
}

/// A request that passed the greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Request {
  Connect(Destination),
  UdpAssociate,
}

/// Runs the method negotiation, accepting only "no authentication"
pub async fn negotiate_method<S>(client: &mut S) -> Result<(), Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = client.read_u8().await?;
  if version != socks::SOCKS_VERSION {
    return Err(ProtocolError::UnsupportedVersion(version).into());
  }
  let method_count = client.read_u8().await? as usize;
  let mut methods = vec![0u8; method_count];
  client.read_exact(&mut methods).await?;
  if !methods.contains(&socks::METHOD_NO_AUTHENTICATION) {
    client
      .write_all(&[socks::SOCKS_VERSION, socks::METHOD_NONE_ACCEPTABLE])
      .await?;
    client.flush().await?;
    return Err(Socks5Error::NoAcceptableMethod);
  }
  client
    .write_all(&[socks::SOCKS_VERSION, socks::METHOD_NO_AUTHENTICATION])
    .await?;
  client.flush().await?;
  Ok(())
}

/// Reads `VER CMD RSV ATYP DST.ADDR DST.PORT`
///
/// Unsupported commands are answered with a `0x07` reply before returning.
pub async fn read_request<S>(client: &mut S) -> Result<Socks5Request, Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut header = [0u8; 3];
  client.read_exact(&mut header).await?;
  let [version, command, _reserved] = header;
  if version != socks::SOCKS_VERSION {
    return Err(ProtocolError::UnsupportedVersion(version).into());
  }
  let destination = match socks::read_address(client).await {
    Ok(destination) => destination,
    Err(ReadAddressError::Protocol(error)) => {
      send_reply(client, socks::unbound_reply(ReplyCode::GeneralFailure)).await?;
      return Err(error.into());
    }
    Err(error) => return Err(error.into()),
  };
  match command {
    socks::COMMAND_CONNECT => Ok(Socks5Request::Connect(destination)),
    socks::COMMAND_UDP_ASSOCIATE => Ok(Socks5Request::UdpAssociate),
    other => {
      send_reply(client, socks::unbound_reply(ReplyCode::CommandNotSupported)).await?;
      Err(Socks5Error::UnsupportedCommand(other))
    }
  }
}

async fn send_reply<S: AsyncWrite + Unpin>(client: &mut S, reply: [u8; 10]) -> std::io::Result<()> {
  client.write_all(&reply).await?;
  client.flush().await
}

/// Serves one client connection from greeting to teardown
pub async fn handle_connection<S, O>(
  mut client: S,
  opener: &O,
  open_timeout: Duration,
) -> Result<(), Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
  O: StreamOpener + ?Sized,
{
  negotiate_method(&mut client).await?;
  match read_request(&mut client).await? {
    Socks5Request::Connect(destination) => {
      connect(client, opener, destination, open_timeout).await
    }
    Socks5Request::UdpAssociate => associate(client, opener, open_timeout).await,
  }
}

async fn connect<S, O>(
  mut client: S,
  opener: &O,
  destination: Destination,
  open_timeout: Duration,
) -> Result<(), Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
  O: StreamOpener + ?Sized,
{
  tracing::debug!(%destination, "SOCKS5 CONNECT requested");
  let mut stream = match opener.open_stream(destination.clone(), open_timeout).await {
    Ok(stream) => stream,
    Err(error) => {
      tracing::info!(%destination, %error, "SOCKS5 CONNECT failed");
      let _ = send_reply(&mut client, socks::unbound_reply(ReplyCode::GeneralFailure)).await;
      return Err(error.into());
    }
  };
  send_reply(&mut client, socks::unbound_reply(ReplyCode::Succeeded)).await?;
  let (sent, received) = proxy_bidirectional(&mut client, &mut stream).await?;
  tracing::debug!(stream_id = %stream.id(), sent, received, "SOCKS5 tunnel finished");
  Ok(())
}

/// Relays datagrams between a loopback UDP socket and a tunneled association
///
/// Lives as long as the controlling TCP connection.
async fn associate<S, O>(mut client: S, opener: &O, open_timeout: Duration) -> Result<(), Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
  O: StreamOpener + ?Sized,
{
  let socket = match UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
    Ok(socket) => socket,
    Err(error) => {
      let _ = send_reply(&mut client, socks::unbound_reply(ReplyCode::GeneralFailure)).await;
      return Err(error.into());
    }
  };
  let mut association = match opener.open_association(open_timeout).await {
    Ok(association) => association,
    Err(error) => {
      tracing::info!(%error, "SOCKS5 UDP ASSOCIATE failed");
      let _ = send_reply(&mut client, socks::unbound_reply(ReplyCode::GeneralFailure)).await;
      return Err(error.into());
    }
  };
  let bound = socket.local_addr()?;
  send_reply(
    &mut client,
    socks::reply(ReplyCode::Succeeded, Ipv4Addr::LOCALHOST, bound.port()),
  )
  .await?;
  tracing::debug!(stream_id = %association.id(), %bound, "SOCKS5 UDP association ready");

  let mut last_source: Option<SocketAddr> = None;
  let mut datagram = vec![0u8; MAX_DATAGRAM];
  let mut control = [0u8; 512];
  loop {
    tokio::select! {
      received = socket.recv_from(&mut datagram) => {
        let (length, source) = received?;
        last_source = Some(source);
        match socks::decode_udp_request(&datagram[..length]) {
          Ok(Some(request)) => {
            let message = UdpRelayMessage::new(
              request.destination.host,
              request.destination.port,
              request.payload,
            );
            association.send(message)?;
          }
          Ok(None) => {
            tracing::trace!(%source, "Dropping fragmented or IPv6 datagram");
          }
          Err(error) => {
            tracing::debug!(%source, %error, "Dropping malformed SOCKS5 datagram");
          }
        }
      }
      relayed = association.recv() => {
        let message = match relayed? {
          Some(message) => message,
          None => break,
        };
        let target = match last_source {
          Some(target) => target,
          None => {
            tracing::trace!("Dropping relayed datagram before any client datagram");
            continue;
          }
        };
        match socks::encode_udp_response(&message.host, message.port, &message.payload) {
          Ok(response) => {
            socket.send_to(&response, target).await?;
          }
          Err(error) => {
            tracing::debug!(%error, "Dropping relayed datagram that cannot be encoded");
          }
        }
      }
      read = client.read(&mut control) => {
        match read {
          Ok(0) | Err(_) => break,
          Ok(_) => {}
        }
      }
    }
  }
  tracing::debug!(stream_id = %association.id(), "SOCKS5 UDP association closed");
  Ok(())
}

/// Runs the frontend on `listener` until `shutdown` fires
pub async fn serve(
  listener: TcpListener,
  opener: ArcOpener,
  open_timeout: Duration,
  shutdown: CancellationToken,
) {
  if let Ok(address) = listener.local_addr() {
    tracing::info!(%address, "SOCKS5 proxy listening");
  }
  accept_loop(listener, shutdown, move |client, _peer| {
    let opener = opener.clone();
    async move {
      if let Err(error) = handle_connection(client, opener.as_ref(), open_timeout).await {
        tracing::debug!(%error, "SOCKS5 connection ended with error");
      }
    }
  })
  .await
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use bytes::Bytes;
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  use super::*;
  use crate::common::frontend::testing::{echo_tunnel, REFUSED_PORT};

  const TIMEOUT: Duration = Duration::from_secs(5);

  async fn greet(client: &mut DuplexStream) {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);
  }

  async fn read_reply(client: &mut DuplexStream) -> [u8; 10] {
    let mut reply = [0u8; 10];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
      .await
      .unwrap()
      .unwrap();
    reply
  }

  fn connect_request(ip: [u8; 4], port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&port.to_be_bytes());
    request
  }

  #[tokio::test]
  async fn greeting_without_no_auth_is_refused() {
    let (mut client, server) = tokio::io::duplex(1024);
    let handle = echo_tunnel();
    let task = tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await });
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut response))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(response, vec![0x05, 0xFF]);
    assert!(matches!(
      task.await.unwrap(),
      Err(Socks5Error::NoAcceptableMethod)
    ));
  }

  #[tokio::test]
  async fn connect_to_reachable_destination() {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let handle = echo_tunnel();
    let task = tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await });
    greet(&mut client).await;
    client
      .write_all(&connect_request([10, 0, 0, 1], 80))
      .await
      .unwrap();
    assert_eq!(
      read_reply(&mut client).await,
      [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    let payload = Vec::from(*b"GET / HTTP/1.0\r\n\r\n").repeat(64);
    client.write_all(&payload).await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut echoed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(echoed, payload);
    tokio::time::timeout(TIMEOUT, task)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn connect_to_unreachable_destination() {
    let (mut client, server) = tokio::io::duplex(1024);
    let handle = echo_tunnel();
    let task = {
      let handle = handle.clone();
      tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await })
    };
    greet(&mut client).await;
    client
      .write_all(&connect_request([10, 0, 0, 1], REFUSED_PORT))
      .await
      .unwrap();
    assert_eq!(
      read_reply(&mut client).await,
      [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    assert!(matches!(
      task.await.unwrap(),
      Err(Socks5Error::Tunnel(TunnelError::DialFailed))
    ));
    assert_eq!(handle.active_streams().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn unsupported_command_is_refused() {
    let (mut client, server) = tokio::io::duplex(1024);
    let handle = echo_tunnel();
    let task = tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await });
    greet(&mut client).await;
    // BIND
    client
      .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
      .await
      .unwrap();
    assert_eq!(
      read_reply(&mut client).await,
      [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    assert!(matches!(
      task.await.unwrap(),
      Err(Socks5Error::UnsupportedCommand(0x02))
    ));
  }

  #[tokio::test]
  async fn udp_associate_relays_datagrams() {
    let (mut client, server) = tokio::io::duplex(1024);
    let handle = echo_tunnel();
    let task = {
      let handle = handle.clone();
      tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await })
    };
    greet(&mut client).await;
    client
      .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
      .await
      .unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(&reply[..8], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1]);
    let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(relay_port, 0);

    let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let mut request = vec![0x00, 0x00, 0x00, 0x01, 10, 0, 0, 53, 0, 53];
    request.extend_from_slice(b"query");
    local
      .send_to(&request, (Ipv4Addr::LOCALHOST, relay_port))
      .await
      .unwrap();

    let mut buf = [0u8; 1024];
    let (length, _) = tokio::time::timeout(TIMEOUT, local.recv_from(&mut buf))
      .await
      .unwrap()
      .unwrap();
    let expected = socks::encode_udp_response("10.0.0.53", 53, b"query").unwrap();
    assert_eq!(Bytes::copy_from_slice(&buf[..length]), expected);

    drop(client);
    tokio::time::timeout(TIMEOUT, task)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    tokio::time::timeout(TIMEOUT, async {
      while handle.active_streams().await.unwrap() != 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
  }
}
