// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Host-side handling of opens: authorize, dial, and bridge sockets into the tunnel
use std::{
  net::{Ipv4Addr, SocketAddr},
  sync::Arc,
  time::Duration,
};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{
  authentication::{ArcAuthenticator, AuthenticationError},
  mux::{IncomingOpen, IncomingOpens, MultiplexerHandle, MuxStream, UdpAssociation},
  protocol::{Destination, OpenTarget, StreamId, TunnelError, UdpRelayMessage},
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER: usize = 32 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Outbound socket creation, separated so tests can observe or refuse dials
#[cfg_attr(test, mockall::automock)]
pub trait Dialer: Send + Sync {
  fn dial_tcp(&self, destination: &Destination) -> BoxFuture<'static, std::io::Result<TcpStream>>;

  fn bind_udp(&self) -> BoxFuture<'static, std::io::Result<UdpSocket>>;
}

/// Dials with tokio sockets, bounding each TCP connect by `dial_timeout`
#[derive(Debug, Clone)]
pub struct TokioDialer {
  dial_timeout: Duration,
}

impl TokioDialer {
  pub fn new(dial_timeout: Duration) -> Self {
    Self { dial_timeout }
  }
}

impl Default for TokioDialer {
  fn default() -> Self {
    Self::new(DEFAULT_DIAL_TIMEOUT)
  }
}

impl Dialer for TokioDialer {
  fn dial_tcp(&self, destination: &Destination) -> BoxFuture<'static, std::io::Result<TcpStream>> {
    let destination = destination.clone();
    let dial_timeout = self.dial_timeout;
    async move {
      let connect = TcpStream::connect((destination.host.as_str(), destination.port));
      match tokio::time::timeout(dial_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          format!("Dial to {} timed out", destination),
        )),
      }
    }
    .boxed()
  }

  fn bind_udp(&self) -> BoxFuture<'static, std::io::Result<UdpSocket>> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).boxed()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  #[error("Open rejected: {0}")]
  Unauthorized(#[from] AuthenticationError),
  #[error("Failed to reach {destination}: {source}")]
  Dial {
    destination: Destination,
    source: std::io::Error,
  },
  #[error("Socket failure: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Tunnel(#[from] TunnelError),
}

/// How a bridged TCP stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
  /// Both directions closed gracefully
  Finished,
  /// No bytes moved in either direction within the idle timeout
  IdleTimeout,
  /// The destination socket failed; the stream was reset
  SocketFailed,
  /// The remote side reset the stream or the channel was lost
  TunnelFailed,
}

pub struct HostDispatcher {
  dialer: Arc<dyn Dialer>,
  authenticator: ArcAuthenticator,
  idle_timeout: Duration,
}

impl std::fmt::Debug for HostDispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HostDispatcher")
      .field("authenticator", &self.authenticator)
      .field("idle_timeout", &self.idle_timeout)
      .finish_non_exhaustive()
  }
}

impl HostDispatcher {
  pub fn new(
    dialer: Arc<dyn Dialer>,
    authenticator: ArcAuthenticator,
    idle_timeout: Duration,
  ) -> Self {
    Self {
      dialer,
      authenticator,
      idle_timeout,
    }
  }

  /// Serves opens from one multiplexer until it closes or `shutdown` fires
  pub async fn run(
    self: Arc<Self>,
    multiplexer: MultiplexerHandle,
    mut incoming: IncomingOpens,
    shutdown: CancellationToken,
  ) {
    loop {
      let open = tokio::select! {
        _ = shutdown.cancelled() => break,
        open = incoming.recv() => match open {
          Some(open) => open,
          None => break,
        },
      };
      let span = tracing::debug_span!("open", stream_id = %open.id);
      let this = self.clone();
      let multiplexer = multiplexer.clone();
      tokio::task::spawn(
        async move {
          if let Err(error) = this.handle_open(&multiplexer, open).await {
            tracing::debug!(%error, "Open ended with error");
          }
        }
        .instrument(span),
      );
    }
    tracing::debug!("Dispatcher stopped");
  }

  pub async fn handle_open(
    &self,
    multiplexer: &MultiplexerHandle,
    open: IncomingOpen,
  ) -> Result<(), DispatchError> {
    let IncomingOpen { id, request } = open;
    if let Err(error) = self.authenticator.authenticate(&request).await {
      tracing::warn!(stream_id = %id, %error, "Rejecting unauthorized open");
      multiplexer.reject(id)?;
      return Err(error.into());
    }
    match request.target {
      OpenTarget::Tcp(destination) => self.dispatch_tcp(multiplexer, id, destination).await,
      OpenTarget::Udp => self.dispatch_udp(multiplexer, id).await,
    }
  }

  async fn dispatch_tcp(
    &self,
    multiplexer: &MultiplexerHandle,
    id: StreamId,
    destination: Destination,
  ) -> Result<(), DispatchError> {
    let socket = match self.dialer.dial_tcp(&destination).await {
      Ok(socket) => socket,
      Err(source) => {
        tracing::info!(stream_id = %id, %destination, error = %source, "Dial failed");
        multiplexer.reject(id)?;
        return Err(DispatchError::Dial {
          destination,
          source,
        });
      }
    };
    let stream = multiplexer.accept(id).await?;
    tracing::debug!(stream_id = %id, %destination, "Connected");
    let outcome = bridge_tcp(socket, stream, self.idle_timeout).await;
    tracing::debug!(stream_id = %id, %destination, ?outcome, "Bridge finished");
    Ok(())
  }

  async fn dispatch_udp(
    &self,
    multiplexer: &MultiplexerHandle,
    id: StreamId,
  ) -> Result<(), DispatchError> {
    let socket = match self.dialer.bind_udp().await {
      Ok(socket) => socket,
      Err(error) => {
        tracing::warn!(stream_id = %id, %error, "Failed to bind UDP relay socket");
        multiplexer.reject(id)?;
        return Err(error.into());
      }
    };
    let association = multiplexer.accept_association(id).await?;
    tracing::debug!(stream_id = %id, local = ?socket.local_addr().ok(), "UDP association ready");
    relay_udp(socket, association).await
  }
}

/// Copies bytes between a dialed socket and its tunneled stream
///
/// Local EOF is forwarded as CLOSE; a socket error or `idle_timeout` without
/// traffic resets the stream.
pub async fn bridge_tcp(mut socket: TcpStream, mut stream: MuxStream, idle_timeout: Duration) -> BridgeOutcome {
  let mut upstream = vec![0u8; READ_BUFFER];
  let mut downstream = vec![0u8; READ_BUFFER];
  let mut socket_eof = false;
  let mut tunnel_eof = false;
  let outcome = loop {
    if socket_eof && tunnel_eof {
      break BridgeOutcome::Finished;
    }
    tokio::select! {
      read = socket.read(&mut upstream), if !socket_eof => match read {
        Ok(0) => {
          socket_eof = true;
          let _ = stream.shutdown().await;
        }
        Ok(length) => {
          if stream.write_all(&upstream[..length]).await.is_err() {
            break BridgeOutcome::TunnelFailed;
          }
        }
        Err(error) => {
          tracing::debug!(stream_id = %stream.id(), %error, "Destination socket failed");
          break BridgeOutcome::SocketFailed;
        }
      },
      read = stream.read(&mut downstream), if !tunnel_eof => match read {
        Ok(0) => {
          tunnel_eof = true;
          let _ = socket.shutdown().await;
        }
        Ok(length) => {
          if let Err(error) = socket.write_all(&downstream[..length]).await {
            tracing::debug!(stream_id = %stream.id(), %error, "Destination socket failed");
            break BridgeOutcome::SocketFailed;
          }
        }
        Err(error) => {
          tracing::debug!(stream_id = %stream.id(), %error, "Tunnel stream failed");
          break BridgeOutcome::TunnelFailed;
        }
      },
      _ = tokio::time::sleep(idle_timeout) => break BridgeOutcome::IdleTimeout,
    }
  };
  match outcome {
    BridgeOutcome::IdleTimeout => stream.reset("timeout"),
    BridgeOutcome::SocketFailed => stream.reset("socket error"),
    BridgeOutcome::Finished | BridgeOutcome::TunnelFailed => {}
  }
  outcome
}

/// Relays datagrams between a bound UDP socket and a tunneled association
///
/// Datagrams from the socket are tagged with their true source.
pub async fn relay_udp(socket: UdpSocket, mut association: UdpAssociation) -> Result<(), DispatchError> {
  let mut buffer = vec![0u8; MAX_DATAGRAM];
  loop {
    tokio::select! {
      received = socket.recv_from(&mut buffer) => {
        let (length, source): (usize, SocketAddr) = received?;
        let message = UdpRelayMessage::new(
          source.ip().to_string(),
          source.port(),
          Bytes::copy_from_slice(&buffer[..length]),
        );
        association.send(message)?;
      }
      relayed = association.recv() => match relayed? {
        Some(message) => {
          if let Err(error) = socket
            .send_to(&message.payload, (message.host.as_str(), message.port))
            .await
          {
            tracing::debug!(
              stream_id = %association.id(),
              host = %message.host,
              port = message.port,
              %error,
              "Dropping datagram that could not be sent"
            );
          }
        }
        None => break,
      },
    }
  }
  tracing::debug!(stream_id = %association.id(), "UDP association closed");
  Ok(())
}
