// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local proxy listeners that turn client connections into tunneled streams
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  mux::{MultiplexerHandle, MuxStream, UdpAssociation},
  protocol::{Destination, TunnelError},
  session::SessionHandle,
};

pub mod http_connect;
pub mod socks5;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Something that can open tunneled streams on behalf of a frontend
pub trait StreamOpener: Send + Sync {
  fn open_stream(
    &self,
    destination: Destination,
    timeout: Duration,
  ) -> BoxFuture<'_, Result<MuxStream, TunnelError>>;

  fn open_association(&self, timeout: Duration) -> BoxFuture<'_, Result<UdpAssociation, TunnelError>>;
}

impl StreamOpener for MultiplexerHandle {
  fn open_stream(
    &self,
    destination: Destination,
    timeout: Duration,
  ) -> BoxFuture<'_, Result<MuxStream, TunnelError>> {
    MultiplexerHandle::open_stream(self, destination, timeout).boxed()
  }

  fn open_association(&self, timeout: Duration) -> BoxFuture<'_, Result<UdpAssociation, TunnelError>> {
    MultiplexerHandle::open_association(self, timeout).boxed()
  }
}

/// Waits for the session's link within the same timeout that bounds the open
impl StreamOpener for SessionHandle {
  fn open_stream(
    &self,
    destination: Destination,
    timeout: Duration,
  ) -> BoxFuture<'_, Result<MuxStream, TunnelError>> {
    async move {
      let deadline = tokio::time::Instant::now() + timeout;
      let multiplexer = self.wait_connected(timeout).await?;
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      multiplexer.open_stream(destination, remaining).await
    }
    .boxed()
  }

  fn open_association(&self, timeout: Duration) -> BoxFuture<'_, Result<UdpAssociation, TunnelError>> {
    async move {
      let deadline = tokio::time::Instant::now() + timeout;
      let multiplexer = self.wait_connected(timeout).await?;
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      multiplexer.open_association(remaining).await
    }
    .boxed()
  }
}

pub type ArcOpener = Arc<dyn StreamOpener + 'static>;

/// Accepts connections until `shutdown`, running `handler` on its own task for each
pub(crate) async fn accept_loop<H, Fut>(
  listener: TcpListener,
  shutdown: CancellationToken,
  handler: H,
) where
  H: Fn(TcpStream, SocketAddr) -> Fut,
  Fut: Future<Output = ()> + Send + 'static,
{
  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok((stream, peer)) => {
        let span = tracing::debug_span!("connection", %peer);
        tokio::task::spawn(handler(stream, peer).instrument(span));
      }
      Err(error) => {
        tracing::warn!(%error, "Failed to accept connection");
      }
    }
  }
  tracing::debug!("Listener stopped");
}

#[cfg(test)]
pub(crate) mod testing {
  use tokio::io::AsyncWriteExt;

  use crate::common::{
    mux::{MultiplexerHandle, MultiplexerSide, StreamMultiplexer},
    protocol::{OpenTarget, UdpRelayMessage},
    transport::DataChannel,
  };

  /// Destinations on this port are rejected by [echo_tunnel]
  pub const REFUSED_PORT: u16 = 9;

  /// A multiplexer whose remote side echoes every stream and datagram back
  pub fn echo_tunnel() -> MultiplexerHandle {
    echo_tunnel_with_remote().0
  }

  /// As [echo_tunnel], also returning the remote side so tests can stop it
  pub fn echo_tunnel_with_remote() -> (MultiplexerHandle, MultiplexerHandle) {
    let (local, remote) = DataChannel::pair("mux");
    let (handle, _) = StreamMultiplexer::spawn(local, MultiplexerSide::Initiator, None);
    let (responder, mut incoming) = StreamMultiplexer::spawn(remote, MultiplexerSide::Responder, None);
    let remote = responder.clone();
    tokio::task::spawn(async move {
      while let Some(open) = incoming.recv().await {
        let responder = responder.clone();
        match open.request.target {
          OpenTarget::Tcp(destination) if destination.port == REFUSED_PORT => {
            responder.reject(open.id).unwrap();
          }
          OpenTarget::Tcp(_) => {
            tokio::task::spawn(async move {
              let stream = responder.accept(open.id).await.unwrap();
              let (mut reader, mut writer) = tokio::io::split(stream);
              let _ = tokio::io::copy(&mut reader, &mut writer).await;
              let _ = writer.shutdown().await;
            });
          }
          OpenTarget::Udp => {
            tokio::task::spawn(async move {
              let mut association = responder.accept_association(open.id).await.unwrap();
              while let Ok(Some(message)) = association.recv().await {
                let reply = UdpRelayMessage::new(message.host, message.port, message.payload);
                if association.send(reply).is_err() {
                  break;
                }
              }
            });
          }
        }
      }
    });
    (handle, remote)
  }
}
