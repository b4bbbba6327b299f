// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Signaling over a JSON websocket relay, reconnecting whenever it drops
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{
  connect_async,
  tungstenite::{Error as WsError, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{SignalMessage, SignalingChannel, SignalingConfig, SignalingEvent};

enum SessionEnd {
  /// The relay dropped; reconnect after a delay
  Dropped,
  /// The local side went away; stop entirely
  Finished,
}

/// Connects to the relay at `config.url` in the background
///
/// The returned channel emits [SignalingEvent::Connected] after every
/// successful (re)connection and its `auth`/`join` handshake. Messages
/// submitted while disconnected are discarded.
pub fn connect(config: SignalingConfig, shutdown: CancellationToken) -> SignalingChannel {
  let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
  let (events_tx, events_rx) = mpsc::unbounded_channel();
  let span = tracing::info_span!("signaling", url = %config.url, room = %config.room, role = ?config.role);
  tokio::task::spawn(run(config, outbound_rx, events_tx, shutdown).instrument(span));
  SignalingChannel::new(outbound_tx, events_rx)
}

async fn run(
  config: SignalingConfig,
  mut outbound: UnboundedReceiver<SignalMessage>,
  events: UnboundedSender<SignalingEvent>,
  shutdown: CancellationToken,
) {
  loop {
    let end = tokio::select! {
      _ = shutdown.cancelled() => SessionEnd::Finished,
      end = session(&config, &mut outbound, &events) => end,
    };
    if let SessionEnd::Finished = end {
      break;
    }
    if events.send(SignalingEvent::Disconnected).is_err() {
      break;
    }
    let delay = tokio::time::sleep(config.reconnect_delay);
    tokio::pin!(delay);
    // Discard sends made while the relay is unreachable
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = &mut delay => break,
        message = outbound.recv() => match message {
          Some(message) => tracing::trace!(?message, "Dropping signal while disconnected"),
          None => return,
        },
      }
    }
  }
  tracing::debug!("Signaling stopped");
}

async fn session(
  config: &SignalingConfig,
  outbound: &mut UnboundedReceiver<SignalMessage>,
  events: &UnboundedSender<SignalingEvent>,
) -> SessionEnd {
  let (ws_stream, _) = match connect_async(config.url.as_str()).await {
    Ok(connected) => connected,
    Err(error) => {
      tracing::warn!(%error, "Signaling connection failed");
      return SessionEnd::Dropped;
    }
  };
  tracing::info!("Signaling connected");
  let (mut ws_write, mut ws_read) = ws_stream.split();

  for message in config.handshake() {
    match serde_json::to_string(&message) {
      Ok(text) => {
        if let Err(error) = ws_write.send(Message::Text(text)).await {
          tracing::warn!(%error, "Signaling handshake failed");
          return SessionEnd::Dropped;
        }
      }
      Err(error) => tracing::error!(%error, "Failed to encode handshake"),
    }
  }
  if events.send(SignalingEvent::Connected).is_err() {
    return SessionEnd::Finished;
  }

  loop {
    tokio::select! {
      message = outbound.recv() => {
        let message = match message {
          Some(message) => message,
          None => {
            let _ = ws_write.send(Message::Close(None)).await;
            return SessionEnd::Finished;
          }
        };
        let text = match serde_json::to_string(&message) {
          Ok(text) => text,
          Err(error) => {
            tracing::error!(%error, "Failed to encode signal message");
            continue;
          }
        };
        if let Err(error) = ws_write.send(Message::Text(text)).await {
          tracing::warn!(%error, "Signaling send failed");
          return SessionEnd::Dropped;
        }
      }
      incoming = ws_read.next() => {
        let text = match incoming {
          Some(Ok(Message::Text(text))) => text,
          Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
            Ok(text) => text,
            Err(_) => continue,
          },
          Some(Ok(Message::Close(_))) | None => {
            tracing::info!("Signaling connection closed by relay");
            return SessionEnd::Dropped;
          }
          Some(Ok(_)) => continue,
          Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
            tracing::debug!("Signaling websocket closed");
            return SessionEnd::Dropped;
          }
          Some(Err(error)) => {
            tracing::warn!(%error, "Signaling websocket error");
            return SessionEnd::Dropped;
          }
        };
        match serde_json::from_str::<SignalMessage>(&text) {
          Ok(message) => {
            if events.send(SignalingEvent::Message(message)).is_err() {
              return SessionEnd::Finished;
            }
          }
          Err(error) => tracing::debug!(%error, "Ignoring unrecognised relay message"),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::common::signaling::PeerRole;

  #[tokio::test]
  async fn unreachable_relay_reports_disconnects_and_retries() {
    // Bind then drop a listener so the port refuses connections
    let port = {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap().port()
    };
    let mut config = SignalingConfig::new(
      format!("ws://127.0.0.1:{}/ws", port),
      "room",
      PeerRole::Client,
    );
    config.reconnect_delay = Duration::from_millis(10);
    let shutdown = CancellationToken::new();
    let mut channel = connect(config, shutdown.clone());
    for _ in 0..2 {
      let event = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("Must report each failed attempt");
      assert_eq!(event, Some(SignalingEvent::Disconnected));
    }
    // Sends while disconnected are accepted and silently dropped
    channel.send(SignalMessage::PeerReady).unwrap();
    shutdown.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
      while channel.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "Events must end after shutdown");
  }
}
