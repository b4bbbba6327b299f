// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Keeps one negotiated transport and multiplexer alive per room
//!
//! The session task owns the [NegotiationManager], the current transport and
//! its multiplexer. After any transport failure it tears all three down,
//! waits briefly, and starts over with a fresh transport.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{
  mux::{IncomingOpens, MultiplexerHandle, MultiplexerSide, StreamMultiplexer},
  protocol::TunnelError,
  signaling::{PeerRole, SignalMessage, SignalingChannel, SignalingEvent},
  transport::{
    ArcTransport, ConnectionState, DataChannel, PeerTransportFactory, SdpKind, SessionDescription,
    TransportEvent, TransportEvents, CONTROL_CHANNEL_LABEL, MUX_CHANNEL_LABEL,
  },
};

pub mod negotiation;

pub use negotiation::{
  transition, NegotiationAction, NegotiationError, NegotiationInput, NegotiationManager,
  NegotiationState, Politeness, TRANSITION_TABLE,
};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_MESSAGE: &[u8] = b"ping";

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub room: String,
  pub role: PeerRole,
  /// Attached to every stream this side opens
  pub token: Option<String>,
  pub retry_delay: Duration,
  pub keepalive_interval: Duration,
}

impl SessionConfig {
  pub fn new<R: Into<String>>(room: R, role: PeerRole) -> Self {
    Self {
      room: room.into(),
      role,
      token: None,
      retry_delay: DEFAULT_RETRY_DELAY,
      keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
    }
  }

  /// Clients initiate and win offer collisions; hosts answer
  pub fn politeness(&self) -> Politeness {
    match self.role {
      PeerRole::Client => Politeness::Impolite,
      PeerRole::Host => Politeness::Polite,
    }
  }

  fn side(&self) -> MultiplexerSide {
    match self.role {
      PeerRole::Client => MultiplexerSide::Initiator,
      PeerRole::Host => MultiplexerSide::Responder,
    }
  }

  fn is_initiator(&self) -> bool {
    self.role == PeerRole::Client
  }
}

/// A multiplexer created for a newly negotiated transport
pub struct Link {
  pub multiplexer: MultiplexerHandle,
  pub incoming: IncomingOpens,
}

/// Observes the session's current multiplexer
#[derive(Clone)]
pub struct SessionHandle {
  current: watch::Receiver<Option<MultiplexerHandle>>,
}

impl SessionHandle {
  pub fn current(&self) -> Option<MultiplexerHandle> {
    self
      .current
      .borrow()
      .as_ref()
      .filter(|handle| !handle.is_closed())
      .cloned()
  }

  pub fn is_connected(&self) -> bool {
    self.current().is_some()
  }

  /// Waits up to `timeout` for a connected multiplexer
  pub async fn wait_connected(&self, timeout: Duration) -> Result<MultiplexerHandle, TunnelError> {
    let mut current = self.current.clone();
    let wait = async move {
      loop {
        if let Some(handle) = current.borrow_and_update().as_ref() {
          if !handle.is_closed() {
            return Ok(handle.clone());
          }
        }
        if current.changed().await.is_err() {
          return Err(TunnelError::TransportError);
        }
      }
    };
    tokio::time::timeout(timeout, wait)
      .await
      .map_err(|_| TunnelError::TimedOut)?
  }
}

enum Outcome {
  /// Tear down and retry, replaying an offer that arrived for a fresh transport
  Failed { replay: Option<SessionDescription> },
  Shutdown,
}

pub struct Session {
  config: SessionConfig,
  factory: Arc<dyn PeerTransportFactory>,
  signaling: SignalingChannel,
  current: watch::Sender<Option<MultiplexerHandle>>,
  links: mpsc::UnboundedSender<Link>,
  shutdown: CancellationToken,
}

impl Session {
  /// Starts the session task; it runs until `shutdown` is cancelled
  pub fn spawn(
    config: SessionConfig,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: SignalingChannel,
    shutdown: CancellationToken,
  ) -> (SessionHandle, mpsc::UnboundedReceiver<Link>) {
    let (current_tx, current_rx) = watch::channel(None);
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let span = tracing::info_span!("session", room = %config.room, role = ?config.role);
    let session = Session {
      config,
      factory,
      signaling,
      current: current_tx,
      links: links_tx,
      shutdown,
    };
    tokio::task::spawn(session.run().instrument(span));
    (
      SessionHandle {
        current: current_rx,
      },
      links_rx,
    )
  }

  async fn run(mut self) {
    let mut replay = None;
    loop {
      let (transport, events) = match self.factory.create().await {
        Ok(created) => created,
        Err(error) => {
          tracing::warn!(%error, "Failed to create transport");
          if self.pause().await {
            continue;
          }
          break;
        }
      };
      let generation = self.shutdown.child_token();
      let outcome = self
        .drive(transport.clone(), events, replay.take(), &generation)
        .await;
      generation.cancel();
      self.current.send_replace(None);
      transport.close().await;
      match outcome {
        Outcome::Shutdown => break,
        Outcome::Failed { replay: next } => {
          replay = next;
          tracing::info!(retry_in = ?self.config.retry_delay, "Session reset");
          if !self.pause().await {
            break;
          }
        }
      }
    }
    tracing::debug!("Session stopped");
  }

  /// Sleeps for the retry delay; false if shut down meanwhile
  async fn pause(&self) -> bool {
    tokio::select! {
      _ = self.shutdown.cancelled() => false,
      _ = tokio::time::sleep(self.config.retry_delay) => true,
    }
  }

  fn spawn_multiplexer(&self, channel: DataChannel) -> MultiplexerHandle {
    let (multiplexer, incoming) =
      StreamMultiplexer::spawn(channel, self.config.side(), self.config.token.clone());
    let _ = self.links.send(Link {
      multiplexer: multiplexer.clone(),
      incoming,
    });
    multiplexer
  }

  async fn drive(
    &mut self,
    transport: ArcTransport,
    mut events: TransportEvents,
    replay: Option<SessionDescription>,
    generation: &CancellationToken,
  ) -> Outcome {
    let mut manager = NegotiationManager::new(
      transport.clone(),
      self.config.politeness(),
      self.signaling.sender(),
    );
    let mut multiplexer: Option<MultiplexerHandle> = None;
    let mut connected = false;

    if self.config.is_initiator() {
      match transport.open_channel(MUX_CHANNEL_LABEL).await {
        Ok(channel) => multiplexer = Some(self.spawn_multiplexer(channel)),
        Err(error) => {
          tracing::warn!(%error, "Failed to open multiplexer channel");
          return Outcome::Failed { replay: None };
        }
      }
      match transport.open_channel(CONTROL_CHANNEL_LABEL).await {
        Ok(channel) => spawn_keepalive(
          channel,
          self.config.keepalive_interval,
          generation.clone(),
        ),
        Err(error) => tracing::warn!(%error, "Failed to open control channel"),
      }
      if let Err(error) = manager.ensure_offer().await {
        tracing::warn!(%error, "Failed to send offer");
        return Outcome::Failed { replay: None };
      }
    }
    if let Some(offer) = replay {
      if let Err(error) = manager.on_remote_description(offer).await {
        tracing::warn!(%error, "Failed to apply replayed offer");
        return Outcome::Failed { replay: None };
      }
    }

    loop {
      let multiplexer_closed = async {
        match &multiplexer {
          Some(handle) => handle.closed().await,
          None => futures::future::pending().await,
        }
      };
      tokio::select! {
        _ = self.shutdown.cancelled() => {
          if let Some(handle) = &multiplexer {
            handle.shutdown();
          }
          return Outcome::Shutdown;
        }
        _ = multiplexer_closed => {
          tracing::info!("Multiplexer channel closed");
          return Outcome::Failed { replay: None };
        }
        event = events.recv() => match event {
          None => {
            tracing::info!("Transport event stream ended");
            return Outcome::Failed { replay: None };
          }
          Some(TransportEvent::LocalCandidate(candidate)) => {
            let _ = self.signaling.send(SignalMessage::candidate(candidate));
          }
          Some(TransportEvent::ConnectionState(ConnectionState::Connected)) => {
            manager.on_transport_connected();
            connected = true;
            tracing::info!("Transport connected");
            self.publish(&multiplexer, connected);
          }
          Some(TransportEvent::ConnectionState(state)) if state.is_terminal() => {
            tracing::info!(?state, "Transport lost");
            manager.on_transport_failure();
            if let Some(handle) = &multiplexer {
              handle.shutdown();
            }
            return Outcome::Failed { replay: None };
          }
          Some(TransportEvent::ConnectionState(state)) => {
            tracing::debug!(?state, "Transport state changed");
          }
          Some(TransportEvent::Channel(channel)) => {
            if self.config.is_initiator() {
              tracing::debug!(label = channel.label(), "Closing channel opened by responder");
              continue;
            }
            match channel.label() {
              MUX_CHANNEL_LABEL => {
                if let Some(previous) = multiplexer.replace(self.spawn_multiplexer(channel)) {
                  previous.shutdown();
                }
                self.publish(&multiplexer, connected);
              }
              CONTROL_CHANNEL_LABEL => spawn_control_drain(channel, generation.clone()),
              other => tracing::debug!(label = other, "Closing unexpected channel"),
            }
          }
        },
        signal = self.signaling.recv() => match signal {
          None => {
            // Adapters reconnect on their own and end the event stream only when
            // shut down. Without signaling nothing can be renegotiated, so the
            // session stops and waiting handles see the transport as gone.
            tracing::error!("Signaling channel ended; stopping session");
            if let Some(handle) = &multiplexer {
              handle.shutdown();
            }
            return Outcome::Shutdown;
          }
          Some(SignalingEvent::Connected) | Some(SignalingEvent::Message(SignalMessage::PeerReady)) => {
            if self.config.is_initiator() {
              if let Err(error) = manager.announce().await {
                tracing::warn!(%error, "Failed to send offer");
                return Outcome::Failed { replay: None };
              }
            }
          }
          Some(SignalingEvent::Disconnected) => {
            tracing::debug!("Signaling disconnected; awaiting reconnect");
          }
          Some(SignalingEvent::Message(SignalMessage::Signal { data })) => {
            if let Some(description) = data.sdp {
              let is_offer = description.kind == SdpKind::Offer;
              if is_offer && manager.state() == NegotiationState::Connected {
                // The remote peer restarted; start over and answer on a fresh transport
                tracing::info!("Fresh offer while connected; resetting transport");
                manager.on_transport_failure();
                return Outcome::Failed { replay: Some(description) };
              }
              if let Err(error) = manager.on_remote_description(description.clone()).await {
                tracing::warn!(%error, "Failed to apply remote description");
                manager.on_transport_failure();
                return Outcome::Failed { replay: is_offer.then_some(description) };
              }
            }
            if let Some(candidate) = data.candidate {
              manager.on_remote_candidate(candidate).await;
            }
          }
          Some(SignalingEvent::Message(other)) => {
            tracing::trace!(message = ?other, "Ignoring signaling message");
          }
        },
      }
    }
  }

  fn publish(&self, multiplexer: &Option<MultiplexerHandle>, connected: bool) {
    if let (true, Some(handle)) = (connected, multiplexer) {
      self.current.send_replace(Some(handle.clone()));
    }
  }
}

fn spawn_keepalive(channel: DataChannel, interval: Duration, cancel: CancellationToken) {
  tokio::task::spawn(async move {
    let (_label, outbound, mut inbound) = channel.into_parts();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {
          if outbound.send(Bytes::from_static(KEEPALIVE_MESSAGE)).is_err() {
            break;
          }
        }
        message = inbound.recv() => if message.is_none() {
          break;
        },
      }
    }
    tracing::trace!("Keepalive stopped");
  });
}

fn spawn_control_drain(mut channel: DataChannel, cancel: CancellationToken) {
  tokio::task::spawn(async move {
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        message = channel.recv() => match message {
          Some(message) => tracing::trace!(len = message.len(), "Control message"),
          None => break,
        },
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::common::{
    protocol::{Destination, StreamId},
    signaling::{memory::MemorySignalingHub, SignalingConfig, DEFAULT_SIGNAL_URL},
    transport::duplex::DuplexNetwork,
  };

  const TIMEOUT: Duration = Duration::from_secs(5);

  struct Pair {
    network: Arc<DuplexNetwork>,
    client: SessionHandle,
    host: SessionHandle,
    host_links: mpsc::UnboundedReceiver<Link>,
    shutdown: CancellationToken,
  }

  fn start_pair(room: &str) -> Pair {
    let network = DuplexNetwork::new();
    let hub = MemorySignalingHub::new();
    let shutdown = CancellationToken::new();
    let spawn = |role| {
      let signaling = hub.connect(&SignalingConfig::new(DEFAULT_SIGNAL_URL, room, role));
      let mut config = SessionConfig::new(room, role);
      config.retry_delay = Duration::from_millis(20);
      Session::spawn(
        config,
        Arc::new(network.factory()),
        signaling,
        shutdown.child_token(),
      )
    };
    let (host, host_links) = spawn(PeerRole::Host);
    let (client, _client_links) = spawn(PeerRole::Client);
    Pair {
      network,
      client,
      host,
      host_links,
      shutdown,
    }
  }

  #[tokio::test]
  async fn peers_connect_and_carry_opens() {
    let mut pair = start_pair("connect");
    let client = pair.client.wait_connected(TIMEOUT).await.unwrap();
    pair.host.wait_connected(TIMEOUT).await.unwrap();
    let mut link = pair.host_links.recv().await.unwrap();

    let opener = tokio::spawn(async move {
      client
        .open_stream(Destination::new("example.com", 80), TIMEOUT)
        .await
    });
    let incoming = tokio::time::timeout(TIMEOUT, link.incoming.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(incoming.id, StreamId::new(1));
    link.multiplexer.accept(incoming.id).await.unwrap();
    opener.await.unwrap().unwrap();
    pair.shutdown.cancel();
  }

  #[tokio::test]
  async fn session_recovers_after_transport_failure() {
    let mut pair = start_pair("recover");
    let first = pair.client.wait_connected(TIMEOUT).await.unwrap();
    let _first_link = pair.host_links.recv().await.unwrap();

    pair.network.fail_all();
    tokio::time::timeout(TIMEOUT, first.closed()).await.unwrap();

    let second = tokio::time::timeout(TIMEOUT, async {
      loop {
        let handle = pair.client.wait_connected(TIMEOUT).await.unwrap();
        if !handle.is_closed() {
          return handle;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
    assert!(!second.is_closed());
    let mut second_link = tokio::time::timeout(TIMEOUT, pair.host_links.recv())
      .await
      .unwrap()
      .unwrap();

    let opener = tokio::spawn(async move {
      second
        .open_stream(Destination::new("after", 1), TIMEOUT)
        .await
    });
    let incoming = tokio::time::timeout(TIMEOUT, second_link.incoming.recv())
      .await
      .unwrap()
      .unwrap();
    second_link.multiplexer.accept(incoming.id).await.unwrap();
    opener.await.unwrap().unwrap();
    pair.shutdown.cancel();
  }

  #[tokio::test]
  async fn ended_signaling_stops_the_session() {
    let network = DuplexNetwork::new();
    let (outbound, _sent) = mpsc::unbounded_channel();
    let (events, received) = mpsc::unbounded_channel();
    drop(events);
    let shutdown = CancellationToken::new();
    let (client, _links) = Session::spawn(
      SessionConfig::new("orphan", PeerRole::Client),
      Arc::new(network.factory()),
      SignalingChannel::new(outbound, received),
      shutdown.clone(),
    );
    // Fails promptly rather than waiting out the timeout
    let result = tokio::time::timeout(TIMEOUT, client.wait_connected(Duration::from_secs(60)))
      .await
      .unwrap();
    assert_eq!(result.err(), Some(TunnelError::TransportError));
    assert!(!shutdown.is_cancelled());
  }

  #[tokio::test]
  async fn wait_connected_times_out_without_peer() {
    let network = DuplexNetwork::new();
    let hub = MemorySignalingHub::new();
    let shutdown = CancellationToken::new();
    let signaling = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "alone",
      PeerRole::Client,
    ));
    let (client, _links) = Session::spawn(
      SessionConfig::new("alone", PeerRole::Client),
      Arc::new(network.factory()),
      signaling,
      shutdown.clone(),
    );
    assert_eq!(
      client
        .wait_connected(Duration::from_millis(100))
        .await
        .err(),
      Some(TunnelError::TimedOut)
    );
    shutdown.cancel();
  }
}
