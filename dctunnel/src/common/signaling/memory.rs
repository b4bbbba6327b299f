// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! An in-process signaling relay, pairing one client and one host per room
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::Instrument;

use super::{PeerRole, SignalMessage, SignalingChannel, SignalingConfig, SignalingEvent};

#[derive(Default)]
struct Room {
  client: Option<UnboundedSender<SignalingEvent>>,
  host: Option<UnboundedSender<SignalingEvent>>,
}

impl Room {
  fn slot(&mut self, role: PeerRole) -> &mut Option<UnboundedSender<SignalingEvent>> {
    match role {
      PeerRole::Client => &mut self.client,
      PeerRole::Host => &mut self.host,
    }
  }

  fn member(&self, role: PeerRole) -> Option<&UnboundedSender<SignalingEvent>> {
    match role {
      PeerRole::Client => self.client.as_ref(),
      PeerRole::Host => self.host.as_ref(),
    }
  }
}

/// Relays signal messages between the two members of each room
///
/// Mirrors the remote relay's behaviour: a `join` claims a role within a
/// room, both members are told `peer-ready` once the pair is complete, and
/// `signal` messages are forwarded verbatim to the other member. When an
/// access token is configured, `join` is ignored until a matching `auth`.
pub struct MemorySignalingHub {
  rooms: DashMap<String, Room>,
  access_token: Option<String>,
}

impl MemorySignalingHub {
  pub fn new() -> Arc<Self> {
    Self::with_access_token(None)
  }

  pub fn with_access_token(access_token: Option<String>) -> Arc<Self> {
    Arc::new(Self {
      rooms: DashMap::new(),
      access_token,
    })
  }

  /// Connects a member, sending the configured handshake on its behalf
  pub fn connect(self: &Arc<Self>, config: &SignalingConfig) -> SignalingChannel {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    // The relay is "connected" immediately; queue the announcement first
    let _ = events_tx.send(SignalingEvent::Connected);
    for message in config.handshake() {
      let _ = outbound_tx.send(message);
    }

    let hub = Arc::clone(self);
    let span = tracing::debug_span!("memory_signaling", room = %config.room, role = ?config.role);
    tokio::task::spawn(
      async move {
        let mut membership: Option<(String, PeerRole)> = None;
        let mut authenticated = hub.access_token.is_none();
        while let Some(message) = outbound_rx.recv().await {
          match message {
            SignalMessage::Auth { token } => {
              authenticated = match hub.access_token.as_deref() {
                Some(expected) => expected == token,
                None => true,
              };
              if !authenticated {
                tracing::debug!("Rejected signaling token");
              }
            }
            SignalMessage::Join { role, room } => {
              if !authenticated {
                tracing::debug!("Ignoring join from unauthenticated member");
                continue;
              }
              if let Some((previous_room, previous_role)) = membership.take() {
                hub.leave(&previous_room, previous_role, &events_tx);
              }
              hub.join(&room, role, events_tx.clone());
              membership = Some((room, role));
            }
            SignalMessage::Signal { data } => {
              if let Some((room, role)) = &membership {
                hub.forward(room, role.counterpart(), SignalMessage::Signal { data });
              }
            }
            SignalMessage::PeerReady => {
              tracing::trace!("Ignoring peer-ready sent by a member");
            }
          }
        }
        if let Some((room, role)) = membership {
          hub.leave(&room, role, &events_tx);
        }
        tracing::trace!("Member disconnected");
      }
      .instrument(span),
    );

    SignalingChannel::new(outbound_tx, events_rx)
  }

  fn join(&self, room: &str, role: PeerRole, events: UnboundedSender<SignalingEvent>) {
    let mut entry = self.rooms.entry(room.to_string()).or_default();
    *entry.slot(role) = Some(events);
    if let (Some(client), Some(host)) = (&entry.client, &entry.host) {
      let _ = client.send(SignalingEvent::Message(SignalMessage::PeerReady));
      let _ = host.send(SignalingEvent::Message(SignalMessage::PeerReady));
    }
  }

  fn leave(&self, room: &str, role: PeerRole, events: &UnboundedSender<SignalingEvent>) {
    let emptied = match self.rooms.get_mut(room) {
      Some(mut entry) => {
        let slot = entry.slot(role);
        // Only clear the slot if a later join has not replaced this member
        if slot
          .as_ref()
          .map(|current| current.same_channel(events))
          .unwrap_or(false)
        {
          *slot = None;
        }
        entry.client.is_none() && entry.host.is_none()
      }
      None => false,
    };
    if emptied {
      self
        .rooms
        .remove_if(room, |_, r| r.client.is_none() && r.host.is_none());
    }
  }

  fn forward(&self, room: &str, to: PeerRole, message: SignalMessage) {
    if let Some(entry) = self.rooms.get(room) {
      if let Some(target) = entry.member(to) {
        let _ = target.send(SignalingEvent::Message(message));
      }
    }
  }

  pub fn room_count(&self) -> usize {
    self.rooms.len()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::common::{
    signaling::DEFAULT_SIGNAL_URL,
    transport::{IceCandidate, SessionDescription},
  };

  async fn next_message(channel: &mut SignalingChannel) -> SignalMessage {
    loop {
      let event = tokio::time::timeout(Duration::from_secs(1), channel.recv())
        .await
        .expect("Timed out waiting for signaling")
        .expect("Signaling channel closed");
      if let SignalingEvent::Message(message) = event {
        return message;
      }
    }
  }

  #[tokio::test]
  async fn pairs_members_and_forwards_signals() {
    let hub = MemorySignalingHub::new();
    let mut client = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "r1",
      PeerRole::Client,
    ));
    let mut host = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "r1",
      PeerRole::Host,
    ));
    assert_eq!(
      client.recv().await,
      Some(SignalingEvent::Connected),
      "Connection is announced first"
    );
    assert_eq!(next_message(&mut client).await, SignalMessage::PeerReady);
    assert_eq!(next_message(&mut host).await, SignalMessage::PeerReady);

    client
      .send(SignalMessage::description(SessionDescription::offer("o")))
      .unwrap();
    client
      .send(SignalMessage::candidate(IceCandidate::new("c1")))
      .unwrap();
    assert_eq!(
      next_message(&mut host).await,
      SignalMessage::description(SessionDescription::offer("o"))
    );
    assert_eq!(
      next_message(&mut host).await,
      SignalMessage::candidate(IceCandidate::new("c1"))
    );
  }

  #[tokio::test]
  async fn rooms_are_isolated() {
    let hub = MemorySignalingHub::new();
    let client = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "a",
      PeerRole::Client,
    ));
    let mut host = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "b",
      PeerRole::Host,
    ));
    client
      .send(SignalMessage::description(SessionDescription::offer("o")))
      .unwrap();
    assert_eq!(host.recv().await, Some(SignalingEvent::Connected));
    assert!(
      tokio::time::timeout(Duration::from_millis(100), host.recv())
        .await
        .is_err(),
      "Host in another room must not see the offer"
    );
  }

  #[tokio::test]
  async fn unauthenticated_join_is_ignored() {
    let hub = MemorySignalingHub::with_access_token(Some(String::from("s3cret")));
    let mut host_config = SignalingConfig::new(DEFAULT_SIGNAL_URL, "r", PeerRole::Host);
    host_config.token = Some(String::from("s3cret"));
    let mut host = hub.connect(&host_config);
    let _intruder = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "r",
      PeerRole::Client,
    ));
    assert_eq!(host.recv().await, Some(SignalingEvent::Connected));
    assert!(
      tokio::time::timeout(Duration::from_millis(100), host.recv())
        .await
        .is_err(),
      "No peer-ready without an authenticated client"
    );
  }

  #[tokio::test]
  async fn room_is_released_when_members_leave() {
    let hub = MemorySignalingHub::new();
    let client = hub.connect(&SignalingConfig::new(
      DEFAULT_SIGNAL_URL,
      "gone",
      PeerRole::Client,
    ));
    tokio::time::timeout(Duration::from_secs(1), async {
      while hub.room_count() == 0 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();
    drop(client);
    tokio::time::timeout(Duration::from_secs(1), async {
      while hub.room_count() != 0 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();
  }
}
