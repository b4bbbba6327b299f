// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Room-scoped exchange of session descriptions and candidates
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::common::transport::{IceCandidate, SessionDescription};

pub mod memory;
#[cfg(feature = "websocket-signaling")]
pub mod websocket;

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8787/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Which side of a room a peer occupies
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
  Client,
  Host,
}

impl PeerRole {
  pub fn counterpart(&self) -> PeerRole {
    match self {
      Self::Client => Self::Host,
      Self::Host => Self::Client,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignalPayload {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sdp: Option<SessionDescription>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
  Join { role: PeerRole, room: String },
  Auth { token: String },
  Signal { data: SignalPayload },
  PeerReady,
}

impl SignalMessage {
  pub fn description(description: SessionDescription) -> Self {
    Self::Signal {
      data: SignalPayload {
        sdp: Some(description),
        candidate: None,
      },
    }
  }

  pub fn candidate(candidate: IceCandidate) -> Self {
    Self::Signal {
      data: SignalPayload {
        sdp: None,
        candidate: Some(candidate),
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
  /// The relay connection was (re)established and the room joined
  Connected,
  /// The relay connection dropped; a reconnect is pending
  Disconnected,
  Message(SignalMessage),
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum SignalingError {
  #[error("Signaling channel closed")]
  Closed,
  #[error("Signaling message could not be encoded: {0}")]
  Encoding(String),
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
  pub url: String,
  pub room: String,
  pub role: PeerRole,
  /// Sent as an `auth` message ahead of `join` when present
  pub token: Option<String>,
  pub reconnect_delay: Duration,
}

impl SignalingConfig {
  pub fn new<U: Into<String>, R: Into<String>>(url: U, room: R, role: PeerRole) -> Self {
    Self {
      url: url.into(),
      room: room.into(),
      role,
      token: None,
      reconnect_delay: DEFAULT_RECONNECT_DELAY,
    }
  }

  /// Messages announcing this peer, in the order the relay expects them
  pub fn handshake(&self) -> Vec<SignalMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(token) = &self.token {
      messages.push(SignalMessage::Auth {
        token: token.clone(),
      });
    }
    messages.push(SignalMessage::Join {
      role: self.role,
      room: self.room.clone(),
    });
    messages
  }
}

/// A connected peer's view of its room
///
/// Outbound messages are fire-and-forget; while the underlying relay is
/// disconnected they are dropped, as descriptions are re-sent by the
/// negotiation that follows a reconnect.
pub struct SignalingChannel {
  outbound: UnboundedSender<SignalMessage>,
  events: UnboundedReceiver<SignalingEvent>,
}

impl SignalingChannel {
  pub fn new(
    outbound: UnboundedSender<SignalMessage>,
    events: UnboundedReceiver<SignalingEvent>,
  ) -> Self {
    Self { outbound, events }
  }

  pub fn sender(&self) -> SignalSender {
    SignalSender {
      outbound: self.outbound.clone(),
    }
  }

  pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
    self
      .outbound
      .send(message)
      .map_err(|_| SignalingError::Closed)
  }

  pub async fn recv(&mut self) -> Option<SignalingEvent> {
    self.events.recv().await
  }
}

/// A cloneable sending half of a [SignalingChannel]
#[derive(Clone)]
pub struct SignalSender {
  outbound: UnboundedSender<SignalMessage>,
}

impl SignalSender {
  pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
    self
      .outbound
      .send(message)
      .map_err(|_| SignalingError::Closed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_match_relay_format() {
    let join = SignalMessage::Join {
      role: PeerRole::Client,
      room: String::from("demo1"),
    };
    assert_eq!(
      serde_json::to_string(&join).unwrap(),
      r#"{"type":"join","role":"client","room":"demo1"}"#
    );
    assert_eq!(
      serde_json::to_string(&SignalMessage::PeerReady).unwrap(),
      r#"{"type":"peer-ready"}"#
    );
    let signal = SignalMessage::description(SessionDescription::answer("v=0"));
    assert_eq!(
      serde_json::to_string(&signal).unwrap(),
      r#"{"type":"signal","data":{"sdp":{"type":"answer","sdp":"v=0"}}}"#
    );
  }

  #[test]
  fn parses_browser_candidate_signal() {
    let raw = r#"{"type":"signal","data":{"candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}}"#;
    match serde_json::from_str::<SignalMessage>(raw).unwrap() {
      SignalMessage::Signal { data } => {
        let candidate = data.candidate.unwrap();
        assert_eq!(candidate.candidate, "candidate:1");
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(data.sdp.is_none());
      }
      other => panic!("Unexpected message {:?}", other),
    }
  }

  #[test]
  fn handshake_authenticates_before_joining() {
    let mut config = SignalingConfig::new(DEFAULT_SIGNAL_URL, "room", PeerRole::Host);
    assert_eq!(config.handshake().len(), 1);
    config.token = Some(String::from("secret"));
    let handshake = config.handshake();
    assert!(matches!(handshake[0], SignalMessage::Auth { .. }));
    assert!(matches!(handshake[1], SignalMessage::Join { .. }));
  }
}
