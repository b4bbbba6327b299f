// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The peer-to-peer session substrate
//!
//! A [PeerTransport] provides one reliable, ordered and encrypted session
//! with a remote peer, negotiated through opaque session descriptions and
//! candidates, and carrying any number of labelled [DataChannel]s.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub mod duplex;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

/// Label of the channel carrying multiplexed stream frames
pub const MUX_CHANNEL_LABEL: &str = "mux";
/// Label of the channel carrying keepalive traffic
pub const CONTROL_CHANNEL_LABEL: &str = "control";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
  Offer,
  Answer,
}

/// An offer or answer, opaque beyond its kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
  #[serde(rename = "type")]
  pub kind: SdpKind,
  pub sdp: String,
}

impl SessionDescription {
  pub fn offer<S: Into<String>>(sdp: S) -> Self {
    Self {
      kind: SdpKind::Offer,
      sdp: sdp.into(),
    }
  }

  pub fn answer<S: Into<String>>(sdp: S) -> Self {
    Self {
      kind: SdpKind::Answer,
      sdp: sdp.into(),
    }
  }
}

/// A reachability update, opaque beyond being relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
  pub candidate: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sdp_mid: Option<String>,
  #[serde(
    rename = "sdpMLineIndex",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub sdp_mline_index: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_fragment: Option<String>,
}

impl IceCandidate {
  pub fn new<S: Into<String>>(candidate: S) -> Self {
    Self {
      candidate: candidate.into(),
      ..Default::default()
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
  Connecting,
  Connected,
  Disconnected,
  Failed,
  Closed,
}

impl ConnectionState {
  /// States after which the session will not recover on its own
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Failed | Self::Closed)
  }
}

pub enum TransportEvent {
  /// A local candidate to be sent to the remote peer
  LocalCandidate(IceCandidate),
  ConnectionState(ConnectionState),
  /// A channel opened by the remote peer
  Channel(DataChannel),
}

impl std::fmt::Debug for TransportEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
      Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
      Self::Channel(c) => f.debug_tuple("Channel").field(&c.label()).finish(),
    }
  }
}

pub type TransportEvents = UnboundedReceiver<TransportEvent>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
  #[error("Operation invalid in signaling state {state}: {operation}")]
  InvalidState {
    state: &'static str,
    operation: &'static str,
  },
  #[error("No remote description has been applied")]
  NoRemoteDescription,
  #[error("Session description rejected: {0}")]
  InvalidDescription(String),
  #[error("Transport closed")]
  Closed,
  #[error("Transport failure: {0}")]
  Backend(Arc<str>),
}

impl TransportError {
  pub fn backend<E: std::fmt::Display>(error: E) -> Self {
    Self::Backend(Arc::from(error.to_string()))
  }
}

/// One labelled, ordered, reliable message channel
///
/// Dropping the outbound half closes the channel for writing; the inbound
/// half yields `None` once the channel or its transport is gone.
pub struct DataChannel {
  label: String,
  outbound: UnboundedSender<Bytes>,
  inbound: UnboundedReceiver<Bytes>,
}

impl DataChannel {
  pub fn new(
    label: impl Into<String>,
    outbound: UnboundedSender<Bytes>,
    inbound: UnboundedReceiver<Bytes>,
  ) -> Self {
    Self {
      label: label.into(),
      outbound,
      inbound,
    }
  }

  /// Two directly connected ends of a channel, without any transport between them
  pub fn pair(label: &str) -> (DataChannel, DataChannel) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
      DataChannel::new(label, left_tx, left_rx),
      DataChannel::new(label, right_tx, right_rx),
    )
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn send(&self, message: Bytes) -> Result<(), TransportError> {
    self
      .outbound
      .send(message)
      .map_err(|_| TransportError::Closed)
  }

  pub async fn recv(&mut self) -> Option<Bytes> {
    self.inbound.recv().await
  }

  pub fn into_parts(self) -> (String, UnboundedSender<Bytes>, UnboundedReceiver<Bytes>) {
    (self.label, self.outbound, self.inbound)
  }
}

/// One negotiated session with a remote peer
///
/// Methods mirror the offer/answer model: descriptions move the signaling
/// state between stable, have-local-offer and have-remote-offer, and
/// candidates may only be applied once a remote description exists.
pub trait PeerTransport: Send + Sync {
  fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

  fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

  fn set_local_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>>;

  fn set_remote_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Abandons an outstanding local offer, returning to the stable state
  fn rollback(&self) -> BoxFuture<'_, Result<(), TransportError>>;

  fn add_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Creates a channel; messages sent before the session connects are queued
  fn open_channel<'a>(&'a self, label: &'a str)
    -> BoxFuture<'a, Result<DataChannel, TransportError>>;

  fn close(&self) -> BoxFuture<'_, ()>;
}

pub type ArcTransport = Arc<dyn PeerTransport + 'static>;

/// Produces fresh transports; a session asks for a new one after each failure
pub trait PeerTransportFactory: Send + Sync {
  fn create(&self) -> BoxFuture<'_, Result<(ArcTransport, TransportEvents), TransportError>>;
}

/// ICE configuration handed to transports that traverse NATs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
  pub ice_servers: Vec<IceServer>,
  /// Only use relayed candidates
  pub relay_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
  pub urls: Vec<String>,
  pub username: Option<String>,
  pub credential: Option<String>,
}

impl IceServer {
  pub fn new<S: Into<String>>(url: S) -> Self {
    Self {
      urls: vec![url.into()],
      ..Default::default()
    }
  }

  pub fn with_credentials(mut self, username: String, credential: String) -> Self {
    self.username = Some(username);
    self.credential = Some(credential);
    self
  }
}
