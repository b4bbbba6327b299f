// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire types carried over the multiplexed `mux` data channel
//!
//! Every frame is `type(1) | stream id(4, big-endian) | payload`. Decoding is
//! strict: a frame is either a fully validated [Frame] or a [ProtocolError],
//! never a partially-understood message.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod socks;
pub mod udp;

pub use frame::{Frame, FrameType};
pub use udp::UdpRelayMessage;

/// Identifies one logical stream within a multiplexed channel
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamId(u32);

impl StreamId {
  pub const fn new(inner: u32) -> StreamId {
    Self(inner)
  }

  pub fn inner(&self) -> u32 {
    self.0
  }
}

impl From<u32> for StreamId {
  fn from(inner: u32) -> Self {
    Self::new(inner)
  }
}

impl From<StreamId> for u32 {
  fn from(id: StreamId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for StreamId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "StreamId({})", self.0)
  }
}

impl Display for StreamId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A `host:port` pair as requested by a local client
///
/// The host is kept textual; resolution happens on the dialing side.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  pub host: String,
  pub port: u16,
}

impl Destination {
  pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }
}

impl std::fmt::Debug for Destination {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    Display::fmt(self, f)
  }
}

impl Display for Destination {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
  #[default]
  Tcp,
  Udp,
}

/// What an OPEN frame asks the remote peer to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
  /// Dial a TCP connection and bridge it to the stream
  Tcp(Destination),
  /// Bind a UDP socket and exchange relay messages over the stream
  Udp,
}

/// The validated payload of an OPEN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
  pub target: OpenTarget,
  pub token: Option<String>,
}

impl OpenRequest {
  pub fn tcp(destination: Destination, token: Option<String>) -> Self {
    Self {
      target: OpenTarget::Tcp(destination),
      token,
    }
  }

  pub fn udp(token: Option<String>) -> Self {
    Self {
      target: OpenTarget::Udp,
      token,
    }
  }

  pub fn kind(&self) -> StreamKind {
    match self.target {
      OpenTarget::Tcp(_) => StreamKind::Tcp,
      OpenTarget::Udp => StreamKind::Udp,
    }
  }
}

/// JSON shape of the OPEN payload on the wire
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct OpenRequestWire {
  #[serde(default)]
  pub kind: StreamKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token: Option<String>,
}

impl From<&OpenRequest> for OpenRequestWire {
  fn from(request: &OpenRequest) -> Self {
    let (host, port) = match &request.target {
      OpenTarget::Tcp(destination) => (Some(destination.host.clone()), Some(destination.port)),
      OpenTarget::Udp => (None, None),
    };
    Self {
      kind: request.kind(),
      host,
      port,
      token: request.token.clone(),
    }
  }
}

impl TryFrom<OpenRequestWire> for OpenRequest {
  type Error = String;

  fn try_from(wire: OpenRequestWire) -> Result<Self, Self::Error> {
    let target = match wire.kind {
      StreamKind::Tcp => match (wire.host, wire.port) {
        (Some(host), Some(port)) if !host.is_empty() => {
          OpenTarget::Tcp(Destination::new(host, port))
        }
        (Some(_), Some(_)) => return Err(String::from("empty host")),
        (None, _) => return Err(String::from("missing host")),
        (_, None) => return Err(String::from("missing port")),
      },
      StreamKind::Udp => OpenTarget::Udp,
    };
    Ok(Self {
      target,
      token: wire.token,
    })
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
  #[error("Message truncated; expected at least {expected} bytes, received {received}")]
  Truncated { expected: usize, received: usize },
  #[error("Unknown frame type {0:#04x}")]
  UnknownFrameType(u8),
  #[error("Frame {frame_type:?} carries an unexpected payload of {length} bytes")]
  UnexpectedPayload { frame_type: FrameType, length: usize },
  #[error("ACK status must be 0 or 1; received {0}")]
  InvalidAckStatus(u8),
  #[error("OPEN for stream {id} is malformed: {reason}")]
  MalformedOpen { id: StreamId, reason: String },
  #[error("Text field is not valid UTF-8")]
  InvalidUtf8,
  #[error("Host name of {0} bytes exceeds the 255 byte limit")]
  HostTooLong(usize),
  #[error("Unsupported protocol version {0}")]
  UnsupportedVersion(u8),
  #[error("Unsupported address type {0:#04x}")]
  UnsupportedAddressType(u8),
  #[error("Malformed request: {0}")]
  MalformedRequest(String),
}

/// Failures surfaced to the owner of a logical stream
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
  #[error("Remote peer failed to reach the destination")]
  DialFailed,
  #[error("Timed out waiting for the remote peer")]
  TimedOut,
  #[error("Open request rejected; token mismatch")]
  AuthenticationFailed,
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),
  #[error("Stream reset by remote: {0}")]
  Reset(String),
  #[error("Transport channel lost")]
  TransportError,
  #[error("Stream closed locally")]
  LocallyClosed,
}

impl From<TunnelError> for std::io::Error {
  fn from(error: TunnelError) -> Self {
    use std::io::ErrorKind;
    let kind = match &error {
      TunnelError::DialFailed => ErrorKind::ConnectionRefused,
      TunnelError::TimedOut => ErrorKind::TimedOut,
      TunnelError::AuthenticationFailed => ErrorKind::PermissionDenied,
      TunnelError::Protocol(_) => ErrorKind::InvalidData,
      TunnelError::Reset(_) => ErrorKind::ConnectionReset,
      TunnelError::TransportError => ErrorKind::BrokenPipe,
      TunnelError::LocallyClosed => ErrorKind::NotConnected,
    };
    std::io::Error::new(kind, error)
  }
}
