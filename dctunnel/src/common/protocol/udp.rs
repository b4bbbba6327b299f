// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::{BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// One datagram exchanged across a UDP association
///
/// From client to host, `host`/`port` name where the datagram should be sent;
/// from host to client they name the true source of a received datagram.
///
/// Encoded as `host length(1) | host | port(2, big-endian) | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpRelayMessage {
  pub host: String,
  pub port: u16,
  pub payload: Bytes,
}

impl UdpRelayMessage {
  pub fn new<H: Into<String>>(host: H, port: u16, payload: Bytes) -> Self {
    Self {
      host: host.into(),
      port,
      payload,
    }
  }

  pub fn encoded_len(&self) -> usize {
    1 + self.host.len() + 2 + self.payload.len()
  }

  pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let host_len =
      u8::try_from(self.host.len()).map_err(|_| ProtocolError::HostTooLong(self.host.len()))?;
    out.reserve(self.encoded_len());
    out.put_u8(host_len);
    out.put_slice(self.host.as_bytes());
    out.put_u16(self.port);
    out.put_slice(&self.payload);
    Ok(())
  }

  pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
    let host_len = *raw.first().ok_or(ProtocolError::Truncated {
      expected: 1,
      received: 0,
    })? as usize;
    let header_len = 1 + host_len + 2;
    if raw.len() < header_len {
      return Err(ProtocolError::Truncated {
        expected: header_len,
        received: raw.len(),
      });
    }
    let host = std::str::from_utf8(&raw[1..1 + host_len])
      .map_err(|_| ProtocolError::InvalidUtf8)?
      .to_owned();
    let port = u16::from_be_bytes([raw[1 + host_len], raw[2 + host_len]]);
    Ok(Self {
      host,
      port,
      payload: Bytes::copy_from_slice(&raw[header_len..]),
    })
  }
}

#[cfg(test)]
mod tests {
  use bytes::{Bytes, BytesMut};

  use super::UdpRelayMessage;
  use crate::common::protocol::ProtocolError;

  #[test]
  fn relay_message_layout() {
    let message = UdpRelayMessage::new("dns", 53, Bytes::from_static(&[0xAA]));
    let mut out = BytesMut::new();
    message.encode_into(&mut out).unwrap();
    assert_eq!(out.as_ref(), &[3, b'd', b'n', b's', 0, 53, 0xAA]);
    assert_eq!(UdpRelayMessage::decode(&out).unwrap(), message);
  }

  #[test]
  fn oversized_host_is_refused() {
    let message = UdpRelayMessage::new("h".repeat(256), 1, Bytes::new());
    let mut out = BytesMut::new();
    assert_eq!(
      message.encode_into(&mut out),
      Err(ProtocolError::HostTooLong(256))
    );
    assert!(out.is_empty());
  }

  #[test]
  fn truncated_header_is_refused() {
    assert!(matches!(
      UdpRelayMessage::decode(&[5, b'a', b'b']),
      Err(ProtocolError::Truncated { expected: 8, received: 3 })
    ));
    assert!(UdpRelayMessage::decode(&[]).is_err());
  }
}
