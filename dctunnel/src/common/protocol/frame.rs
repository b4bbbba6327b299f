// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::{BufMut, Bytes, BytesMut};

use super::{OpenRequest, OpenRequestWire, ProtocolError, StreamId, UdpRelayMessage};

/// Length of the fixed `type | id` prefix of every frame
pub const FRAME_HEADER_LENGTH: usize = 1 + 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
  Open = 0x01,
  Data = 0x02,
  Close = 0x03,
  Reset = 0x04,
  Ack = 0x05,
  Datagram = 0x06,
}

impl TryFrom<u8> for FrameType {
  type Error = ProtocolError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    Ok(match value {
      0x01 => Self::Open,
      0x02 => Self::Data,
      0x03 => Self::Close,
      0x04 => Self::Reset,
      0x05 => Self::Ack,
      0x06 => Self::Datagram,
      other => return Err(ProtocolError::UnknownFrameType(other)),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  Open { id: StreamId, request: OpenRequest },
  Data { id: StreamId, payload: Bytes },
  Close { id: StreamId },
  Reset { id: StreamId, reason: String },
  Ack { id: StreamId, ok: bool },
  Datagram { id: StreamId, message: UdpRelayMessage },
}

impl Frame {
  pub fn id(&self) -> StreamId {
    match self {
      Frame::Open { id, .. }
      | Frame::Data { id, .. }
      | Frame::Close { id }
      | Frame::Reset { id, .. }
      | Frame::Ack { id, .. }
      | Frame::Datagram { id, .. } => *id,
    }
  }

  pub fn frame_type(&self) -> FrameType {
    match self {
      Frame::Open { .. } => FrameType::Open,
      Frame::Data { .. } => FrameType::Data,
      Frame::Close { .. } => FrameType::Close,
      Frame::Reset { .. } => FrameType::Reset,
      Frame::Ack { .. } => FrameType::Ack,
      Frame::Datagram { .. } => FrameType::Datagram,
    }
  }

  pub fn encode(&self) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LENGTH + self.payload_hint());
    out.put_u8(self.frame_type() as u8);
    out.put_u32(self.id().inner());
    match self {
      Frame::Open { request, .. } => {
        let wire = OpenRequestWire::from(request);
        let json = serde_json::to_vec(&wire)
          .map_err(|e| ProtocolError::MalformedRequest(e.to_string()))?;
        out.put_slice(&json);
      }
      Frame::Data { payload, .. } => out.put_slice(payload),
      Frame::Close { .. } => {}
      Frame::Reset { reason, .. } => out.put_slice(reason.as_bytes()),
      Frame::Ack { ok, .. } => out.put_u8(u8::from(*ok)),
      Frame::Datagram { message, .. } => message.encode_into(&mut out)?,
    }
    Ok(out.freeze())
  }

  pub fn decode(mut raw: Bytes) -> Result<Frame, ProtocolError> {
    if raw.len() < FRAME_HEADER_LENGTH {
      return Err(ProtocolError::Truncated {
        expected: FRAME_HEADER_LENGTH,
        received: raw.len(),
      });
    }
    let frame_type = FrameType::try_from(raw[0])?;
    let id = StreamId::new(u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]));
    let payload = raw.split_off(FRAME_HEADER_LENGTH);
    Ok(match frame_type {
      FrameType::Open => {
        let wire: OpenRequestWire =
          serde_json::from_slice(&payload).map_err(|e| ProtocolError::MalformedOpen {
            id,
            reason: e.to_string(),
          })?;
        let request = OpenRequest::try_from(wire)
          .map_err(|reason| ProtocolError::MalformedOpen { id, reason })?;
        Frame::Open { id, request }
      }
      FrameType::Data => Frame::Data { id, payload },
      FrameType::Close => {
        if !payload.is_empty() {
          return Err(ProtocolError::UnexpectedPayload {
            frame_type,
            length: payload.len(),
          });
        }
        Frame::Close { id }
      }
      FrameType::Reset => {
        let reason = std::str::from_utf8(&payload)
          .map_err(|_| ProtocolError::InvalidUtf8)?
          .to_owned();
        Frame::Reset { id, reason }
      }
      FrameType::Ack => match payload.as_ref() {
        [1] => Frame::Ack { id, ok: true },
        [0] => Frame::Ack { id, ok: false },
        [other] => return Err(ProtocolError::InvalidAckStatus(*other)),
        _ => {
          return Err(ProtocolError::UnexpectedPayload {
            frame_type,
            length: payload.len(),
          })
        }
      },
      FrameType::Datagram => Frame::Datagram {
        id,
        message: UdpRelayMessage::decode(&payload)?,
      },
    })
  }

  fn payload_hint(&self) -> usize {
    match self {
      Frame::Data { payload, .. } => payload.len(),
      Frame::Datagram { message, .. } => message.encoded_len(),
      Frame::Reset { reason, .. } => reason.len(),
      Frame::Ack { .. } => 1,
      Frame::Open { .. } => 64,
      Frame::Close { .. } => 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use super::{Frame, FrameType};
  use crate::common::protocol::{
    Destination, OpenRequest, ProtocolError, StreamId, UdpRelayMessage,
  };

  #[test]
  fn data_frame_layout() {
    let frame = Frame::Data {
      id: StreamId::new(0x01020304),
      payload: Bytes::from_static(b"hi"),
    };
    let encoded = frame.encode().unwrap();
    assert_eq!(encoded.as_ref(), &[0x02, 0x01, 0x02, 0x03, 0x04, b'h', b'i']);
    assert_eq!(Frame::decode(encoded).unwrap(), frame);
  }

  #[test]
  fn ack_carries_single_status_byte() {
    let ok = Frame::Ack {
      id: StreamId::new(7),
      ok: true,
    }
    .encode()
    .unwrap();
    assert_eq!(ok.as_ref(), &[0x05, 0, 0, 0, 7, 1]);
    let failed = Frame::Ack {
      id: StreamId::new(7),
      ok: false,
    }
    .encode()
    .unwrap();
    assert_eq!(failed.as_ref(), &[0x05, 0, 0, 0, 7, 0]);
  }

  #[test]
  fn open_frame_carries_json_destination() {
    let frame = Frame::Open {
      id: StreamId::new(1),
      request: OpenRequest::tcp(Destination::new("example.com", 443), None),
    };
    let encoded = frame.encode().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&encoded[5..]).unwrap();
    assert_eq!(json["host"], "example.com");
    assert_eq!(json["port"], 443);
    assert_eq!(Frame::decode(encoded).unwrap(), frame);
  }

  #[test]
  fn open_frame_accepts_minimal_json() {
    let mut raw = vec![0x01, 0, 0, 0, 9];
    raw.extend_from_slice(br#"{"host":"10.0.0.1","port":22}"#);
    match Frame::decode(Bytes::from(raw)).unwrap() {
      Frame::Open { id, request } => {
        assert_eq!(id, StreamId::new(9));
        assert_eq!(request, OpenRequest::tcp(Destination::new("10.0.0.1", 22), None));
      }
      other => panic!("Unexpected frame {:?}", other),
    }
  }

  #[test]
  fn malformed_frames_are_rejected() {
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x02, 0, 0])),
      Err(ProtocolError::Truncated { .. })
    ));
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x09, 0, 0, 0, 1])),
      Err(ProtocolError::UnknownFrameType(0x09))
    ));
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x05, 0, 0, 0, 1, 2])),
      Err(ProtocolError::InvalidAckStatus(2))
    ));
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x05, 0, 0, 0, 1])),
      Err(ProtocolError::UnexpectedPayload {
        frame_type: FrameType::Ack,
        ..
      })
    ));
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x03, 0, 0, 0, 1, 0])),
      Err(ProtocolError::UnexpectedPayload {
        frame_type: FrameType::Close,
        ..
      })
    ));
    assert!(matches!(
      Frame::decode(Bytes::from_static(b"\x01\x00\x00\x00\x04not json")),
      Err(ProtocolError::MalformedOpen { id, .. }) if id == StreamId::new(4)
    ));
  }

  #[test]
  fn reset_reason_is_utf8() {
    let frame = Frame::Reset {
      id: StreamId::new(3),
      reason: String::from("timeout"),
    };
    assert_eq!(Frame::decode(frame.encode().unwrap()).unwrap(), frame);
    assert!(matches!(
      Frame::decode(Bytes::from_static(&[0x04, 0, 0, 0, 3, 0xff, 0xfe])),
      Err(ProtocolError::InvalidUtf8)
    ));
  }

  #[test]
  fn datagram_frame_is_distinct_from_data() {
    let frame = Frame::Datagram {
      id: StreamId::new(2),
      message: UdpRelayMessage::new("8.8.8.8", 53, Bytes::from_static(b"query")),
    };
    let encoded = frame.encode().unwrap();
    assert_eq!(encoded[0], FrameType::Datagram as u8);
    assert_eq!(Frame::decode(encoded).unwrap(), frame);
  }
}
