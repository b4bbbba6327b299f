// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SOCKS5 wire encodings shared by the SOCKS frontend
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Destination, ProtocolError};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTHENTICATION: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const COMMAND_CONNECT: u8 = 0x01;
pub const COMMAND_UDP_ASSOCIATE: u8 = 0x03;

pub const ADDRESS_IPV4: u8 = 0x01;
pub const ADDRESS_DOMAIN: u8 = 0x03;
pub const ADDRESS_IPV6: u8 = 0x04;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  CommandNotSupported = 0x07,
}

/// A reply with an IPv4 bound address; `0.0.0.0:0` for CONNECT outcomes
pub fn reply(code: ReplyCode, bound_ip: Ipv4Addr, bound_port: u16) -> [u8; 10] {
  let ip = bound_ip.octets();
  let port = bound_port.to_be_bytes();
  [
    SOCKS_VERSION,
    code as u8,
    0x00,
    ADDRESS_IPV4,
    ip[0],
    ip[1],
    ip[2],
    ip[3],
    port[0],
    port[1],
  ]
}

pub fn unbound_reply(code: ReplyCode) -> [u8; 10] {
  reply(code, Ipv4Addr::UNSPECIFIED, 0)
}

/// Reads `address type | address | port` as used by requests
pub async fn read_address<R: AsyncRead + Unpin>(
  reader: &mut R,
) -> Result<Destination, ReadAddressError> {
  let address_type = reader.read_u8().await?;
  let host = match address_type {
    ADDRESS_IPV4 => {
      let mut octets = [0u8; 4];
      reader.read_exact(&mut octets).await?;
      Ipv4Addr::from(octets).to_string()
    }
    ADDRESS_DOMAIN => {
      let length = reader.read_u8().await? as usize;
      let mut name = vec![0u8; length];
      reader.read_exact(&mut name).await?;
      String::from_utf8(name).map_err(|_| ProtocolError::InvalidUtf8)?
    }
    ADDRESS_IPV6 => {
      let mut octets = [0u8; 16];
      reader.read_exact(&mut octets).await?;
      Ipv6Addr::from(octets).to_string()
    }
    other => return Err(ProtocolError::UnsupportedAddressType(other).into()),
  };
  let port = reader.read_u16().await?;
  Ok(Destination::new(host, port))
}

#[derive(thiserror::Error, Debug)]
pub enum ReadAddressError {
  #[error("Failed reading SOCKS address: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
}

/// A datagram received on a SOCKS5 UDP relay socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpRequest {
  pub destination: Destination,
  pub payload: Bytes,
}

/// Decodes a SOCKS5 UDP request header and payload
///
/// Returns `Ok(None)` for datagrams that are well-formed but must be dropped:
/// fragments and IPv6 destinations, neither of which are relayed.
pub fn decode_udp_request(datagram: &[u8]) -> Result<Option<UdpRequest>, ProtocolError> {
  const FIXED: usize = 4;
  if datagram.len() < FIXED {
    return Err(ProtocolError::Truncated {
      expected: FIXED,
      received: datagram.len(),
    });
  }
  if datagram[2] != 0x00 {
    return Ok(None);
  }
  let (host, rest) = match datagram[3] {
    ADDRESS_IPV4 => {
      let body = &datagram[FIXED..];
      if body.len() < 4 + 2 {
        return Err(ProtocolError::Truncated {
          expected: FIXED + 6,
          received: datagram.len(),
        });
      }
      let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
      (ip.to_string(), &body[4..])
    }
    ADDRESS_DOMAIN => {
      let body = &datagram[FIXED..];
      let length = *body.first().ok_or(ProtocolError::Truncated {
        expected: FIXED + 1,
        received: datagram.len(),
      })? as usize;
      if body.len() < 1 + length + 2 {
        return Err(ProtocolError::Truncated {
          expected: FIXED + 1 + length + 2,
          received: datagram.len(),
        });
      }
      let name = std::str::from_utf8(&body[1..1 + length])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_owned();
      (name, &body[1 + length..])
    }
    ADDRESS_IPV6 => return Ok(None),
    other => return Err(ProtocolError::UnsupportedAddressType(other)),
  };
  let port = u16::from_be_bytes([rest[0], rest[1]]);
  Ok(Some(UdpRequest {
    destination: Destination::new(host, port),
    payload: Bytes::copy_from_slice(&rest[2..]),
  }))
}

/// Encodes a SOCKS5 UDP response; the source is always written as a domain name
pub fn encode_udp_response(host: &str, port: u16, payload: &[u8]) -> Result<Bytes, ProtocolError> {
  let host_len = u8::try_from(host.len()).map_err(|_| ProtocolError::HostTooLong(host.len()))?;
  let mut out = BytesMut::with_capacity(4 + 1 + host.len() + 2 + payload.len());
  out.put_slice(&[0x00, 0x00, 0x00, ADDRESS_DOMAIN, host_len]);
  out.put_slice(host.as_bytes());
  out.put_u16(port);
  out.put_slice(payload);
  Ok(out.freeze())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_replies_match_wire_layout() {
    assert_eq!(
      unbound_reply(ReplyCode::Succeeded),
      [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
      unbound_reply(ReplyCode::GeneralFailure),
      [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
      reply(ReplyCode::Succeeded, Ipv4Addr::LOCALHOST, 0x1234),
      [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x12, 0x34]
    );
  }

  #[tokio::test]
  async fn reads_each_address_type() {
    let mut ipv4: &[u8] = &[0x01, 10, 0, 0, 1, 0x00, 0x50];
    assert_eq!(
      read_address(&mut ipv4).await.unwrap(),
      Destination::new("10.0.0.1", 80)
    );
    let mut domain: &[u8] = &[0x03, 3, b'a', b'b', b'c', 0x01, 0xBB];
    assert_eq!(
      read_address(&mut domain).await.unwrap(),
      Destination::new("abc", 443)
    );
    let mut ipv6 = vec![0x04];
    ipv6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    ipv6.extend_from_slice(&[0x00, 0x16]);
    assert_eq!(
      read_address(&mut ipv6.as_slice()).await.unwrap(),
      Destination::new("::1", 22)
    );
    let mut unknown: &[u8] = &[0x09];
    assert!(matches!(
      read_address(&mut unknown).await,
      Err(ReadAddressError::Protocol(
        ProtocolError::UnsupportedAddressType(0x09)
      ))
    ));
  }

  #[test]
  fn udp_request_ipv4_and_domain() {
    let ipv4 = [0, 0, 0, 0x01, 8, 8, 4, 4, 0, 53, b'q'];
    assert_eq!(
      decode_udp_request(&ipv4).unwrap(),
      Some(UdpRequest {
        destination: Destination::new("8.8.4.4", 53),
        payload: Bytes::from_static(b"q"),
      })
    );
    let domain = [0, 0, 0, 0x03, 2, b'h', b'x', 0x1F, 0x90, 1, 2];
    assert_eq!(
      decode_udp_request(&domain).unwrap(),
      Some(UdpRequest {
        destination: Destination::new("hx", 8080),
        payload: Bytes::from_static(&[1, 2]),
      })
    );
  }

  #[test]
  fn fragments_and_ipv6_are_dropped() {
    let fragment = [0, 0, 1, 0x01, 8, 8, 4, 4, 0, 53];
    assert_eq!(decode_udp_request(&fragment).unwrap(), None);
    let mut ipv6 = vec![0, 0, 0, 0x04];
    ipv6.extend_from_slice(&[0u8; 18]);
    assert_eq!(decode_udp_request(&ipv6).unwrap(), None);
  }

  #[test]
  fn truncated_udp_request_is_an_error() {
    assert!(decode_udp_request(&[0, 0, 0]).is_err());
    assert!(decode_udp_request(&[0, 0, 0, 0x01, 1, 2]).is_err());
    assert!(decode_udp_request(&[0, 0, 0, 0x03, 9, b'a']).is_err());
  }

  #[test]
  fn udp_response_uses_domain_address_type() {
    let encoded = encode_udp_response("1.2.3.4", 53, b"ok").unwrap();
    let mut expected = vec![0, 0, 0, 0x03, 7];
    expected.extend_from_slice(b"1.2.3.4");
    expected.extend_from_slice(&[0, 53, b'o', b'k']);
    assert_eq!(encoded.as_ref(), expected.as_slice());
  }
}
