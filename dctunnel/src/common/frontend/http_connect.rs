// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP CONNECT proxy frontend
use std::time::Duration;

use bytes::Bytes;
use tokio::{
  io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
  },
  net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use super::{accept_loop, ArcOpener, StreamOpener};
use crate::{
  common::protocol::{Destination, TunnelError},
  util::proxy_bidirectional,
};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_CONNECT_PORT: u16 = 443;
/// Upper bound on the request line plus headers
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(thiserror::Error, Debug)]
pub enum HttpConnectError {
  #[error("IO failure on the client connection: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed CONNECT request: {0}")]
  Malformed(String),
  #[error("Request head exceeds 64 KiB")]
  HeadTooLarge,
  #[error("Client closed the connection before sending a request")]
  NoRequest,
  #[error(transparent)]
  Tunnel(#[from] TunnelError),
}

/// A parsed CONNECT head and any bytes the client sent past it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
  pub destination: Destination,
  pub leftover: Bytes,
}

/// Parses `CONNECT host:port HTTP/1.1` into a destination
pub fn parse_connect_target(request_line: &str) -> Result<Destination, HttpConnectError> {
  let mut parts = request_line.split_whitespace();
  let method = parts
    .next()
    .ok_or_else(|| HttpConnectError::Malformed("empty request line".into()))?;
  if !method.eq_ignore_ascii_case("CONNECT") {
    return Err(HttpConnectError::Malformed(format!(
      "unsupported method {}",
      method
    )));
  }
  let authority = parts
    .next()
    .ok_or_else(|| HttpConnectError::Malformed("missing target".into()))?;
  parse_authority(authority)
}

fn parse_authority(authority: &str) -> Result<Destination, HttpConnectError> {
  let malformed = || HttpConnectError::Malformed(format!("bad target {}", authority));
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let (host, after) = rest.split_once(']').ok_or_else(malformed)?;
    let port = match after {
      "" => None,
      after => Some(after.strip_prefix(':').ok_or_else(malformed)?),
    };
    (host, port)
  } else {
    match authority.rsplit_once(':') {
      Some((host, _)) if host.contains(':') => return Err(malformed()),
      Some((host, port)) => (host, Some(port)),
      None => (authority, None),
    }
  };
  if host.is_empty() {
    return Err(malformed());
  }
  let port = match port {
    None => DEFAULT_CONNECT_PORT,
    Some(port) => port.parse::<u16>().map_err(|_| malformed())?,
  };
  if port == 0 {
    return Err(malformed());
  }
  Ok(Destination::new(host, port))
}

/// Reads the request line and headers, keeping whatever was buffered past them
pub async fn read_connect_request<S: AsyncRead + Unpin>(
  client: &mut S,
) -> Result<ConnectRequest, HttpConnectError> {
  let mut reader = BufReader::new(client);
  let mut line = String::new();
  let mut total = read_head_line(&mut reader, &mut line, 0).await?;
  if total == 0 {
    return Err(HttpConnectError::NoRequest);
  }
  let destination = parse_connect_target(line.trim_end())?;
  loop {
    line.clear();
    let read = read_head_line(&mut reader, &mut line, total).await?;
    if read == 0 {
      return Err(HttpConnectError::Malformed(
        "request head ended without a blank line".into(),
      ));
    }
    total += read;
    if line == "\r\n" || line == "\n" {
      break;
    }
  }
  let leftover = Bytes::copy_from_slice(reader.buffer());
  Ok(ConnectRequest {
    destination,
    leftover,
  })
}

async fn read_head_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  line: &mut String,
  consumed: usize,
) -> Result<usize, HttpConnectError> {
  let limit = (MAX_HEAD_SIZE - consumed + 1) as u64;
  let read = reader.take(limit).read_line(line).await.map_err(|error| {
    if error.kind() == std::io::ErrorKind::InvalidData {
      HttpConnectError::Malformed("request head is not valid UTF-8".into())
    } else {
      HttpConnectError::Io(error)
    }
  })?;
  if consumed + read > MAX_HEAD_SIZE {
    return Err(HttpConnectError::HeadTooLarge);
  }
  Ok(read)
}

/// Status line for an open that did not produce a stream
pub fn failure_status(error: &TunnelError) -> (u16, &'static str) {
  match error {
    TunnelError::TimedOut | TunnelError::TransportError => (504, "Gateway Timeout"),
    _ => (502, "Bad Gateway"),
  }
}

async fn send_response<S: AsyncWrite + Unpin>(
  client: &mut S,
  status: u16,
  reason: &str,
) -> std::io::Result<()> {
  let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
  client.write_all(response.as_bytes()).await?;
  client.flush().await
}

/// Serves one client connection from request head to tunnel teardown
pub async fn handle_connection<S, O>(
  mut client: S,
  opener: &O,
  open_timeout: Duration,
) -> Result<(), HttpConnectError>
where
  S: AsyncRead + AsyncWrite + Unpin,
  O: StreamOpener + ?Sized,
{
  let request = match read_connect_request(&mut client).await {
    Ok(request) => request,
    Err(error @ HttpConnectError::Malformed(_)) | Err(error @ HttpConnectError::HeadTooLarge) => {
      let _ = send_response(&mut client, 400, "Bad Request").await;
      return Err(error);
    }
    Err(error) => return Err(error),
  };
  tracing::debug!(destination = %request.destination, "CONNECT requested");
  let mut stream = match opener
    .open_stream(request.destination.clone(), open_timeout)
    .await
  {
    Ok(stream) => stream,
    Err(error) => {
      let (status, reason) = failure_status(&error);
      tracing::info!(destination = %request.destination, %error, status, "CONNECT failed");
      let _ = send_response(&mut client, status, reason).await;
      return Err(error.into());
    }
  };
  client.write_all(ESTABLISHED).await?;
  client.flush().await?;
  if !request.leftover.is_empty() {
    stream.write_all(&request.leftover).await?;
  }
  let (sent, received) = proxy_bidirectional(&mut client, &mut stream).await?;
  tracing::debug!(stream_id = %stream.id(), sent, received, "CONNECT tunnel finished");
  Ok(())
}

/// Runs the frontend on `listener` until `shutdown` fires
pub async fn serve(
  listener: TcpListener,
  opener: ArcOpener,
  open_timeout: Duration,
  shutdown: CancellationToken,
) {
  if let Ok(address) = listener.local_addr() {
    tracing::info!(%address, "HTTP CONNECT proxy listening");
  }
  accept_loop(listener, shutdown, move |client, _peer| {
    let opener = opener.clone();
    async move {
      if let Err(error) = handle_connection(client, opener.as_ref(), open_timeout).await {
        tracing::debug!(%error, "HTTP CONNECT connection ended with error");
      }
    }
  })
  .await
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;
  use crate::common::frontend::testing::{echo_tunnel, echo_tunnel_with_remote, REFUSED_PORT};

  const TIMEOUT: Duration = Duration::from_secs(5);

  #[test]
  fn parses_targets() {
    assert_eq!(
      parse_connect_target("CONNECT example.com:8443 HTTP/1.1").unwrap(),
      Destination::new("example.com", 8443)
    );
    assert_eq!(
      parse_connect_target("CONNECT example.com HTTP/1.1").unwrap(),
      Destination::new("example.com", 443)
    );
    assert_eq!(
      parse_connect_target("CONNECT [::1]:22 HTTP/1.1").unwrap(),
      Destination::new("::1", 22)
    );
    assert_eq!(
      parse_connect_target("CONNECT [2001:db8::1] HTTP/1.1").unwrap(),
      Destination::new("2001:db8::1", 443)
    );
  }

  #[test]
  fn rejects_bad_requests() {
    for line in [
      "GET / HTTP/1.1",
      "CONNECT",
      "CONNECT :80 HTTP/1.1",
      "CONNECT host:port HTTP/1.1",
      "CONNECT host:70000 HTTP/1.1",
      "CONNECT ::1:80 HTTP/1.1",
      "CONNECT [::1 HTTP/1.1",
      "",
    ] {
      assert!(
        matches!(parse_connect_target(line), Err(HttpConnectError::Malformed(_))),
        "{:?} should be rejected",
        line
      );
    }
  }

  #[test]
  fn maps_open_failures_to_status() {
    assert_eq!(failure_status(&TunnelError::TimedOut).0, 504);
    assert_eq!(failure_status(&TunnelError::TransportError).0, 504);
    assert_eq!(failure_status(&TunnelError::DialFailed).0, 502);
    assert_eq!(failure_status(&TunnelError::AuthenticationFailed).0, 502);
  }

  #[tokio::test]
  async fn keeps_bytes_buffered_past_the_head() {
    let mut input: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\nhello";
    let request = read_connect_request(&mut input).await.unwrap();
    assert_eq!(request.destination, Destination::new("example.com", 443));
    assert_eq!(&request.leftover[..], b"hello");
  }

  #[tokio::test]
  async fn oversized_head_is_a_bad_request() {
    let (mut client, server) = tokio::io::duplex(256 * 1024);
    let handle = echo_tunnel();
    let task = tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await });
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n")
      .await
      .unwrap();
    let filler = format!("X-Filler: {}\r\n", "a".repeat(1024));
    for _ in 0..80 {
      client.write_all(filler.as_bytes()).await.unwrap();
    }
    let result = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(HttpConnectError::HeadTooLarge)));
    let mut response = vec![0u8; 64];
    let read = client.read(&mut response).await.unwrap();
    assert!(response[..read].starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
  }

  #[tokio::test]
  async fn established_reply_precedes_tunneled_bytes() {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let handle = echo_tunnel();
    let task = tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await });
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
      .await
      .unwrap();
    let mut reply = vec![0u8; ESTABLISHED.len()];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&reply[..], ESTABLISHED);

    client.write_all(b" and late").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut echoed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&echoed[..], b"early and late");
    tokio::time::timeout(TIMEOUT, task)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn channel_loss_closes_the_client_connection() {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (handle, remote) = echo_tunnel_with_remote();
    let task = {
      let handle = handle.clone();
      tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await })
    };
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let mut reply = vec![0u8; ESTABLISHED.len()];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
      .await
      .unwrap()
      .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&echoed, b"ping");

    remote.shutdown();
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
      .await
      .unwrap()
      .unwrap();
    assert!(rest.is_empty());
    let result = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(HttpConnectError::Io(_))));
    tokio::time::timeout(TIMEOUT, handle.closed()).await.unwrap();
  }

  #[tokio::test]
  async fn rejected_open_is_a_bad_gateway() {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let handle = echo_tunnel();
    let task = {
      let handle = handle.clone();
      tokio::spawn(async move { handle_connection(server, &handle, TIMEOUT).await })
    };
    let request = format!("CONNECT example.com:{} HTTP/1.1\r\n\r\n", REFUSED_PORT);
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut response))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&response[..], b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    let result = task.await.unwrap();
    assert!(matches!(
      result,
      Err(HttpConnectError::Tunnel(TunnelError::DialFailed))
    ));
    assert_eq!(handle.active_streams().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn unanswered_open_is_a_gateway_timeout() {
    let (local, _remote) = crate::common::transport::DataChannel::pair("mux");
    let (handle, _) = crate::common::mux::StreamMultiplexer::spawn(
      local,
      crate::common::mux::MultiplexerSide::Initiator,
      None,
    );
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move {
      handle_connection(server, &handle, Duration::from_millis(100)).await
    });
    client
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut response))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&response[..], b"HTTP/1.1 504 Gateway Timeout\r\n\r\n");
    assert!(matches!(
      task.await.unwrap(),
      Err(HttpConnectError::Tunnel(TunnelError::TimedOut))
    ));
  }
}
