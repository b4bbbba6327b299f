// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;

use crate::common::transport::IceServer;

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.next().ok_or_else(|| {
        AnyErr::msg("No addresses were resolved from the given host")
      })
    })
}

/// Accepts `ws://` and `wss://` relay endpoints
pub fn parse_signal_url(v: &str) -> Result<String> {
  let rest = v
    .strip_prefix("ws://")
    .or_else(|| v.strip_prefix("wss://"))
    .ok_or_else(|| AnyErr::msg("Signaling URL must use the ws:// or wss:// scheme"))?;
  if rest.is_empty() || rest.starts_with('/') {
    return Err(AnyErr::msg("Signaling URL is missing a host"));
  }
  Ok(v.to_string())
}

/// Parses a comma-separated ICE server list
///
/// Entries are `stun:host:port` or `username:credential@turn:host:port`.
pub fn parse_ice_servers(v: &str) -> Result<Vec<IceServer>> {
  v.split(',')
    .map(str::trim)
    .filter(|entry| !entry.is_empty())
    .map(parse_ice_server)
    .collect()
}

fn parse_ice_server(entry: &str) -> Result<IceServer> {
  let (credentials, url) = match entry.split_once('@') {
    Some((credentials, url)) => (Some(credentials), url),
    None => (None, entry),
  };
  if !["stun:", "stuns:", "turn:", "turns:"]
    .iter()
    .any(|scheme| url.starts_with(scheme))
  {
    return Err(AnyErr::msg(format!(
      "ICE server {} must use a stun, stuns, turn, or turns scheme",
      url
    )));
  }
  let server = IceServer::new(url);
  match credentials {
    None => Ok(server),
    Some(credentials) => match credentials.split_once(':') {
      Some((username, credential)) if !username.is_empty() => {
        Ok(server.with_credentials(username.to_string(), credential.to_string()))
      }
      _ => Err(AnyErr::msg(format!(
        "ICE server credentials for {} must be written as username:credential",
        url
      ))),
    },
  }
}

/// Environment-style flags; `1`, `true`, `yes`, and `on` enable
pub fn parse_flag(v: &str) -> Result<bool> {
  match v.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" | "" => Ok(false),
    other => Err(AnyErr::msg(format!("{} is not a recognized flag value", other))),
  }
}

/// Whole seconds, at least one
pub fn parse_duration_secs(v: &str) -> Result<std::time::Duration> {
  match v.trim().parse::<u64>() {
    Ok(0) => Err(AnyErr::msg("Duration must be at least one second")),
    Ok(secs) => Ok(std::time::Duration::from_secs(secs)),
    Err(_) => Err(AnyErr::msg(format!("{} is not a whole number of seconds", v))),
  }
}

/// Optional secrets; an empty value, as from `TOKEN=`, means none was given
pub fn parse_optional_secret(v: Option<&str>) -> Option<String> {
  v.filter(|secret| !secret.is_empty()).map(String::from)
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_signal_url(v: &str) -> Result<(), String> {
  parse_signal_url(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ice_servers(v: &str) -> Result<(), String> {
  parse_ice_servers(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_duration_secs(v: &str) -> Result<(), String> {
  parse_duration_secs(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_flag(v: &str) -> Result<(), String> {
  parse_flag(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ice_servers_with_and_without_credentials() {
    let servers =
      parse_ice_servers("stun:stun.example.com:3478, alice:s3cr:et@turn:turn.example.com:3478")
        .unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0], IceServer::new("stun:stun.example.com:3478"));
    assert_eq!(
      servers[1],
      IceServer::new("turn:turn.example.com:3478")
        .with_credentials(String::from("alice"), String::from("s3cr:et"))
    );
    assert!(parse_ice_servers("http://example.com").is_err());
    assert!(parse_ice_servers(":pw@turn:example.com").is_err());
    assert!(parse_ice_servers("").unwrap().is_empty());
  }

  #[test]
  fn signal_urls() {
    assert!(parse_signal_url("ws://127.0.0.1:8787/ws").is_ok());
    assert!(parse_signal_url("wss://signal.example.com/ws").is_ok());
    assert!(parse_signal_url("http://signal.example.com").is_err());
    assert!(parse_signal_url("ws:///ws").is_err());
  }

  #[test]
  fn durations() {
    assert_eq!(parse_duration_secs("15").unwrap(), std::time::Duration::from_secs(15));
    assert!(parse_duration_secs("0").is_err());
    assert!(parse_duration_secs("1.5").is_err());
  }

  #[test]
  fn empty_secrets_are_absent() {
    assert_eq!(parse_optional_secret(None), None);
    assert_eq!(parse_optional_secret(Some("")), None);
    assert_eq!(parse_optional_secret(Some("tkn")), Some(String::from("tkn")));
  }

  #[test]
  fn flags() {
    assert!(parse_flag("1").unwrap());
    assert!(parse_flag("TRUE").unwrap());
    assert!(!parse_flag("0").unwrap());
    assert!(parse_flag("maybe").is_err());
  }
}
