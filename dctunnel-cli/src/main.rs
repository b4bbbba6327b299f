// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use dctunnel::{
  common::{
    daemon::DEFAULT_ROOM,
    signaling::{PeerRole, SignalingConfig, DEFAULT_SIGNAL_URL},
    transport::TransportConfig,
  },
  util,
};

use util::validators::{
  parse_duration_secs, parse_flag, parse_ice_servers, parse_optional_secret, parse_signal_url,
  parse_socketaddr, validate_duration_secs, validate_flag, validate_ice_servers, validate_signal_url,
  validate_socketaddr,
};

mod client;
mod host;

const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";

/// Arguments shared by both roles
#[derive(Clone, Debug)]
pub struct PeerArgs {
  pub room: String,
  pub signal_url: String,
  pub signal_token: Option<String>,
  pub transport: TransportConfig,
}

impl PeerArgs {
  pub fn signaling_config(&self, role: PeerRole) -> SignalingConfig {
    let mut config = SignalingConfig::new(self.signal_url.clone(), self.room.clone(), role);
    config.token = self.signal_token.clone();
    config
  }
}

fn peer_args(command: Command<'static>) -> Command<'static> {
  command
    .arg(
      Arg::new("room")
        .long("room")
        .short('r')
        .env("ROOM")
        .default_value(DEFAULT_ROOM)
        .takes_value(true),
    )
    .arg(
      Arg::new("signal")
        .long("signal")
        .short('s')
        .env("SIGNAL")
        .validator(validate_signal_url)
        .default_value(DEFAULT_SIGNAL_URL)
        .takes_value(true),
    )
    .arg(
      Arg::new("signal-token")
        .long("signal-token")
        .env("SIGNAL_TOKEN")
        .hide_env_values(true)
        .takes_value(true)
        .required(false),
    )
    .arg(
      Arg::new("token")
        .long("token")
        .short('t')
        .env("TOKEN")
        .hide_env_values(true)
        .takes_value(true)
        .required(false),
    )
    .arg(
      Arg::new("relay-only")
        .long("relay-only")
        .env("RELAY_ONLY")
        .validator(validate_flag)
        .default_value("0")
        .takes_value(true),
    )
    .arg(
      Arg::new("ice-servers")
        .help("Comma-separated stun:/turn: URLs, optionally prefixed with username:credential@")
        .long("ice-servers")
        .env("ICE_SERVERS")
        .hide_env_values(true)
        .validator(validate_ice_servers)
        .default_value(DEFAULT_ICE_SERVERS)
        .takes_value(true),
    )
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    tracing_subscriber::EnvFilter::new("webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn,info")
  });
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  if let Err(error) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger init failed: {}", error);
  }
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      peer_args(Command::new("client"))
        .about("Expose local HTTP CONNECT and SOCKS5 proxies tunneled to the host")
        .arg(
          Arg::new("http")
            .long("http")
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        )
        .arg(
          Arg::new("socks")
            .long("socks")
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:1080")
            .takes_value(true),
        )
        .arg(
          Arg::new("open-timeout")
            .help("Seconds to wait for the host to acknowledge a stream")
            .long("open-timeout")
            .validator(validate_duration_secs)
            .default_value("15")
            .takes_value(true),
        ),
    )
    .subcommand(
      peer_args(Command::new("host"))
        .about("Dial destinations on behalf of a connected client")
        .arg(
          Arg::new("dial-timeout")
            .long("dial-timeout")
            .validator(validate_duration_secs)
            .default_value("15")
            .takes_value(true),
        )
        .arg(
          Arg::new("idle-timeout")
            .help("Seconds without traffic before a stream is reset")
            .long("idle-timeout")
            .validator(validate_duration_secs)
            .default_value("30")
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches
    .subcommand_name()
    .unwrap_or("<No subcommand?>")
    .to_string();
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(err) => {
      tracing::error!(err = ?err, "Tokio runtime setup failure");
      std::process::exit(1);
    }
  };
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = %mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .ok_or_else(|| anyhow::Error::msg(format!("Missing value for --{}", name)))
}

fn peer_arg_handling(args: &ArgMatches) -> Result<PeerArgs> {
  Ok(PeerArgs {
    room: required(args, "room")?.to_string(),
    signal_url: parse_signal_url(required(args, "signal")?)?,
    signal_token: parse_optional_secret(args.value_of("signal-token")),
    transport: TransportConfig {
      ice_servers: parse_ice_servers(required(args, "ice-servers")?)?,
      relay_only: parse_flag(required(args, "relay-only")?)?,
    },
  })
}

pub fn client_arg_handling(args: &ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    peer: peer_arg_handling(args)?,
    token: parse_optional_secret(args.value_of("token")),
    http_bind: parse_socketaddr(required(args, "http")?)?,
    socks_bind: parse_socketaddr(required(args, "socks")?)?,
    open_timeout: parse_duration_secs(required(args, "open-timeout")?)?,
  })
}

pub fn host_arg_handling(args: &ArgMatches) -> Result<host::HostArgs> {
  Ok(host::HostArgs {
    peer: peer_arg_handling(args)?,
    expected_token: parse_optional_secret(args.value_of("token")),
    dial_timeout: parse_duration_secs(required(args, "dial-timeout")?)?,
    idle_timeout: parse_duration_secs(required(args, "idle-timeout")?)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!(
        room = %config.peer.room,
        signal = %config.peer.signal_url,
        relay_only = config.peer.transport.relay_only,
        "Running as client"
      );
      client::client_main(config).await
    }
    Some(("host", opts)) => {
      let config = host_arg_handling(opts)?;
      tracing::info!(
        room = %config.peer.room,
        signal = %config.peer.signal_url,
        relay_only = config.peer.transport.relay_only,
        "Running as host"
      );
      host::host_main(config).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
