// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::Result;
use dctunnel::{
  common::{
    daemon::{ClientAgent, ClientAgentConfig},
    signaling::{websocket, PeerRole},
    transport::webrtc::WebRtcTransportFactory,
  },
  util::cancellation::cancel_on_ctrl_c,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::PeerArgs;

#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub peer: PeerArgs,
  pub token: Option<String>,
  pub http_bind: SocketAddr,
  pub socks_bind: SocketAddr,
  pub open_timeout: Duration,
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let shutdown = cancel_on_ctrl_c(CancellationToken::new());
  let mut agent_config = ClientAgentConfig::new(config.peer.room.clone()).with_token(config.token);
  agent_config.http_bind = config.http_bind;
  agent_config.socks_bind = config.socks_bind;
  agent_config.open_timeout = config.open_timeout;
  let agent = ClientAgent::bind(agent_config).await?;

  let signaling = websocket::connect(
    config.peer.signaling_config(PeerRole::Client),
    shutdown.child_token(),
  );
  let factory = Arc::new(WebRtcTransportFactory::new(config.peer.transport.clone()));
  agent.run(factory, signaling, shutdown).await
}
