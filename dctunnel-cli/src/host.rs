// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::Result;
use dctunnel::{
  common::{
    daemon::{HostAgent, HostAgentConfig},
    signaling::{websocket, PeerRole},
    transport::webrtc::WebRtcTransportFactory,
  },
  util::cancellation::cancel_on_ctrl_c,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::PeerArgs;

#[derive(Clone, Debug)]
pub struct HostArgs {
  pub peer: PeerArgs,
  pub expected_token: Option<String>,
  pub dial_timeout: Duration,
  pub idle_timeout: Duration,
}

pub async fn host_main(config: HostArgs) -> Result<()> {
  let shutdown = cancel_on_ctrl_c(CancellationToken::new());
  let mut agent_config = HostAgentConfig::new(config.peer.room.clone());
  agent_config.expected_token = config.expected_token;
  agent_config.dial_timeout = config.dial_timeout;
  agent_config.idle_timeout = config.idle_timeout;
  if agent_config.expected_token.is_none() {
    tracing::warn!("No token configured; every open request will be accepted");
  }
  let agent = HostAgent::new(agent_config);

  let signaling = websocket::connect(
    config.peer.signaling_config(PeerRole::Host),
    shutdown.child_token(),
  );
  let factory = Arc::new(WebRtcTransportFactory::new(config.peer.transport.clone()));
  agent.run(factory, signaling, shutdown).await
}
