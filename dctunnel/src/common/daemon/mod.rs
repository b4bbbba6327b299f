// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client and host agents assembled from a session, frontends, and a dispatcher
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
  net::TcpListener,
  sync::broadcast::{channel as event_channel, Sender as Broadcaster},
};
use tracing::Instrument;

use crate::{
  common::{
    authentication::authenticator_for,
    dispatcher::{Dialer, HostDispatcher, TokioDialer, DEFAULT_DIAL_TIMEOUT, DEFAULT_IDLE_TIMEOUT},
    frontend::{http_connect, socks5, ArcOpener, DEFAULT_OPEN_TIMEOUT},
    session::{Session, SessionConfig},
    signaling::{PeerRole, SignalingChannel},
    transport::PeerTransportFactory,
  },
  util::cancellation::CancellationListener,
};

pub const DEFAULT_ROOM: &str = "demo1";

#[derive(Debug, Clone)]
pub struct ClientAgentConfig {
  pub http_bind: SocketAddr,
  pub socks_bind: SocketAddr,
  pub open_timeout: Duration,
  pub session: SessionConfig,
}

impl ClientAgentConfig {
  pub fn new<R: Into<String>>(room: R) -> Self {
    Self {
      http_bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
      socks_bind: SocketAddr::from(([127, 0, 0, 1], 1080)),
      open_timeout: DEFAULT_OPEN_TIMEOUT,
      session: SessionConfig::new(room, PeerRole::Client),
    }
  }

  /// Attached to every OPEN this client sends
  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.session.token = token;
    self
  }
}

impl Default for ClientAgentConfig {
  fn default() -> Self {
    Self::new(DEFAULT_ROOM)
  }
}

#[derive(Debug, Clone)]
pub struct HostAgentConfig {
  /// Opens must carry exactly this token when set
  pub expected_token: Option<String>,
  pub dial_timeout: Duration,
  pub idle_timeout: Duration,
  pub session: SessionConfig,
}

impl HostAgentConfig {
  pub fn new<R: Into<String>>(room: R) -> Self {
    Self {
      expected_token: None,
      dial_timeout: DEFAULT_DIAL_TIMEOUT,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
      session: SessionConfig::new(room, PeerRole::Host),
    }
  }
}

impl Default for HostAgentConfig {
  fn default() -> Self {
    Self::new(DEFAULT_ROOM)
  }
}

/// Local proxy listeners feeding a client session
pub struct ClientAgent {
  config: ClientAgentConfig,
  http: TcpListener,
  socks: TcpListener,
}

impl ClientAgent {
  /// Binds both proxy listeners; nothing is served until [ClientAgent::run]
  pub async fn bind(config: ClientAgentConfig) -> Result<Self> {
    let http = TcpListener::bind(config.http_bind)
      .await
      .with_context(|| format!("Binding HTTP CONNECT listener on {}", config.http_bind))?;
    let socks = TcpListener::bind(config.socks_bind)
      .await
      .with_context(|| format!("Binding SOCKS5 listener on {}", config.socks_bind))?;
    Ok(Self {
      config,
      http,
      socks,
    })
  }

  pub fn http_addr(&self) -> Result<SocketAddr> {
    Ok(self.http.local_addr()?)
  }

  pub fn socks_addr(&self) -> Result<SocketAddr> {
    Ok(self.socks.local_addr()?)
  }

  /// Serves both frontends until `shutdown` fires
  pub async fn run(
    self,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: SignalingChannel,
    shutdown: CancellationListener,
  ) -> Result<()> {
    let ClientAgent {
      config,
      http,
      socks,
    } = self;
    let (session, _links) = Session::spawn(
      config.session.clone(),
      factory,
      signaling,
      shutdown.child_token(),
    );
    let opener: ArcOpener = Arc::new(session);
    let http = http_connect::serve(
      http,
      opener.clone(),
      config.open_timeout,
      shutdown.child_token(),
    )
    .instrument(tracing::info_span!("http_connect"));
    let socks = socks5::serve(socks, opener, config.open_timeout, shutdown.child_token())
      .instrument(tracing::info_span!("socks5"));
    tokio::join!(http, socks);
    tracing::info!("Client agent stopped");
    Ok(())
  }
}

/// Serves opens from the client over each link the host session negotiates
pub struct HostAgent {
  config: HostAgentConfig,
  dialer: Arc<dyn Dialer>,

  // event hooks
  /// Fires with a running count each time a link comes up
  pub link_established: Broadcaster<u64>,
}

impl HostAgent {
  pub fn new(config: HostAgentConfig) -> Self {
    let dialer = Arc::new(TokioDialer::new(config.dial_timeout));
    Self::with_dialer(config, dialer)
  }

  pub fn with_dialer(config: HostAgentConfig, dialer: Arc<dyn Dialer>) -> Self {
    let (link_established, _) = event_channel(16);
    Self {
      config,
      dialer,
      link_established,
    }
  }

  pub async fn run(
    self,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: SignalingChannel,
    shutdown: CancellationListener,
  ) -> Result<()> {
    let dispatcher = Arc::new(HostDispatcher::new(
      self.dialer.clone(),
      authenticator_for(self.config.expected_token.clone()),
      self.config.idle_timeout,
    ));
    let (_session, mut links) = Session::spawn(
      self.config.session.clone(),
      factory,
      signaling,
      shutdown.child_token(),
    );
    let mut established = 0u64;
    loop {
      let link = tokio::select! {
        _ = shutdown.cancelled() => break,
        link = links.recv() => match link {
          Some(link) => link,
          None => break,
        },
      };
      established += 1;
      tracing::info!(link = established, "Link established; dispatching opens");
      tokio::task::spawn(
        dispatcher
          .clone()
          .run(link.multiplexer, link.incoming, shutdown.child_token())
          .instrument(tracing::debug_span!("dispatcher", link = established)),
      );
      let _ = self.link_established.send(established);
    }
    tracing::info!("Host agent stopped");
    Ok(())
  }
}
