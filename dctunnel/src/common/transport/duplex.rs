// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! An in-process [PeerTransport] for tests and single-process embedding
//!
//! Endpoints created from one [DuplexNetwork] find each other through the
//! identifiers embedded in their session descriptions. Once both sides hold
//! a local and a remote description in the stable state, they link, deliver
//! any channels opened so far, and report [ConnectionState::Connected].
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
  ArcTransport, ConnectionState, DataChannel, IceCandidate, PeerTransport, PeerTransportFactory,
  SdpKind, SessionDescription, TransportError, TransportEvent, TransportEvents,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalingState {
  Stable,
  HaveLocalOffer,
  HaveRemoteOffer,
  Closed,
}

impl SignalingState {
  fn name(&self) -> &'static str {
    match self {
      Self::Stable => "stable",
      Self::HaveLocalOffer => "have-local-offer",
      Self::HaveRemoteOffer => "have-remote-offer",
      Self::Closed => "closed",
    }
  }
}

#[derive(Default)]
pub struct DuplexNetwork {
  endpoints: DashMap<Uuid, Weak<Endpoint>>,
  link_lock: Mutex<()>,
}

impl DuplexNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn factory(self: &Arc<Self>) -> DuplexTransportFactory {
    DuplexTransportFactory {
      network: Arc::clone(self),
    }
  }

  pub fn create_transport(self: &Arc<Self>) -> (DuplexTransport, TransportEvents) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let endpoint = Arc::new(Endpoint {
      id: Uuid::new_v4(),
      network: Arc::downgrade(self),
      events,
      shutdown: CancellationToken::new(),
      state: Mutex::new(EndpointState::default()),
    });
    self
      .endpoints
      .insert(endpoint.id, Arc::downgrade(&endpoint));
    (DuplexTransport { endpoint }, events_rx)
  }

  /// Number of endpoints that have not been closed
  pub fn live_endpoints(&self) -> usize {
    self
      .endpoints
      .iter()
      .filter(|entry| entry.value().strong_count() > 0)
      .count()
  }

  /// Breaks every link, as if the network path between all peers vanished
  pub fn fail_all(&self) {
    let endpoints: Vec<Arc<Endpoint>> = self
      .endpoints
      .iter()
      .filter_map(|entry| entry.value().upgrade())
      .collect();
    for endpoint in endpoints {
      endpoint.terminate(ConnectionState::Failed);
    }
  }

  fn lookup(&self, id: &Uuid) -> Option<Arc<Endpoint>> {
    self.endpoints.get(id).and_then(|entry| entry.value().upgrade())
  }
}

pub struct DuplexTransportFactory {
  network: Arc<DuplexNetwork>,
}

impl PeerTransportFactory for DuplexTransportFactory {
  fn create(&self) -> BoxFuture<'_, Result<(ArcTransport, TransportEvents), TransportError>> {
    let (transport, events) = self.network.create_transport();
    futures::future::ready(Ok((Arc::new(transport) as ArcTransport, events))).boxed()
  }
}

#[derive(Default)]
struct EndpointState {
  signaling: Option<SignalingState>,
  local: Option<SessionDescription>,
  remote_peer: Option<Uuid>,
  applied_candidates: Vec<IceCandidate>,
  peer: Option<Weak<Endpoint>>,
  /// Remote halves of channels opened before the link came up
  pending_channels: Vec<DataChannel>,
  connected: bool,
}

impl EndpointState {
  fn signaling(&self) -> SignalingState {
    self.signaling.unwrap_or(SignalingState::Stable)
  }

  fn ready_for(&self, peer: Option<Uuid>) -> bool {
    self.signaling() == SignalingState::Stable
      && self.local.is_some()
      && self.remote_peer.is_some()
      && (peer.is_none() || self.remote_peer == peer)
      && !self.connected
  }
}

struct Endpoint {
  id: Uuid,
  network: Weak<DuplexNetwork>,
  events: UnboundedSender<TransportEvent>,
  shutdown: CancellationToken,
  state: Mutex<EndpointState>,
}

impl Endpoint {
  fn state(&self) -> MutexGuard<'_, EndpointState> {
    // A poisoned lock means a test already panicked; keep the inner state usable
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn description(&self, kind: SdpKind) -> SessionDescription {
    let sdp = format!("duplex {} {}", self.id, Uuid::new_v4());
    SessionDescription { kind, sdp }
  }

  fn emit(&self, event: TransportEvent) {
    if self.events.send(event).is_err() {
      tracing::trace!(endpoint = %self.id, "transport event dropped; no listener");
    }
  }

  fn local_candidate(&self) {
    self.emit(TransportEvent::LocalCandidate(IceCandidate {
      candidate: format!("candidate:duplex {}", self.id),
      sdp_mid: Some(String::from("0")),
      sdp_mline_index: Some(0),
      username_fragment: None,
    }));
  }

  fn try_link(self: &Arc<Self>) {
    let network = match self.network.upgrade() {
      Some(network) => network,
      None => return,
    };
    let _link_guard = network
      .link_lock
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let peer_id = {
      let state = self.state();
      if !state.ready_for(None) {
        return;
      }
      state.remote_peer
    };
    let peer = match peer_id.and_then(|id| network.lookup(&id)) {
      Some(peer) => peer,
      None => return,
    };
    if !peer.state().ready_for(Some(self.id)) {
      return;
    }
    let ours = {
      let mut state = self.state();
      state.connected = true;
      state.peer = Some(Arc::downgrade(&peer));
      std::mem::take(&mut state.pending_channels)
    };
    let theirs = {
      let mut state = peer.state();
      state.connected = true;
      state.peer = Some(Arc::downgrade(self));
      std::mem::take(&mut state.pending_channels)
    };
    tracing::debug!(local = %self.id, remote = %peer.id, "duplex endpoints linked");
    for channel in ours {
      peer.emit(TransportEvent::Channel(channel));
    }
    for channel in theirs {
      self.emit(TransportEvent::Channel(channel));
    }
    self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
    peer.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
  }

  /// Tears down this endpoint and its linked peer, closing every channel
  fn terminate(&self, local_state: ConnectionState) {
    let peer = {
      let mut state = self.state();
      if state.signaling() == SignalingState::Closed && local_state == ConnectionState::Closed {
        return;
      }
      if local_state == ConnectionState::Closed {
        state.signaling = Some(SignalingState::Closed);
      }
      state.connected = false;
      state.pending_channels.clear();
      state.peer.take().and_then(|peer| peer.upgrade())
    };
    self.shutdown.cancel();
    self.emit(TransportEvent::ConnectionState(local_state));
    if let Some(peer) = peer {
      {
        let mut state = peer.state();
        state.connected = false;
        state.peer = None;
      }
      peer.shutdown.cancel();
      peer.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
    }
  }
}

fn spawn_pump(
  mut from: UnboundedReceiver<Bytes>,
  to: UnboundedSender<Bytes>,
  shutdown: CancellationToken,
) {
  tokio::task::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        message = from.recv() => match message {
          Some(message) => {
            if to.send(message).is_err() {
              break;
            }
          }
          None => break,
        },
      }
    }
  });
}

fn parse_peer(description: &SessionDescription) -> Result<Uuid, TransportError> {
  let mut parts = description.sdp.split_whitespace();
  match (parts.next(), parts.next()) {
    (Some("duplex"), Some(id)) => Uuid::parse_str(id)
      .map_err(|_| TransportError::InvalidDescription(description.sdp.clone())),
    _ => Err(TransportError::InvalidDescription(description.sdp.clone())),
  }
}

pub struct DuplexTransport {
  endpoint: Arc<Endpoint>,
}

impl DuplexTransport {
  pub fn id(&self) -> Uuid {
    self.endpoint.id
  }

  pub fn signaling_state(&self) -> SignalingState {
    self.endpoint.state().signaling()
  }

  pub fn is_connected(&self) -> bool {
    self.endpoint.state().connected
  }

  /// Candidates applied so far, in application order
  pub fn applied_candidates(&self) -> Vec<IceCandidate> {
    self.endpoint.state().applied_candidates.clone()
  }

  /// Simulates loss of the network path to the peer
  pub fn fail(&self) {
    self.endpoint.terminate(ConnectionState::Failed);
  }

  fn transition(
    &self,
    operation: &'static str,
    from: SignalingState,
    to: SignalingState,
  ) -> Result<MutexGuard<'_, EndpointState>, TransportError> {
    let mut state = self.endpoint.state();
    let current = state.signaling();
    if current != from {
      return Err(TransportError::InvalidState {
        state: current.name(),
        operation,
      });
    }
    state.signaling = Some(to);
    Ok(state)
  }
}

impl PeerTransport for DuplexTransport {
  fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
    let result = match self.endpoint.state().signaling() {
      SignalingState::Stable | SignalingState::HaveLocalOffer => {
        Ok(self.endpoint.description(SdpKind::Offer))
      }
      other => Err(TransportError::InvalidState {
        state: other.name(),
        operation: "create_offer",
      }),
    };
    futures::future::ready(result).boxed()
  }

  fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
    let result = match self.endpoint.state().signaling() {
      SignalingState::HaveRemoteOffer => Ok(self.endpoint.description(SdpKind::Answer)),
      other => Err(TransportError::InvalidState {
        state: other.name(),
        operation: "create_answer",
      }),
    };
    futures::future::ready(result).boxed()
  }

  fn set_local_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>> {
    let result: Result<_, TransportError> = (|| {
      let (from, to) = match description.kind {
        SdpKind::Offer => (SignalingState::Stable, SignalingState::HaveLocalOffer),
        SdpKind::Answer => (SignalingState::HaveRemoteOffer, SignalingState::Stable),
      };
      let mut state = self.transition("set_local_description", from, to)?;
      state.local = Some(description);
      Ok(())
    })();
    if result.is_ok() {
      self.endpoint.local_candidate();
      self.endpoint.try_link();
    }
    futures::future::ready(result).boxed()
  }

  fn set_remote_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>> {
    let result: Result<_, TransportError> = (|| {
      let peer = parse_peer(&description)?;
      let (from, to) = match description.kind {
        SdpKind::Offer => (SignalingState::Stable, SignalingState::HaveRemoteOffer),
        SdpKind::Answer => (SignalingState::HaveLocalOffer, SignalingState::Stable),
      };
      let mut state = self.transition("set_remote_description", from, to)?;
      state.remote_peer = Some(peer);
      Ok(())
    })();
    if result.is_ok() {
      self.endpoint.try_link();
    }
    futures::future::ready(result).boxed()
  }

  fn rollback(&self) -> BoxFuture<'_, Result<(), TransportError>> {
    let result = self
      .transition(
        "rollback",
        SignalingState::HaveLocalOffer,
        SignalingState::Stable,
      )
      .map(|mut state| {
        state.local = None;
      });
    futures::future::ready(result).boxed()
  }

  fn add_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>> {
    let result = {
      let mut state = self.endpoint.state();
      if state.remote_peer.is_none() {
        Err(TransportError::NoRemoteDescription)
      } else {
        state.applied_candidates.push(candidate);
        Ok(())
      }
    };
    futures::future::ready(result).boxed()
  }

  fn open_channel<'a>(
    &'a self,
    label: &'a str,
  ) -> BoxFuture<'a, Result<DataChannel, TransportError>> {
    let result: Result<_, TransportError> = (|| {
      let (local_out, local_out_rx) = mpsc::unbounded_channel();
      let (remote_out, remote_out_rx) = mpsc::unbounded_channel();
      let (local_in_tx, local_in) = mpsc::unbounded_channel();
      let (remote_in_tx, remote_in) = mpsc::unbounded_channel();
      let local = DataChannel::new(label, local_out, local_in);
      let remote = DataChannel::new(label, remote_out, remote_in);
      let deliver_to = {
        let mut state = self.endpoint.state();
        if state.signaling() == SignalingState::Closed {
          return Err(TransportError::Closed);
        }
        let linked = if state.connected {
          state.peer.as_ref().and_then(Weak::upgrade)
        } else {
          None
        };
        match linked {
          Some(peer) => Some((peer, remote)),
          None => {
            state.pending_channels.push(remote);
            None
          }
        }
      };
      spawn_pump(local_out_rx, remote_in_tx, self.endpoint.shutdown.clone());
      spawn_pump(remote_out_rx, local_in_tx, self.endpoint.shutdown.clone());
      if let Some((peer, remote)) = deliver_to {
        peer.emit(TransportEvent::Channel(remote));
      }
      Ok(local)
    })();
    futures::future::ready(result).boxed()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    self.endpoint.terminate(ConnectionState::Closed);
    if let Some(network) = self.endpoint.network.upgrade() {
      network.endpoints.remove(&self.endpoint.id);
    }
    futures::future::ready(()).boxed()
  }
}

impl Drop for DuplexTransport {
  fn drop(&mut self) {
    if let Some(network) = self.endpoint.network.upgrade() {
      network.endpoints.remove(&self.endpoint.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use bytes::Bytes;
  use tokio::time::timeout;

  use super::{DuplexNetwork, SignalingState};
  use crate::common::transport::{
    ConnectionState, IceCandidate, PeerTransport, TransportError, TransportEvent,
    TransportEvents,
  };

  async fn next_channel(events: &mut TransportEvents) -> crate::common::transport::DataChannel {
    loop {
      match events.recv().await.expect("event stream must stay open") {
        TransportEvent::Channel(channel) => return channel,
        _ => continue,
      }
    }
  }

  async fn next_state(events: &mut TransportEvents) -> ConnectionState {
    loop {
      match events.recv().await.expect("event stream must stay open") {
        TransportEvent::ConnectionState(state) => return state,
        _ => continue,
      }
    }
  }

  #[tokio::test]
  async fn offer_answer_links_and_delivers_early_channels() {
    let fut = async {
      let network = DuplexNetwork::new();
      let (offerer, mut offerer_events) = network.create_transport();
      let (answerer, mut answerer_events) = network.create_transport();

      let mut early = offerer.open_channel("mux").await.unwrap();
      early.send(Bytes::from_static(b"queued")).unwrap();

      let offer = offerer.create_offer().await.unwrap();
      offerer.set_local_description(offer.clone()).await.unwrap();
      answerer.set_remote_description(offer).await.unwrap();
      let answer = answerer.create_answer().await.unwrap();
      answerer.set_local_description(answer.clone()).await.unwrap();
      assert!(!answerer.is_connected());
      offerer.set_remote_description(answer).await.unwrap();

      assert_eq!(next_state(&mut offerer_events).await, ConnectionState::Connected);
      let mut remote = next_channel(&mut answerer_events).await;
      assert_eq!(remote.label(), "mux");
      assert_eq!(remote.recv().await.unwrap().as_ref(), b"queued");
      remote.send(Bytes::from_static(b"reply")).unwrap();
      assert_eq!(early.recv().await.unwrap().as_ref(), b"reply");
      assert_eq!(offerer.signaling_state(), SignalingState::Stable);
    };
    timeout(Duration::from_secs(5), fut)
      .await
      .expect("Duplex negotiation must not deadlock");
  }

  #[tokio::test]
  async fn remote_offer_during_local_offer_requires_rollback() {
    let network = DuplexNetwork::new();
    let (a, _a_events) = network.create_transport();
    let (b, _b_events) = network.create_transport();
    let offer_a = a.create_offer().await.unwrap();
    a.set_local_description(offer_a).await.unwrap();
    let offer_b = b.create_offer().await.unwrap();
    assert!(matches!(
      a.set_remote_description(offer_b.clone()).await,
      Err(TransportError::InvalidState { .. })
    ));
    a.rollback().await.unwrap();
    a.set_remote_description(offer_b).await.unwrap();
    assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
  }

  #[tokio::test]
  async fn candidates_require_remote_description() {
    let network = DuplexNetwork::new();
    let (a, _events) = network.create_transport();
    let (b, _b_events) = network.create_transport();
    assert!(matches!(
      a.add_candidate(IceCandidate::new("c1")).await,
      Err(TransportError::NoRemoteDescription)
    ));
    a.set_remote_description(b.create_offer().await.unwrap())
      .await
      .unwrap();
    a.add_candidate(IceCandidate::new("c1")).await.unwrap();
    assert_eq!(a.applied_candidates(), vec![IceCandidate::new("c1")]);
  }

  #[tokio::test]
  async fn failure_closes_channels_on_both_sides() {
    let fut = async {
      let network = DuplexNetwork::new();
      let (a, mut a_events) = network.create_transport();
      let (b, mut b_events) = network.create_transport();
      let mut channel = a.open_channel("mux").await.unwrap();
      let offer = a.create_offer().await.unwrap();
      a.set_local_description(offer.clone()).await.unwrap();
      b.set_remote_description(offer).await.unwrap();
      let answer = b.create_answer().await.unwrap();
      b.set_local_description(answer.clone()).await.unwrap();
      a.set_remote_description(answer).await.unwrap();
      let mut remote = next_channel(&mut b_events).await;
      assert_eq!(next_state(&mut a_events).await, ConnectionState::Connected);

      network.fail_all();
      assert!(channel.recv().await.is_none());
      assert!(remote.recv().await.is_none());
      assert_eq!(next_state(&mut a_events).await, ConnectionState::Failed);
    };
    timeout(Duration::from_secs(5), fut)
      .await
      .expect("Failure propagation must not deadlock");
  }
}
