// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! [PeerTransport] backed by a WebRTC peer connection and its SCTP data channels
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use webrtc::{
  api::APIBuilder,
  data_channel::{
    data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
    RTCDataChannel,
  },
  ice_transport::{
    ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    ice_server::RTCIceServer,
  },
  peer_connection::{
    configuration::RTCConfiguration,
    peer_connection_state::RTCPeerConnectionState,
    policy::ice_transport_policy::RTCIceTransportPolicy,
    sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
    RTCPeerConnection,
  },
};

use super::{
  ArcTransport, ConnectionState, DataChannel, IceCandidate, PeerTransport, PeerTransportFactory,
  SdpKind, SessionDescription, TransportConfig, TransportError, TransportEvent, TransportEvents,
};

pub struct WebRtcTransportFactory {
  config: TransportConfig,
}

impl WebRtcTransportFactory {
  pub fn new(config: TransportConfig) -> Self {
    Self { config }
  }

  fn rtc_configuration(&self) -> RTCConfiguration {
    RTCConfiguration {
      ice_servers: self
        .config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
          urls: server.urls.clone(),
          username: server.username.clone().unwrap_or_default(),
          credential: server.credential.clone().unwrap_or_default(),
          ..Default::default()
        })
        .collect(),
      ice_transport_policy: if self.config.relay_only {
        RTCIceTransportPolicy::Relay
      } else {
        RTCIceTransportPolicy::All
      },
      ..Default::default()
    }
  }
}

impl PeerTransportFactory for WebRtcTransportFactory {
  fn create(&self) -> BoxFuture<'_, Result<(ArcTransport, TransportEvents), TransportError>> {
    async move {
      let api = APIBuilder::new().build();
      let peer = api
        .new_peer_connection(self.rtc_configuration())
        .await
        .map_err(TransportError::backend)?;
      let peer = Arc::new(peer);
      let (events_tx, events_rx) = mpsc::unbounded_channel();

      let candidate_events = events_tx.clone();
      peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
          // `None` marks the end of gathering, which the remote side need not hear about
          let candidate = match candidate.map(|c| c.to_json()) {
            Some(Ok(init)) => init,
            Some(Err(error)) => {
              tracing::warn!(%error, "Failed to serialize local candidate");
              return;
            }
            None => return,
          };
          let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
          }));
        })
      }));

      let state_events = events_tx.clone();
      peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
          tracing::debug!(?state, "Peer connection state changed");
          let mapped = match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
              ConnectionState::Connecting
            }
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => return,
          };
          let _ = events.send(TransportEvent::ConnectionState(mapped));
        })
      }));

      let channel_events = events_tx;
      peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let events = channel_events.clone();
        Box::pin(async move {
          tracing::debug!(label = channel.label(), "Remote data channel announced");
          let _ = events.send(TransportEvent::Channel(bridge_channel(channel)));
        })
      }));

      let transport: ArcTransport = Arc::new(WebRtcTransport { peer });
      Ok((transport, events_rx))
    }
    .boxed()
  }
}

pub struct WebRtcTransport {
  peer: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
  let converted = match description.kind {
    SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
    SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
  };
  converted.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
  let kind = match description.sdp_type {
    RTCSdpType::Offer => SdpKind::Offer,
    RTCSdpType::Answer => SdpKind::Answer,
    other => {
      return Err(TransportError::InvalidDescription(format!(
        "Unexpected local description type {}",
        other
      )))
    }
  };
  Ok(SessionDescription {
    kind,
    sdp: description.sdp,
  })
}

/// Adapts an SCTP data channel to the queue-based [DataChannel]
///
/// Outbound messages are held until the channel opens; the inbound queue
/// ends when the channel closes.
fn bridge_channel(channel: Arc<RTCDataChannel>) -> DataChannel {
  let label = channel.label().to_string();
  let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
  let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
  let inbound_tx = Arc::new(Mutex::new(Some(inbound_tx)));
  let pending_outbound = Arc::new(Mutex::new(Some(outbound_rx)));

  let on_message_tx = Arc::clone(&inbound_tx);
  channel.on_message(Box::new(move |message: DataChannelMessage| {
    if let Ok(guard) = on_message_tx.lock() {
      if let Some(sender) = guard.as_ref() {
        let _ = sender.send(message.data);
      }
    }
    Box::pin(async {})
  }));

  let on_close_tx = Arc::clone(&inbound_tx);
  let close_label = label.clone();
  channel.on_close(Box::new(move || {
    tracing::debug!(label = %close_label, "Data channel closed");
    if let Ok(mut guard) = on_close_tx.lock() {
      guard.take();
    }
    Box::pin(async {})
  }));

  let pump_channel = Arc::clone(&channel);
  channel.on_open(Box::new(move || {
    let outbound = pending_outbound.lock().ok().and_then(|mut g| g.take());
    let channel = Arc::clone(&pump_channel);
    Box::pin(async move {
      if let Some(outbound) = outbound {
        tokio::task::spawn(pump_outbound(channel, outbound));
      }
    })
  }));

  DataChannel::new(label, outbound_tx, inbound_rx)
}

async fn pump_outbound(channel: Arc<RTCDataChannel>, mut outbound: UnboundedReceiver<Bytes>) {
  tracing::debug!(label = channel.label(), "Data channel open");
  while let Some(message) = outbound.recv().await {
    if let Err(error) = channel.send(&message).await {
      tracing::debug!(label = channel.label(), %error, "Data channel send failed");
      break;
    }
  }
  let _ = channel.close().await;
}

impl PeerTransport for WebRtcTransport {
  fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
    async move {
      let offer = self
        .peer
        .create_offer(None)
        .await
        .map_err(TransportError::backend)?;
      from_rtc(offer)
    }
    .boxed()
  }

  fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
    async move {
      let answer = self
        .peer
        .create_answer(None)
        .await
        .map_err(TransportError::backend)?;
      from_rtc(answer)
    }
    .boxed()
  }

  fn set_local_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let description = to_rtc(description)?;
      self
        .peer
        .set_local_description(description)
        .await
        .map_err(TransportError::backend)
    }
    .boxed()
  }

  fn set_remote_description(
    &self,
    description: SessionDescription,
  ) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let description = to_rtc(description)?;
      self
        .peer
        .set_remote_description(description)
        .await
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }
    .boxed()
  }

  fn rollback(&self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let mut rollback = RTCSessionDescription::default();
      rollback.sdp_type = RTCSdpType::Rollback;
      self
        .peer
        .set_local_description(rollback)
        .await
        .map_err(TransportError::backend)
    }
    .boxed()
  }

  fn add_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      self
        .peer
        .add_ice_candidate(RTCIceCandidateInit {
          candidate: candidate.candidate,
          sdp_mid: candidate.sdp_mid,
          sdp_mline_index: candidate.sdp_mline_index,
          username_fragment: candidate.username_fragment,
        })
        .await
        .map_err(TransportError::backend)
    }
    .boxed()
  }

  fn open_channel<'a>(
    &'a self,
    label: &'a str,
  ) -> BoxFuture<'a, Result<DataChannel, TransportError>> {
    async move {
      let channel = self
        .peer
        .create_data_channel(
          label,
          Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
          }),
        )
        .await
        .map_err(TransportError::backend)?;
      Ok(bridge_channel(channel))
    }
    .boxed()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    async move {
      if let Err(error) = self.peer.close().await {
        tracing::debug!(%error, "Error closing peer connection");
      }
    }
    .boxed()
  }
}
