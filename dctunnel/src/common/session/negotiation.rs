// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Offer/answer negotiation for a single transport, including glare resolution
//!
//! Both peers may offer at once. The impolite peer keeps its own offer and
//! ignores the remote one; the polite peer rolls its offer back and answers.
use std::collections::VecDeque;

use crate::common::{
  signaling::{SignalMessage, SignalSender, SignalingError},
  transport::{ArcTransport, IceCandidate, SdpKind, SessionDescription, TransportError},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Politeness {
  /// Wins offer collisions
  Impolite,
  /// Yields on offer collisions
  Polite,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NegotiationState {
  Idle,
  OfferPending,
  Negotiated,
  Connected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NegotiationInput {
  EnsureOffer,
  RemoteOffer,
  RemoteAnswer,
  TransportConnected,
  TransportFailed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NegotiationAction {
  SendOffer,
  AcceptOffer,
  IgnoreOffer,
  RollbackAndAccept,
  ApplyAnswer,
  DropAnswer,
  MarkConnected,
  Reset,
  Noop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transition {
  pub from: NegotiationState,
  /// `None` applies to either role
  pub politeness: Option<Politeness>,
  pub input: NegotiationInput,
  pub action: NegotiationAction,
  pub to: NegotiationState,
}

const fn row(
  from: NegotiationState,
  politeness: Option<Politeness>,
  input: NegotiationInput,
  action: NegotiationAction,
  to: NegotiationState,
) -> Transition {
  Transition {
    from,
    politeness,
    input,
    action,
    to,
  }
}

use NegotiationAction as A;
use NegotiationInput as I;
use NegotiationState as S;

/// Every legal (state, role, input) combination; first match wins
pub static TRANSITION_TABLE: &[Transition] = &[
  row(S::Idle, None, I::EnsureOffer, A::SendOffer, S::OfferPending),
  row(S::Idle, None, I::RemoteOffer, A::AcceptOffer, S::Negotiated),
  row(S::Idle, None, I::RemoteAnswer, A::DropAnswer, S::Idle),
  row(S::Idle, None, I::TransportConnected, A::Noop, S::Idle),
  row(S::Idle, None, I::TransportFailed, A::Reset, S::Idle),
  row(S::OfferPending, None, I::EnsureOffer, A::Noop, S::OfferPending),
  row(
    S::OfferPending,
    Some(Politeness::Impolite),
    I::RemoteOffer,
    A::IgnoreOffer,
    S::OfferPending,
  ),
  row(
    S::OfferPending,
    Some(Politeness::Polite),
    I::RemoteOffer,
    A::RollbackAndAccept,
    S::Negotiated,
  ),
  row(S::OfferPending, None, I::RemoteAnswer, A::ApplyAnswer, S::Negotiated),
  row(S::OfferPending, None, I::TransportConnected, A::MarkConnected, S::Connected),
  row(S::OfferPending, None, I::TransportFailed, A::Reset, S::Idle),
  row(S::Negotiated, None, I::EnsureOffer, A::Noop, S::Negotiated),
  row(S::Negotiated, None, I::RemoteOffer, A::AcceptOffer, S::Negotiated),
  row(S::Negotiated, None, I::RemoteAnswer, A::DropAnswer, S::Negotiated),
  row(S::Negotiated, None, I::TransportConnected, A::MarkConnected, S::Connected),
  row(S::Negotiated, None, I::TransportFailed, A::Reset, S::Idle),
  row(S::Connected, None, I::EnsureOffer, A::Noop, S::Connected),
  row(S::Connected, None, I::RemoteOffer, A::AcceptOffer, S::Negotiated),
  row(S::Connected, None, I::RemoteAnswer, A::DropAnswer, S::Connected),
  row(S::Connected, None, I::TransportConnected, A::Noop, S::Connected),
  row(S::Connected, None, I::TransportFailed, A::Reset, S::Idle),
];

/// Looks up the action and next state for `input`; unknown combinations are a no-op
pub fn transition(
  state: NegotiationState,
  politeness: Politeness,
  input: NegotiationInput,
) -> (NegotiationAction, NegotiationState) {
  TRANSITION_TABLE
    .iter()
    .find(|t| {
      t.from == state && t.input == input && t.politeness.map_or(true, |p| p == politeness)
    })
    .map(|t| (t.action, t.to))
    .unwrap_or((NegotiationAction::Noop, state))
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum NegotiationError {
  #[error("Transport rejected negotiation step: {0}")]
  Transport(#[from] TransportError),
  #[error("Failed to send signal: {0}")]
  Signaling(#[from] SignalingError),
}

/// Drives one transport through offer/answer and candidate exchange
pub struct NegotiationManager {
  transport: ArcTransport,
  politeness: Politeness,
  signals: SignalSender,
  state: NegotiationState,
  remote_description_set: bool,
  pending_candidates: VecDeque<IceCandidate>,
  /// Our outstanding offer, repeated if the peer may have missed it
  local_offer: Option<SessionDescription>,
  /// The last remote offer accepted, so repeats of it are ignored
  accepted_offer: Option<SessionDescription>,
}

impl NegotiationManager {
  pub fn new(transport: ArcTransport, politeness: Politeness, signals: SignalSender) -> Self {
    Self {
      transport,
      politeness,
      signals,
      state: NegotiationState::Idle,
      remote_description_set: false,
      pending_candidates: VecDeque::new(),
      local_offer: None,
      accepted_offer: None,
    }
  }

  pub fn state(&self) -> NegotiationState {
    self.state
  }

  pub fn politeness(&self) -> Politeness {
    self.politeness
  }

  pub fn pending_candidates(&self) -> usize {
    self.pending_candidates.len()
  }

  /// Sends an offer unless one is outstanding or a session is already negotiated
  pub async fn ensure_offer(&mut self) -> Result<(), NegotiationError> {
    let (action, next) = transition(self.state, self.politeness, NegotiationInput::EnsureOffer);
    if action != NegotiationAction::SendOffer {
      tracing::trace!(state = ?self.state, "Offer not needed");
      return Ok(());
    }
    let offer = self.transport.create_offer().await?;
    self.transport.set_local_description(offer.clone()).await?;
    self.state = next;
    self.local_offer = Some(offer.clone());
    tracing::debug!("Sending offer");
    self.signals.send(SignalMessage::description(offer))?;
    Ok(())
  }

  /// Makes sure a newly (re)joined peer has our offer
  ///
  /// Sends a first offer when idle, or repeats the outstanding one.
  pub async fn announce(&mut self) -> Result<(), NegotiationError> {
    if self.state == NegotiationState::OfferPending {
      if let Some(offer) = self.local_offer.clone() {
        tracing::debug!("Repeating outstanding offer");
        self.signals.send(SignalMessage::description(offer))?;
        return Ok(());
      }
    }
    self.ensure_offer().await
  }

  pub async fn on_remote_description(
    &mut self,
    description: SessionDescription,
  ) -> Result<(), NegotiationError> {
    let input = match description.kind {
      SdpKind::Offer => NegotiationInput::RemoteOffer,
      SdpKind::Answer => NegotiationInput::RemoteAnswer,
    };
    if input == NegotiationInput::RemoteOffer && self.accepted_offer.as_ref() == Some(&description)
    {
      tracing::debug!("Ignoring repeated offer");
      return Ok(());
    }
    let (action, next) = transition(self.state, self.politeness, input);
    tracing::debug!(state = ?self.state, ?input, ?action, "Remote description received");
    match action {
      NegotiationAction::AcceptOffer => self.accept_offer(description).await?,
      NegotiationAction::RollbackAndAccept => {
        self.transport.rollback().await?;
        self.local_offer = None;
        self.accept_offer(description).await?;
      }
      NegotiationAction::ApplyAnswer => {
        self.transport.set_remote_description(description).await?;
        self.local_offer = None;
        self.remote_description_set = true;
        self.drain_candidates().await;
      }
      NegotiationAction::IgnoreOffer => {
        tracing::debug!("Ignoring colliding offer; keeping our own");
      }
      NegotiationAction::DropAnswer => {
        tracing::debug!("Dropping answer with no outstanding offer");
      }
      _ => {}
    }
    self.state = next;
    Ok(())
  }

  async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
    self.transport.set_remote_description(offer.clone()).await?;
    self.accepted_offer = Some(offer);
    self.remote_description_set = true;
    self.drain_candidates().await;
    let answer = self.transport.create_answer().await?;
    self.transport.set_local_description(answer.clone()).await?;
    tracing::debug!("Sending answer");
    self.signals.send(SignalMessage::description(answer))?;
    Ok(())
  }

  async fn drain_candidates(&mut self) {
    while let Some(candidate) = self.pending_candidates.pop_front() {
      if let Err(error) = self.transport.add_candidate(candidate).await {
        tracing::warn!(%error, "Failed to apply buffered candidate");
      }
    }
  }

  /// Applies a candidate, or holds it until a remote description is accepted
  pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
    if !self.remote_description_set {
      tracing::trace!("Buffering early candidate");
      self.pending_candidates.push_back(candidate);
      return;
    }
    if let Err(error) = self.transport.add_candidate(candidate).await {
      tracing::warn!(%error, "Failed to apply candidate");
    }
  }

  /// Returns true if this completed the session
  pub fn on_transport_connected(&mut self) -> bool {
    let (action, next) = transition(
      self.state,
      self.politeness,
      NegotiationInput::TransportConnected,
    );
    self.state = next;
    action == NegotiationAction::MarkConnected
  }

  /// Forgets all negotiation progress; a fresh [NegotiationManager::ensure_offer] is then permitted
  ///
  /// Returns true when the transport should be replaced, which is always.
  pub fn on_transport_failure(&mut self) -> bool {
    let (action, next) = transition(
      self.state,
      self.politeness,
      NegotiationInput::TransportFailed,
    );
    debug_assert_eq!(action, NegotiationAction::Reset);
    self.state = next;
    self.remote_description_set = false;
    self.pending_candidates.clear();
    self.local_offer = None;
    self.accepted_offer = None;
    true
  }

  /// Swaps in a fresh transport after a failure
  pub fn replace_transport(&mut self, transport: ArcTransport) {
    self.on_transport_failure();
    self.transport = transport;
  }
}
