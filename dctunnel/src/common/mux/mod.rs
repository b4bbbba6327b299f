// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Many logical byte streams and UDP associations over one ordered channel
//!
//! A single task owns the registry of live streams; handles talk to it over
//! a command queue, and it alone reads and writes the underlying channel.
use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use tokio::sync::{
  mpsc::{self, UnboundedReceiver, UnboundedSender},
  oneshot,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Instrument;

use crate::common::{
  protocol::{
    Destination, Frame, OpenRequest, ProtocolError, StreamId, TunnelError, UdpRelayMessage,
  },
  transport::DataChannel,
};

pub mod id;
pub mod slot;
pub mod stream;

pub use id::StreamIdAllocator;
pub use slot::SinkSlot;
pub use stream::{MuxStream, StreamFault, UdpAssociation};

/// Which end of the channel this multiplexer serves
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MultiplexerSide {
  /// Opens streams; incoming OPEN frames are ignored
  Initiator,
  /// Accepts streams opened by the remote side
  Responder,
}

/// An event delivered to the owner of a logical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
  Data(Bytes),
  /// The remote side will send no more data
  Closed,
  Reset(String),
  Datagram(UdpRelayMessage),
  Failed(TunnelError),
}

/// An OPEN received from the remote side, awaiting [MultiplexerHandle::accept] or [MultiplexerHandle::reject]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOpen {
  pub id: StreamId,
  pub request: OpenRequest,
}

pub type IncomingOpens = UnboundedReceiver<IncomingOpen>;

type AckSender = oneshot::Sender<Result<(), TunnelError>>;
type Installed = (UnboundedReceiver<Inbound>, StreamFault);
type InstallReply = oneshot::Sender<Option<Installed>>;

enum Command {
  Open {
    request: OpenRequest,
    registered: oneshot::Sender<Result<StreamId, TunnelError>>,
    ack: AckSender,
  },
  Abandon {
    id: StreamId,
  },
  Install {
    id: StreamId,
    reply: InstallReply,
  },
  Accept {
    id: StreamId,
    reply: InstallReply,
  },
  Reject {
    id: StreamId,
  },
  Send {
    id: StreamId,
    payload: Bytes,
  },
  SendDatagram {
    id: StreamId,
    message: UdpRelayMessage,
  },
  Close {
    id: StreamId,
  },
  Reset {
    id: StreamId,
    reason: String,
  },
  /// The owner's handle was dropped
  Release {
    id: StreamId,
  },
  ActiveStreams {
    reply: oneshot::Sender<usize>,
  },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum StreamState {
  Opening,
  Open,
}

struct Entry {
  state: StreamState,
  /// Whether this side sent the OPEN
  local_origin: bool,
  slot: SinkSlot<Inbound>,
  fault: StreamFault,
  ack: Option<AckSender>,
  local_closed: bool,
  remote_closed: bool,
}

impl Entry {
  fn new(local_origin: bool, ack: Option<AckSender>) -> Self {
    Self {
      state: StreamState::Opening,
      local_origin,
      slot: SinkSlot::new(),
      fault: StreamFault::default(),
      ack,
      local_closed: false,
      remote_closed: false,
    }
  }

  fn install(&mut self) -> Option<Installed> {
    let fault = self.fault.clone();
    self.slot.install().map(|receiver| (receiver, fault))
  }
}

pub struct StreamMultiplexer {
  side: MultiplexerSide,
  outbound: UnboundedSender<Bytes>,
  entries: HashMap<StreamId, Entry>,
  ids: StreamIdAllocator,
  incoming: UnboundedSender<IncomingOpen>,
}

impl StreamMultiplexer {
  /// Takes ownership of `channel` and starts the multiplexer task
  ///
  /// `token` is attached to every OPEN sent through the returned handle.
  pub fn spawn(
    channel: DataChannel,
    side: MultiplexerSide,
    token: Option<String>,
  ) -> (MultiplexerHandle, IncomingOpens) {
    let (label, outbound, inbound) = channel.into_parts();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let closed = CancellationToken::new();
    let task = StreamMultiplexer {
      side,
      outbound,
      entries: HashMap::new(),
      ids: StreamIdAllocator::default(),
      incoming: incoming_tx,
    };
    let span = tracing::debug_span!("multiplexer", channel = %label, ?side);
    tokio::task::spawn(
      task
        .run(inbound, commands_rx, shutdown.clone(), closed.clone())
        .instrument(span),
    );
    let handle = MultiplexerHandle {
      commands: commands_tx,
      token,
      shutdown,
      closed,
    };
    (handle, incoming_rx)
  }

  async fn run(
    mut self,
    mut inbound: UnboundedReceiver<Bytes>,
    mut commands: UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    closed: CancellationToken,
  ) {
    tracing::debug!("Multiplexer started");
    let reason = loop {
      tokio::select! {
        _ = shutdown.cancelled() => break TunnelError::LocallyClosed,
        command = commands.recv() => match command {
          Some(command) => self.handle_command(command),
          None => break TunnelError::LocallyClosed,
        },
        message = inbound.recv() => match message {
          Some(message) => self.handle_message(message),
          None => break TunnelError::TransportError,
        },
      }
    };
    tracing::debug!(?reason, streams = self.entries.len(), "Multiplexer stopping");
    self.fail_all(reason);
    closed.cancel();
  }

  fn send_frame(&self, frame: Frame) {
    match frame.encode() {
      Ok(encoded) => {
        if self.outbound.send(encoded).is_err() {
          tracing::trace!(stream_id = %frame.id(), "Channel closed; frame discarded");
        }
      }
      Err(error) => {
        tracing::warn!(stream_id = %frame.id(), %error, "Failed to encode frame");
      }
    }
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::Open {
        request,
        registered,
        ack,
      } => {
        let entries = &self.entries;
        let id = match self.ids.allocate(|id| entries.contains_key(&id)) {
          Some(id) => id,
          None => {
            let _ = registered.send(Err(TunnelError::Protocol(
              ProtocolError::MalformedRequest(String::from("stream ids exhausted")),
            )));
            return;
          }
        };
        let frame = Frame::Open { id, request };
        let encoded = match frame.encode() {
          Ok(encoded) => encoded,
          Err(error) => {
            let _ = registered.send(Err(error.into()));
            return;
          }
        };
        tracing::debug!(stream_id = %id, "Opening stream");
        self.entries.insert(id, Entry::new(true, Some(ack)));
        let _ = self.outbound.send(encoded);
        let _ = registered.send(Ok(id));
      }
      Command::Abandon { id } => {
        let abandoned = self
          .entries
          .get(&id)
          .map(|entry| entry.state == StreamState::Opening || !entry.slot.is_installed())
          .unwrap_or(false);
        if abandoned {
          tracing::debug!(stream_id = %id, "Abandoning stream");
          self.entries.remove(&id);
          self.send_frame(Frame::Reset {
            id,
            reason: String::from("timeout"),
          });
        }
      }
      Command::Install { id, reply } => {
        let receiver = match self.entries.get_mut(&id) {
          Some(entry) if entry.state == StreamState::Open => entry.install(),
          _ => None,
        };
        let _ = reply.send(receiver);
      }
      Command::Accept { id, reply } => {
        let receiver = match self.entries.get_mut(&id) {
          Some(entry) if !entry.local_origin && entry.state == StreamState::Opening => {
            entry.state = StreamState::Open;
            entry.install()
          }
          _ => None,
        };
        if receiver.is_some() {
          self.send_frame(Frame::Ack { id, ok: true });
        }
        let _ = reply.send(receiver);
      }
      Command::Reject { id } => {
        let pending = self
          .entries
          .get(&id)
          .map(|entry| !entry.local_origin && entry.state == StreamState::Opening)
          .unwrap_or(false);
        if pending {
          self.entries.remove(&id);
          self.send_frame(Frame::Ack { id, ok: false });
        }
      }
      Command::Send { id, payload } => match self.entries.get(&id) {
        Some(entry) if entry.state == StreamState::Open && !entry.local_closed => {
          self.send_frame(Frame::Data { id, payload });
        }
        _ => tracing::trace!(stream_id = %id, "Dropping data for inactive stream"),
      },
      Command::SendDatagram { id, message } => match self.entries.get(&id) {
        Some(entry) if entry.state == StreamState::Open && !entry.local_closed => {
          self.send_frame(Frame::Datagram { id, message });
        }
        _ => tracing::trace!(stream_id = %id, "Dropping datagram for inactive association"),
      },
      Command::Close { id } => self.close_local(id),
      Command::Reset { id, reason } => {
        if self.entries.remove(&id).is_some() {
          tracing::debug!(stream_id = %id, %reason, "Resetting stream");
          self.send_frame(Frame::Reset { id, reason });
        }
      }
      Command::Release { id } => {
        if let Some(entry) = self.entries.remove(&id) {
          if entry.state == StreamState::Open && !entry.local_closed {
            self.send_frame(Frame::Close { id });
          }
          tracing::trace!(stream_id = %id, "Stream released");
        }
      }
      Command::ActiveStreams { reply } => {
        let _ = reply.send(self.entries.len());
      }
    }
  }

  fn close_local(&mut self, id: StreamId) {
    let (closing, remove) = match self.entries.get_mut(&id) {
      Some(entry) if entry.state == StreamState::Open && !entry.local_closed => {
        entry.local_closed = true;
        (true, entry.remote_closed)
      }
      _ => (false, false),
    };
    if closing {
      self.send_frame(Frame::Close { id });
    }
    if remove {
      self.entries.remove(&id);
    }
  }

  fn handle_message(&mut self, message: Bytes) {
    match Frame::decode(message) {
      Ok(frame) => self.dispatch(frame),
      Err(ProtocolError::MalformedOpen { id, reason }) => {
        tracing::warn!(stream_id = %id, %reason, "Refusing malformed OPEN");
        if self.side == MultiplexerSide::Responder && !self.entries.contains_key(&id) {
          self.send_frame(Frame::Ack { id, ok: false });
        }
      }
      Err(error) => {
        tracing::warn!(%error, "Dropping malformed frame");
      }
    }
  }

  fn dispatch(&mut self, frame: Frame) {
    match frame {
      Frame::Open { id, request } => {
        if self.side != MultiplexerSide::Responder {
          tracing::debug!(stream_id = %id, "Ignoring OPEN sent to the opening side");
          return;
        }
        if self.entries.contains_key(&id) {
          tracing::debug!(stream_id = %id, "Ignoring OPEN for live stream");
          return;
        }
        self.entries.insert(id, Entry::new(false, None));
        if self.incoming.send(IncomingOpen { id, request }).is_err() {
          tracing::debug!(stream_id = %id, "No acceptor; refusing stream");
          self.entries.remove(&id);
          self.send_frame(Frame::Ack { id, ok: false });
        }
      }
      Frame::Ack { id, ok } => {
        let entry = match self.entries.get_mut(&id) {
          Some(entry) if entry.state == StreamState::Opening && entry.local_origin => entry,
          _ => {
            tracing::trace!(stream_id = %id, "Ignoring unexpected ACK");
            return;
          }
        };
        let ack = entry.ack.take();
        if ok {
          entry.state = StreamState::Open;
        } else {
          self.entries.remove(&id);
        }
        let result = if ok { Ok(()) } else { Err(TunnelError::DialFailed) };
        if let Some(ack) = ack {
          let _ = ack.send(result);
        }
      }
      Frame::Data { id, payload } => self.deliver(id, Inbound::Data(payload)),
      Frame::Datagram { id, message } => self.deliver(id, Inbound::Datagram(message)),
      Frame::Close { id } => {
        let remove = match self.entries.get_mut(&id) {
          Some(entry) if !entry.remote_closed => {
            entry.remote_closed = true;
            let _ = entry.slot.push(Inbound::Closed);
            entry.local_closed
          }
          _ => false,
        };
        if remove {
          self.entries.remove(&id);
        }
      }
      Frame::Reset { id, reason } => {
        if let Some(mut entry) = self.entries.remove(&id) {
          tracing::debug!(stream_id = %id, %reason, "Stream reset by remote");
          entry.fault.set(TunnelError::Reset(reason.clone()));
          match entry.ack.take() {
            Some(ack) => {
              let _ = ack.send(Err(TunnelError::Reset(reason)));
            }
            None => {
              let _ = entry.slot.push(Inbound::Reset(reason));
            }
          }
        }
      }
    }
  }

  /// Streams still awaiting their ACK buffer like any other uninstalled slot
  fn deliver(&mut self, id: StreamId, item: Inbound) {
    match self.entries.get_mut(&id) {
      Some(entry) if !entry.remote_closed => {
        if entry.slot.push(item).is_err() {
          tracing::trace!(stream_id = %id, "Stream owner gone; dropping inbound item");
        }
      }
      _ => tracing::trace!(stream_id = %id, "Dropping inbound item for inactive stream"),
    }
  }

  fn fail_all(&mut self, reason: TunnelError) {
    for (_id, mut entry) in self.entries.drain() {
      entry.fault.set(reason.clone());
      match entry.ack.take() {
        Some(ack) => {
          let _ = ack.send(Err(reason.clone()));
        }
        None => {
          let _ = entry.slot.push(Inbound::Failed(reason.clone()));
        }
      }
    }
  }
}

/// A cloneable reference to a running [StreamMultiplexer]
#[derive(Clone)]
pub struct MultiplexerHandle {
  commands: UnboundedSender<Command>,
  token: Option<String>,
  shutdown: CancellationToken,
  closed: CancellationToken,
}

impl std::fmt::Debug for MultiplexerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MultiplexerHandle")
      .field("closed", &self.closed.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl MultiplexerHandle {
  fn command(&self, command: Command) -> Result<(), TunnelError> {
    self
      .commands
      .send(command)
      .map_err(|_| TunnelError::TransportError)
  }

  /// Opens a TCP stream to `destination` through the remote peer
  pub async fn open_stream(
    &self,
    destination: Destination,
    timeout: Duration,
  ) -> Result<MuxStream, TunnelError> {
    let request = OpenRequest::tcp(destination, self.token.clone());
    let (id, (inbound, fault)) = self.open(request, timeout).await?;
    Ok(MuxStream::new(id, self.clone(), inbound, fault))
  }

  /// Opens a UDP association relayed by the remote peer
  pub async fn open_association(&self, timeout: Duration) -> Result<UdpAssociation, TunnelError> {
    let request = OpenRequest::udp(self.token.clone());
    let (id, (inbound, fault)) = self.open(request, timeout).await?;
    Ok(UdpAssociation::new(id, self.clone(), inbound, fault))
  }

  async fn open(
    &self,
    request: OpenRequest,
    timeout: Duration,
  ) -> Result<(StreamId, Installed), TunnelError> {
    let (registered_tx, registered_rx) = oneshot::channel();
    let (ack_tx, ack_rx) = oneshot::channel();
    self.command(Command::Open {
      request,
      registered: registered_tx,
      ack: ack_tx,
    })?;
    let id = registered_rx
      .await
      .map_err(|_| TunnelError::TransportError)??;
    match tokio::time::timeout(timeout, ack_rx).await {
      Ok(Ok(Ok(()))) => {}
      Ok(Ok(Err(error))) => return Err(error),
      Ok(Err(_)) => return Err(TunnelError::TransportError),
      Err(_) => {
        tracing::debug!(stream_id = %id, ?timeout, "Timed out waiting for ACK");
        let _ = self.command(Command::Abandon { id });
        return Err(TunnelError::TimedOut);
      }
    }
    let (reply_tx, reply_rx) = oneshot::channel();
    self.command(Command::Install { id, reply: reply_tx })?;
    let installed = reply_rx.await.map_err(|_| TunnelError::TransportError)?;
    installed
      .map(|installed| (id, installed))
      .ok_or_else(|| TunnelError::Reset(String::from("stream ended before it was installed")))
  }

  async fn accept_inbound(&self, id: StreamId) -> Result<Installed, TunnelError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.command(Command::Accept { id, reply: reply_tx })?;
    reply_rx
      .await
      .map_err(|_| TunnelError::TransportError)?
      .ok_or_else(|| TunnelError::Reset(String::from("stream no longer pending")))
  }

  /// Acknowledges an incoming TCP open and takes ownership of its stream
  pub async fn accept(&self, id: StreamId) -> Result<MuxStream, TunnelError> {
    let (inbound, fault) = self.accept_inbound(id).await?;
    Ok(MuxStream::new(id, self.clone(), inbound, fault))
  }

  /// Acknowledges an incoming UDP association
  pub async fn accept_association(&self, id: StreamId) -> Result<UdpAssociation, TunnelError> {
    let (inbound, fault) = self.accept_inbound(id).await?;
    Ok(UdpAssociation::new(id, self.clone(), inbound, fault))
  }

  /// Refuses an incoming open with ACK(false)
  pub fn reject(&self, id: StreamId) -> Result<(), TunnelError> {
    self.command(Command::Reject { id })
  }

  pub fn send(&self, id: StreamId, payload: Bytes) -> Result<(), TunnelError> {
    self.command(Command::Send { id, payload })
  }

  pub fn send_datagram(&self, id: StreamId, message: UdpRelayMessage) -> Result<(), TunnelError> {
    self.command(Command::SendDatagram { id, message })
  }

  /// Half-closes the local direction of a stream
  pub fn close(&self, id: StreamId) -> Result<(), TunnelError> {
    self.command(Command::Close { id })
  }

  pub fn reset<R: Into<String>>(&self, id: StreamId, reason: R) -> Result<(), TunnelError> {
    self.command(Command::Reset {
      id,
      reason: reason.into(),
    })
  }

  pub(crate) fn release(&self, id: StreamId) {
    let _ = self.command(Command::Release { id });
  }

  /// Number of streams currently tracked by the registry
  pub async fn active_streams(&self) -> Result<usize, TunnelError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.command(Command::ActiveStreams { reply: reply_tx })?;
    reply_rx.await.map_err(|_| TunnelError::TransportError)
  }

  /// Stops the multiplexer, failing every stream it tracks
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Resolves once the multiplexer task has exited
  pub fn closed(&self) -> WaitForCancellationFuture<'_> {
    self.closed.cancelled()
  }
}
