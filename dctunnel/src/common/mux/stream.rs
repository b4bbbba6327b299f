// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::{Error as IOError, ErrorKind},
  pin::Pin,
  sync::{Arc, Mutex},
  task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  sync::mpsc::UnboundedReceiver,
};

use super::{Inbound, MultiplexerHandle};
use crate::common::protocol::{StreamId, TunnelError, UdpRelayMessage};

/// The error that ended a stream, shared with the multiplexer task
///
/// The first error recorded wins.
#[derive(Debug, Clone, Default)]
pub struct StreamFault(Arc<Mutex<Option<TunnelError>>>);

impl StreamFault {
  pub(crate) fn set(&self, error: TunnelError) {
    if let Ok(mut fault) = self.0.lock() {
      fault.get_or_insert(error);
    }
  }

  pub fn get(&self) -> Option<TunnelError> {
    self.0.lock().ok().and_then(|fault| fault.clone())
  }
}

enum ReadState {
  Open,
  Eof,
}

/// One tunneled TCP conversation, exclusively owned
///
/// Writes become DATA frames without waiting for the remote side; shutdown
/// sends CLOSE, and dropping the stream releases its id.
pub struct MuxStream {
  id: StreamId,
  handle: MultiplexerHandle,
  inbound: UnboundedReceiver<Inbound>,
  fault: StreamFault,
  pending: Bytes,
  read_state: ReadState,
  write_closed: bool,
}

impl std::fmt::Debug for MuxStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxStream")
      .field("id", &self.id)
      .field("write_closed", &self.write_closed)
      .finish_non_exhaustive()
  }
}

impl MuxStream {
  pub(super) fn new(
    id: StreamId,
    handle: MultiplexerHandle,
    inbound: UnboundedReceiver<Inbound>,
    fault: StreamFault,
  ) -> Self {
    Self {
      id,
      handle,
      inbound,
      fault,
      pending: Bytes::new(),
      read_state: ReadState::Open,
      write_closed: false,
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  /// Aborts the stream in both directions
  pub fn reset<R: Into<String>>(self, reason: R) {
    let _ = self.handle.reset(self.id, reason);
  }
}

impl AsyncRead for MuxStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    loop {
      if !this.pending.is_empty() {
        let count = std::cmp::min(this.pending.len(), buf.remaining());
        buf.put_slice(&this.pending[..count]);
        this.pending.advance(count);
        return Poll::Ready(Ok(()));
      }
      if let ReadState::Eof = this.read_state {
        return Poll::Ready(Ok(()));
      }
      match this.inbound.poll_recv(cx) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(Some(Inbound::Data(data))) => this.pending = data,
        Poll::Ready(Some(Inbound::Closed)) | Poll::Ready(None) => this.read_state = ReadState::Eof,
        Poll::Ready(Some(Inbound::Reset(reason))) => {
          this.read_state = ReadState::Eof;
          let error = TunnelError::Reset(reason);
          this.fault.set(error.clone());
          return Poll::Ready(Err(error.into()));
        }
        Poll::Ready(Some(Inbound::Failed(error))) => {
          this.read_state = ReadState::Eof;
          this.fault.set(error.clone());
          return Poll::Ready(Err(error.into()));
        }
        Poll::Ready(Some(Inbound::Datagram(_))) => {
          tracing::trace!(stream_id = %this.id, "Ignoring datagram on byte stream");
        }
      }
    }
  }
}

impl AsyncWrite for MuxStream {
  fn poll_write(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    if let Some(error) = self.fault.get() {
      return Poll::Ready(Err(error.into()));
    }
    if self.write_closed {
      return Poll::Ready(Err(IOError::new(
        ErrorKind::BrokenPipe,
        TunnelError::LocallyClosed,
      )));
    }
    match self.handle.send(self.id, Bytes::copy_from_slice(buf)) {
      Ok(()) => Poll::Ready(Ok(buf.len())),
      Err(error) => Poll::Ready(Err(error.into())),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.fault.get() {
      Some(error) => Poll::Ready(Err(error.into())),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    if !this.write_closed {
      this.write_closed = true;
      let _ = this.handle.close(this.id);
    }
    Poll::Ready(Ok(()))
  }
}

impl Drop for MuxStream {
  fn drop(&mut self) {
    self.handle.release(self.id);
  }
}

/// One tunneled UDP association
pub struct UdpAssociation {
  id: StreamId,
  handle: MultiplexerHandle,
  inbound: UnboundedReceiver<Inbound>,
  fault: StreamFault,
}

impl UdpAssociation {
  pub(super) fn new(
    id: StreamId,
    handle: MultiplexerHandle,
    inbound: UnboundedReceiver<Inbound>,
    fault: StreamFault,
  ) -> Self {
    Self {
      id,
      handle,
      inbound,
      fault,
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn send(&self, message: UdpRelayMessage) -> Result<(), TunnelError> {
    if let Some(error) = self.fault.get() {
      return Err(error);
    }
    self.handle.send_datagram(self.id, message)
  }

  /// Next datagram from the remote side; `None` once the association closes
  pub async fn recv(&mut self) -> Result<Option<UdpRelayMessage>, TunnelError> {
    loop {
      match self.inbound.recv().await {
        Some(Inbound::Datagram(message)) => return Ok(Some(message)),
        Some(Inbound::Closed) | None => return Ok(None),
        Some(Inbound::Reset(reason)) => return Err(TunnelError::Reset(reason)),
        Some(Inbound::Failed(error)) => return Err(error),
        Some(Inbound::Data(_)) => {
          tracing::trace!(stream_id = %self.id, "Ignoring stream data on association");
        }
      }
    }
  }

  pub fn reset<R: Into<String>>(self, reason: R) {
    let _ = self.handle.reset(self.id, reason);
  }
}

impl Drop for UdpAssociation {
  fn drop(&mut self) {
    self.handle.release(self.id);
  }
}
