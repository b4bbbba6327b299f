// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::collections::VecDeque;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Where a stream's inbound items go before and after its consumer exists
///
/// Items pushed while `Buffering` are queued; [SinkSlot::install] hands them,
/// in order, to the new consumer before any later item. Each item is delivered
/// at most once, and only to the first consumer installed.
#[derive(Debug)]
pub enum SinkSlot<T> {
  Buffering(VecDeque<T>),
  Installed(UnboundedSender<T>),
  /// The consumer went away; further items are refused
  Detached,
}

impl<T> Default for SinkSlot<T> {
  fn default() -> Self {
    Self::Buffering(VecDeque::new())
  }
}

impl<T> SinkSlot<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queues or delivers an item, handing it back if nobody can receive it
  pub fn push(&mut self, item: T) -> Result<(), T> {
    match self {
      Self::Buffering(queue) => {
        queue.push_back(item);
        Ok(())
      }
      Self::Installed(sink) => match sink.send(item) {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendError(item)) => {
          *self = Self::Detached;
          Err(item)
        }
      },
      Self::Detached => Err(item),
    }
  }

  /// Installs a consumer, draining buffered items into it first
  ///
  /// Returns `None` if a consumer was already installed or detached.
  pub fn install(&mut self) -> Option<UnboundedReceiver<T>> {
    let queue = match std::mem::replace(self, Self::Detached) {
      Self::Buffering(queue) => queue,
      other => {
        *self = other;
        return None;
      }
    };
    let (sink, receiver) = mpsc::unbounded_channel();
    for item in queue {
      // The receiver is alive in this scope
      let _ = sink.send(item);
    }
    *self = Self::Installed(sink);
    Some(receiver)
  }

  pub fn buffered_len(&self) -> usize {
    match self {
      Self::Buffering(queue) => queue.len(),
      _ => 0,
    }
  }

  pub fn is_installed(&self) -> bool {
    matches!(self, Self::Installed(_))
  }

  pub fn detach(&mut self) {
    *self = Self::Detached;
  }
}

#[cfg(test)]
mod tests {
  use super::SinkSlot;

  #[tokio::test]
  async fn buffered_items_precede_later_items() {
    let mut slot = SinkSlot::new();
    slot.push(1).unwrap();
    slot.push(2).unwrap();
    assert_eq!(slot.buffered_len(), 2);
    let mut receiver = slot.install().expect("First install must succeed");
    slot.push(3).unwrap();
    assert!(slot.is_installed());
    assert_eq!(receiver.recv().await, Some(1));
    assert_eq!(receiver.recv().await, Some(2));
    assert_eq!(receiver.recv().await, Some(3));
  }

  #[test]
  fn second_install_is_refused() {
    let mut slot = SinkSlot::<u8>::new();
    let _first = slot.install().unwrap();
    assert!(slot.install().is_none());
  }

  #[test]
  fn dropped_consumer_detaches_slot() {
    let mut slot = SinkSlot::new();
    let receiver = slot.install().unwrap();
    drop(receiver);
    assert_eq!(slot.push(7), Err(7));
    assert!(matches!(slot, SinkSlot::Detached));
    assert_eq!(slot.push(8), Err(8));
  }
}
