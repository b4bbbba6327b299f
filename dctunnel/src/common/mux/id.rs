// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::common::protocol::StreamId;

/// Hands out stream ids in increasing order, wrapping at 32 bits
///
/// Zero is never produced, and ids still in use are skipped.
#[derive(Debug)]
pub struct StreamIdAllocator {
  next: u32,
}

impl Default for StreamIdAllocator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl StreamIdAllocator {
  pub fn new(next: u32) -> Self {
    Self {
      next: next.max(1),
    }
  }

  /// Returns the next id for which `in_use` is false, or `None` if every id is taken
  pub fn allocate<F: Fn(StreamId) -> bool>(&mut self, in_use: F) -> Option<StreamId> {
    let start = self.next;
    loop {
      let candidate = StreamId::new(self.next);
      self.next = match self.next.wrapping_add(1) {
        0 => 1,
        n => n,
      };
      if !in_use(candidate) {
        return Some(candidate);
      }
      if self.next == start {
        return None;
      }
    }
  }
}
