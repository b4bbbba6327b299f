// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that agents may observe but not trigger
///
/// Agents derive child tokens for the tasks they own; only the holder of the
/// original token can stop them.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Cancels `token` on the first ctrl-c, returning a listener for it
pub fn cancel_on_ctrl_c(token: CancellationToken) -> CancellationListener {
  let listener = CancellationListener::from(token.child_token());
  tokio::task::spawn(async move {
    tokio::select! {
      _ = token.cancelled() => {}
      signal = tokio::signal::ctrl_c() => {
        match signal {
          Ok(()) => tracing::info!("Interrupt received; shutting down"),
          Err(error) => tracing::warn!(%error, "Failed to listen for interrupts; shutting down"),
        }
        token.cancel();
      }
    }
  });
  listener
}
