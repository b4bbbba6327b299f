// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::common::protocol::OpenRequest;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
  #[error("Open request carried no token")]
  MissingToken,
  #[error("Open request token did not match")]
  TokenMismatch,
}

/// Decides whether an OPEN may proceed to dialing
pub trait OpenAuthenticator: std::fmt::Debug + Send + Sync {
  fn authenticate<'a>(
    &'a self,
    request: &'a OpenRequest,
  ) -> BoxFuture<'a, Result<(), AuthenticationError>>;
}

pub type ArcAuthenticator = Arc<dyn OpenAuthenticator + 'static>;

/// An exact-match authenticator when a non-empty token is expected, otherwise one that admits everything
pub fn authenticator_for(expected_token: Option<String>) -> ArcAuthenticator {
  match expected_token {
    Some(token) if !token.is_empty() => Arc::new(super::ExactTokenAuthenticator::new(token)),
    _ => Arc::new(super::NoOpAuthenticator::new()),
  }
}
