// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use super::traits::*;
use crate::common::protocol::OpenRequest;

/// Requires the request token to equal the configured token exactly
pub struct ExactTokenAuthenticator {
  expected: String,
}

impl ExactTokenAuthenticator {
  pub fn new<S: Into<String>>(expected: S) -> Self {
    Self {
      expected: expected.into(),
    }
  }

  fn check(&self, request: &OpenRequest) -> Result<(), AuthenticationError> {
    match request.token.as_deref() {
      None => Err(AuthenticationError::MissingToken),
      Some(token) if token == self.expected => Ok(()),
      Some(_) => Err(AuthenticationError::TokenMismatch),
    }
  }
}

// Never print the expected token
impl std::fmt::Debug for ExactTokenAuthenticator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExactTokenAuthenticator")
      .finish_non_exhaustive()
  }
}

impl OpenAuthenticator for ExactTokenAuthenticator {
  fn authenticate<'a>(
    &'a self,
    request: &'a OpenRequest,
  ) -> BoxFuture<'a, Result<(), AuthenticationError>> {
    futures::future::ready(self.check(request)).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::{authentication::NoOpAuthenticator, protocol::Destination};

  fn request(token: Option<&str>) -> OpenRequest {
    OpenRequest::tcp(Destination::new("example.com", 80), token.map(String::from))
  }

  #[tokio::test]
  async fn exact_match_only() {
    let authenticator = ExactTokenAuthenticator::new("s3cret");
    assert_eq!(authenticator.authenticate(&request(Some("s3cret"))).await, Ok(()));
    assert_eq!(
      authenticator.authenticate(&request(Some("S3CRET"))).await,
      Err(AuthenticationError::TokenMismatch)
    );
    assert_eq!(
      authenticator.authenticate(&request(Some("s3cret "))).await,
      Err(AuthenticationError::TokenMismatch)
    );
    assert_eq!(
      authenticator.authenticate(&request(None)).await,
      Err(AuthenticationError::MissingToken)
    );
  }

  #[tokio::test]
  async fn no_op_admits_everything() {
    let authenticator = NoOpAuthenticator::new();
    assert_eq!(authenticator.authenticate(&request(None)).await, Ok(()));
    assert_eq!(authenticator.authenticate(&request(Some("x"))).await, Ok(()));
  }

  #[tokio::test]
  async fn empty_expected_token_checks_nothing() {
    let authenticator = crate::common::authentication::authenticator_for(Some(String::new()));
    assert_eq!(authenticator.authenticate(&request(None)).await, Ok(()));
    let authenticator = crate::common::authentication::authenticator_for(Some(String::from("t")));
    assert_eq!(
      authenticator.authenticate(&request(None)).await,
      Err(AuthenticationError::MissingToken)
    );
  }

  #[test]
  fn debug_hides_the_token() {
    let rendered = format!("{:?}", ExactTokenAuthenticator::new("s3cret"));
    assert!(!rendered.contains("s3cret"));
  }
}
