// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

pub mod cancellation;
pub mod validators;

/// Pipes bytes both ways until each direction reaches EOF
///
/// EOF on one side shuts down writes on the other, so a tunneled stream
/// half-closes exactly when its local socket does. Returns `(a_to_b, b_to_a)`.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64), std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin + ?Sized,
  B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  match tokio::io::copy_bidirectional(a, b).await {
    Ok(counts) => Ok(counts),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy copy ended with error");
      Err(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use tokio::io::duplex;
  use tokio::io::AsyncReadExt;
  use tokio::io::AsyncWriteExt;
  use tokio::sync::Barrier;

  // Closing the input of one direction must close that direction's output
  // while the opposite direction keeps flowing
  #[tokio::test]
  async fn independent_directional_closure() {
    let (mut near, near_proxy) = duplex(2048);
    let (far_proxy, mut far) = duplex(2048);

    let request_input = Vec::from(*b"request").repeat(128);
    let response_input = Vec::from(*b"response").repeat(128);
    let both_closed = Arc::new(Barrier::new(2));

    let proxy = tokio::task::spawn(async move {
      let (mut near_proxy, mut far_proxy) = (near_proxy, far_proxy);
      super::proxy_bidirectional(&mut near_proxy, &mut far_proxy).await
    });

    let client = tokio::task::spawn({
      let request_input = request_input.clone();
      let response_input = response_input.clone();
      let both_closed = both_closed.clone();
      async move {
        near.write_all(&request_input).await.unwrap();
        near.shutdown().await.unwrap();
        let mut buf = Vec::new();
        near.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, response_input);
        both_closed.wait().await;
      }
    });

    let server = tokio::task::spawn(async move {
      let mut buf = Vec::new();
      far.read_to_end(&mut buf).await.unwrap();
      assert_eq!(buf, request_input);
      far.write_all(&response_input).await.unwrap();
      far.shutdown().await.unwrap();
      both_closed.wait().await;
    });

    let (client, server, proxy) = tokio::time::timeout(Duration::from_secs(10), async {
      tokio::join!(client, server, proxy)
    })
    .await
    .expect("Timeout reached running async test");
    client.unwrap();
    server.unwrap();
    let (up, down) = proxy.unwrap().unwrap();
    assert_eq!(up, 7 * 128);
    assert_eq!(down, 8 * 128);
  }
}
