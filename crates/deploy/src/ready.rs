//! Readiness polling for started deployments.

use std::{future::Future, time::Duration};

use tokio::net::TcpStream;

/// Default interval between polling attempts when waiting for readiness.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wait for something to be ready by repeatedly calling a check function.
///
/// # Arguments
/// * `name` - What is being waited on (for error messages)
/// * `timeout` - Maximum time to wait
/// * `check_fn` - Returns `Ok(true)` once ready, `Ok(false)` to keep waiting, or an
///   error to give up immediately
pub async fn wait_until_ready<F, Fut>(
    name: &str,
    timeout: Duration,
    mut check_fn: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let start = std::time::Instant::now();

    loop {
        if check_fn().await? {
            tracing::debug!(%name, elapsed_ms = start.elapsed().as_millis() as u64, "Ready");
            return Ok(());
        }

        if start.elapsed() > timeout {
            anyhow::bail!("Timeout waiting for {} to be ready", name);
        }

        tracing::trace!(%name, "Not ready yet, retrying...");
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Whether something accepts TCP connections on the local `port`.
pub async fn port_accepts(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}
