use crate::client::Probe;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::trace;

/// Observed state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Nothing answers on the server's address.
    Offline,
    /// The server accepts connections and answers commands.
    Online,
    /// Something holds the port but does not answer in time.
    Unresponsive,
}

impl From<&Probe> for ServerState {
    fn from(probe: &Probe) -> Self {
        match probe {
            Probe::Reachable => ServerState::Online,
            Probe::Unreachable(_) => ServerState::Offline,
            Probe::TimedOut => ServerState::Unresponsive,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServerState::Offline => "offline",
            ServerState::Online => "online",
            ServerState::Unresponsive => "unresponsive",
        };
        f.write_str(label)
    }
}

/// Polls `predicate` every `interval` until it holds or `timeout` elapses.
///
/// Returns `Ok(true)` as soon as the predicate holds and `Ok(false)` once the
/// time is up. An error from the predicate ends the wait immediately.
///
/// # Examples
///
/// ```
/// use mongo_runner::server::wait_for;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mongo_runner::error::Result<()> {
/// let mut polls = 0;
/// let converged = wait_for(Duration::from_secs(1), Duration::from_millis(1), || {
///     polls += 1;
///     let done = polls >= 3;
///     async move { Ok(done) }
/// })
/// .await?;
/// assert!(converged);
/// # Ok(())
/// # }
/// ```
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut predicate: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate().await? {
            return Ok(true);
        }
        trace!(elapsed = ?start.elapsed(), "Condition not met yet");
        time::sleep(interval).await;
    }
    Ok(false)
}
