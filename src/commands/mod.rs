//! CLI commands

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod reap;
pub mod run;

/// Cancellation driven by SIGINT and SIGTERM.
///
/// The first signal fires `interrupt`: the current step is abandoned and
/// the run moves on to log collection and teardown. A second signal fires
/// `abort`, which stops every command still in flight, cleanup included.
#[derive(Clone, Debug)]
pub struct Shutdown {
    pub interrupt: CancellationToken,
    pub abort: CancellationToken,
}

impl Shutdown {
    /// Tokens that are never cancelled by a signal
    pub fn new() -> Self {
        let abort = CancellationToken::new();
        Self {
            interrupt: abort.child_token(),
            abort,
        }
    }

    /// Cancel the tokens when the process is signalled
    pub fn on_signals() -> Self {
        let shutdown = Self::new();
        let tokens = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = next_signal().await {
                warn!(error = %e, "Cannot listen for signals");
                return;
            }
            warn!("Interrupted, cleaning up; signal again to abort the cleanup");
            tokens.interrupt.cancel();

            if next_signal().await.is_ok() {
                warn!("Aborting");
                tokens.abort.cancel();
            }
        });
        shutdown
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        outcome = tokio::signal::ctrl_c() => outcome,
        _ = terminate.recv() => Ok(()),
    }
}
