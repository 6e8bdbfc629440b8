//! Graceful shutdown plumbing.
//!
//! A single [`tokio_util::sync::CancellationToken`] is threaded through
//! every long-running task (chunk builds, uploads, probes) per the
//! cancellation/timeout design: on shutdown, tasks stop at the next safe
//! point rather than leaving a catalog row in an inconsistent state.

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

/// Returns a token that signals shutdown, and a clone to hand to tasks.
///
/// Call `.cancel()` on the returned token when the process should wind
/// down; tasks holding a clone see `is_cancelled()` flip and should stop at
/// their next safe point.
pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Convenience for synchronous call sites that just want to bail out once
/// shutdown has been requested.
pub fn check(token: &CancellationToken) -> Result<(), ShutdownError> {
    if token.is_cancelled() {
        Err(ShutdownError)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_reports_cancellation() {
        let t = token();
        check(&t).unwrap();
        t.cancel();
        check(&t).unwrap_err();
    }
}
