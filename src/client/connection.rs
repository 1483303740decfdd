//! Connection lifecycle: retrying `connect`, idempotent `close`.

use crate::engine::{Driver, Session};
use crate::error::{ClientError, Operation, Result};

use super::Client;

impl<D: Driver> Client<D> {
    /// Open the connection, retrying transient failures with backoff.
    ///
    /// An already open session is released first, so this is also how the
    /// client reconnects. Non-transient failures (bad credentials, malformed
    /// parameters) are returned on the first attempt.
    pub fn connect(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.release_session();

        let mut attempt = 1u32;
        loop {
            tracing::debug!(attempt, "Opening connection");
            match self.driver.connect(&self.params) {
                Ok(session) => {
                    self.session = Some(session);
                    tracing::info!(attempt, "Connected to the database");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    if attempt >= self.policy.max_retries() {
                        tracing::error!(
                            attempts = attempt,
                            error = %err,
                            "Connection failed after {attempt} attempts"
                        );
                        return Err(ClientError::exhausted(Operation::Connect, attempt, err));
                    }
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Connection attempt {attempt} failed. Retrying in {:.2} seconds",
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Connection failed");
                    return Err(ClientError::failed(Operation::Connect, err));
                }
            }
        }
    }

    /// Release the statement handle and connection. Safe to call repeatedly;
    /// only the call that actually closes something logs.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let span = self.span.clone();
        let _enter = span.enter();
        if let Err(err) = session.close() {
            tracing::debug!(error = %err, "Ignoring error while closing connection");
        }
        tracing::info!("Connection closed");
    }

    /// Drop a session that is about to be replaced
    fn release_session(&mut self) {
        if let Some(stale) = self.session.take() {
            if let Err(err) = stale.close() {
                tracing::debug!(error = %err, "Ignoring error while releasing previous connection");
            }
            tracing::debug!("Released previous connection");
        }
    }
}
