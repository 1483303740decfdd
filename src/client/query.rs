//! Single statement execution and the transactional retry loop it shares
//! with batches.

use crate::engine::{BindValue, Driver, Row, Session};
use crate::error::{ClientError, DriverResult, Operation, Result};

use super::Client;

impl<D: Driver> Client<D> {
    /// Run one statement and commit.
    ///
    /// With `fetch`, returns every row as a column-ordered map; otherwise
    /// `None`. Transient failures are rolled back, waited out, reconnected and
    /// resubmitted up to `max_retries` attempts; any other failure is rolled
    /// back and returned immediately.
    pub fn execute(
        &mut self,
        statement: &str,
        params: &[BindValue],
        fetch: bool,
    ) -> Result<Option<Vec<Row>>> {
        self.run_in_transaction(Operation::Query, |session| {
            session.execute(statement, params, fetch)
        })
    }

    /// [`execute`](Self::execute) with `fetch` set, flattening `None` to no rows
    pub fn query(&mut self, statement: &str, params: &[BindValue]) -> Result<Vec<Row>> {
        Ok(self.execute(statement, params, true)?.unwrap_or_default())
    }

    /// Run `work` then commit, as one attempt of `operation`.
    ///
    /// Every attempt ends either committed or rolled back. On a transient
    /// failure with attempts left the loop sleeps `delay_for(attempt)`,
    /// reconnects through [`connect`](Self::connect) and calls `work` again
    /// with the same inputs.
    pub(super) fn run_in_transaction<T>(
        &mut self,
        operation: Operation,
        mut work: impl FnMut(&mut D::Session) -> DriverResult<T>,
    ) -> Result<T> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut attempt = 1u32;
        loop {
            let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;

            let outcome = match work(session) {
                Ok(output) => session.commit().map(|()| output),
                Err(err) => Err(err),
            };
            let err = match outcome {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if let Err(rollback_err) = session.rollback() {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }

            if !err.is_transient() {
                tracing::error!(error = %err, "{operation} failed");
                return Err(ClientError::failed(operation, err));
            }

            if attempt >= self.policy.max_retries() {
                tracing::error!(
                    attempts = attempt,
                    error = %err,
                    "{operation} failed after {attempt} attempts"
                );
                return Err(ClientError::exhausted(operation, attempt, err));
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "{operation} attempt {attempt} failed. Retrying in {:.2} seconds",
                delay.as_secs_f64()
            );
            self.sleeper.sleep(delay);
            self.connect()?;
            attempt += 1;
        }
    }
}
