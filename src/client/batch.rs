//! Parameter batches.

use crate::engine::{BindValue, Driver, Session};
use crate::error::{Operation, Result};

use super::Client;

impl<D: Driver> Client<D> {
    /// Run `statement` once per tuple in `param_list`, then commit.
    ///
    /// All-or-nothing per attempt: a retried attempt resubmits the entire
    /// list, so the statement must be safe to replay once the previous attempt
    /// has been rolled back. An empty list commits without touching any rows.
    pub fn execute_batch(&mut self, statement: &str, param_list: &[Vec<BindValue>]) -> Result<()> {
        tracing::debug!(tuples = param_list.len(), "Submitting batch");
        self.run_in_transaction(Operation::Batch, |session| {
            session.execute_batch(statement, param_list)
        })
    }
}
