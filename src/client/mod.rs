//! Resilient Client
//!
//! [`Client`] owns exactly one database session and keeps it usable across
//! transient failures:
//!
//! - `connect` retries transient connection failures with backoff
//! - `execute` / `execute_batch` commit on success; on failure they roll back,
//!   and for transient failures wait, reconnect and resubmit
//! - `close` is idempotent
//!
//! # Scoped acquisition
//! [`Client::acquire`] returns a [`ClientGuard`] that closes the connection
//! when it goes out of scope, on every exit path including `?` returns and
//! panics. [`Client::scoped`] wraps the same pattern around a closure.
//!
//! # Concurrency
//! Every operation takes `&mut self`. One client is one connection used by
//! one caller at a time; there is no internal locking.

mod batch;
mod connection;
mod query;


use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::engine::{ConnectionParams, ConnectionState, DatabaseType, Driver};
use crate::error::Result;
use crate::retry::{RetryConfig, RetryPolicy, Sleeper, ThreadSleeper};

/// A single-connection database client with retry and reconnect
pub struct Client<D: Driver> {
    driver: D,
    params: ConnectionParams,
    policy: RetryPolicy,
    session: Option<D::Session>,
    rng: Box<dyn RngCore + Send>,
    sleeper: Box<dyn Sleeper>,
    span: tracing::Span,
}

impl<D: Driver> Client<D> {
    /// Create a closed client. Fails if `retry` is not a valid configuration.
    pub fn new(driver: D, params: ConnectionParams, retry: RetryConfig) -> Result<Self> {
        let policy = RetryPolicy::new(retry)?;
        let span = tracing::info_span!(
            "db_client",
            engine = %driver.engine(),
            host = %params.host,
            database = %params.database,
        );

        Ok(Self {
            driver,
            params,
            policy,
            session: None,
            rng: Box::new(StdRng::from_entropy()),
            sleeper: Box::new(ThreadSleeper),
            span,
        })
    }

    /// Replace the jitter source
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Use a deterministic jitter source seeded with `seed`
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    /// Replace how backoff delays are waited out
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn engine(&self) -> DatabaseType {
        self.driver.engine()
    }

    /// Connect and return a guard that closes the connection when dropped
    pub fn acquire(&mut self) -> Result<ClientGuard<'_, D>> {
        self.connect()?;
        Ok(ClientGuard { client: self })
    }

    /// Connect, run `f`, and close the connection whatever `f` returns
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut guard = self.acquire()?;
        f(&mut guard)
    }

    fn backoff(&mut self, attempt: u32) -> Duration {
        self.policy.delay_for(attempt, self.rng.as_mut())
    }
}

impl<D: Driver> Drop for Client<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("engine", &self.driver.engine())
            .field("params", &self.params)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Scoped connection: derefs to the [`Client`] and closes it on drop
#[must_use = "the connection is closed as soon as the guard is dropped"]
pub struct ClientGuard<'a, D: Driver> {
    client: &'a mut Client<D>,
}

impl<D: Driver> Deref for ClientGuard<'_, D> {
    type Target = Client<D>;

    fn deref(&self) -> &Client<D> {
        self.client
    }
}

impl<D: Driver> DerefMut for ClientGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Client<D> {
        self.client
    }
}

impl<D: Driver> Drop for ClientGuard<'_, D> {
    fn drop(&mut self) {
        self.client.close();
    }
}

impl<D: Driver> fmt::Debug for ClientGuard<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientGuard").field(&*self.client).finish()
    }
}
