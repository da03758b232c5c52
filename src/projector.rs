//! Module `projector` contains the [`Projector`]: the batched,
//! checkpointed driver that feeds ordered transactions through a
//! [`Dispatcher`](crate::dispatch::Dispatcher).
//!
//! A projector groups its input into batches, runs each batch inside one
//! store transaction, durably tracks how far it advanced through a
//! [`ProjectorState`] row, and consults a
//! [`RetryPolicy`](crate::retry::RetryPolicy) when a batch fails.
//!
//! Delivery is at-least-once: transactions at or below the persisted
//! checkpoint are skipped on replay, and handlers may observe a
//! transaction again when a batch is retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::dispatch::{Context, Dispatcher};
use crate::error::{ConfigError, Error, ProjectionError};
use crate::projection::Projection;
use crate::retry::{AlwaysAbort, Resolution, RetryPolicy};
use crate::store::{ProjectionStore, ProjectorState, Session, SessionFactory};
use crate::transaction::{Event, Transaction};

/// When the projector writes its [`ProjectorState`] checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistBehavior {
    /// Write the checkpoint row after every batch. This is the default.
    #[default]
    EveryBatch,

    /// Write the checkpoint row only after batches in which at least one
    /// event matched a registered handler.
    DirtyBatch,

    /// Write the checkpoint row only after the last batch of a
    /// [`Projector::handle`] call, or after a successful retry.
    LastBatchOfPage,
}

/// Hook mutating the [`ProjectorState`] row inside the open store
/// transaction, before the row is written.
pub type EnrichFn<E> = Box<dyn Fn(&mut ProjectorState, &Transaction<E>) + Send + Sync>;

/// Materializes projections of type `P` from ordered transaction streams,
/// using sessions produced by the factory `F`.
///
/// A projector instance processes one [`Projector::handle`] call at a
/// time: batches, transactions and events are all projected strictly in
/// order. Parallel projectors must be distinct instances with distinct
/// caches and state keys.
pub struct Projector<P, E, F>
where
    P: Projection,
    E: Event,
    F: SessionFactory,
{
    dispatcher: Dispatcher<P, E, F::Session>,
    factory: F,
    batch_size: usize,
    state_key: String,
    persist_behavior: PersistBehavior,
    enrich: EnrichFn<E>,
    policy: Arc<dyn RetryPolicy<E>>,
}

impl<P, E, F> std::fmt::Debug for Projector<P, E, F>
where
    P: Projection,
    E: Event,
    F: SessionFactory,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("batch_size", &self.batch_size)
            .field("state_key", &self.state_key)
            .field("persist_behavior", &self.persist_behavior)
            .finish_non_exhaustive()
    }
}

impl<P, E, F> Projector<P, E, F>
where
    P: Projection,
    E: Event,
    F: SessionFactory,
    F::Session: ProjectionStore<P> + 'static,
{
    /// Starts building a [`Projector`] from a session factory and a
    /// configured [`Dispatcher`].
    #[must_use]
    pub fn builder(factory: F, dispatcher: Dispatcher<P, E, F::Session>) -> Builder<P, E, F> {
        Builder {
            factory,
            dispatcher,
            batch_size: 1,
            state_key: P::type_name().to_owned(),
            persist_behavior: PersistBehavior::default(),
            enrich: Box::new(|_, _| {}),
            policy: Arc::new(AlwaysAbort),
        }
    }

    /// Returns the state key this projector persists its checkpoint
    /// under.
    #[must_use]
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Projects the given transactions, in input order.
    ///
    /// Transactions at or below the persisted checkpoint are skipped. The
    /// rest are grouped into batches of up to the configured batch size,
    /// each projected inside its own store transaction. A cancellation
    /// observed between batches stops quietly; one observed inside a
    /// batch rolls the store transaction back and returns
    /// [`Error::Canceled`].
    #[instrument(
        name = "Projector.handle",
        skip_all,
        err,
        fields(projector = %self.state_key, transactions = transactions.len())
    )]
    pub async fn handle(
        &self,
        transactions: Vec<Transaction<E>>,
        cancel: &CancelToken,
    ) -> Result<(), Error<E>> {
        let last_checkpoint = self.read_checkpoint().await?;

        let work: Vec<Transaction<E>> = transactions
            .into_iter()
            .filter(|transaction| {
                last_checkpoint.map_or(true, |last| transaction.checkpoint > last)
            })
            .collect();

        if work.is_empty() {
            return Ok(());
        }

        let batches: Vec<&[Transaction<E>]> = work.chunks(self.batch_size).collect();
        let total = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            if cancel.is_canceled() {
                debug!(
                    remaining_batches = total - index,
                    "cancellation observed between batches"
                );
                return Ok(());
            }

            let is_last_of_page = index + 1 == total;
            let mut attempts = 0;

            self.project_with_retry(batch, is_last_of_page, false, &mut attempts, cancel)
                .await?;
        }

        Ok(())
    }

    async fn read_checkpoint(&self) -> Result<Option<i64>, Error<E>> {
        let session = self
            .factory
            .open_session()
            .await
            .map_err(|error| self.store_failure(error, &[]))?;

        let state = session
            .find_state(&self.state_key)
            .await
            .map_err(|error| self.store_failure(error, &[]))?;

        Ok(state.map(|state| state.checkpoint))
    }

    fn project_with_retry<'a>(
        &'a self,
        batch: &'a [Transaction<E>],
        is_last_of_page: bool,
        retrying_individually: bool,
        attempts: &'a mut u32,
        cancel: &'a CancelToken,
    ) -> futures::future::BoxFuture<'a, Result<(), Error<E>>> {
        async move {
            let mut retrying = false;

            loop {
                *attempts += 1;

                // A retried batch is treated as terminal, so a clean retry
                // persists the progress it recovered.
                let error = match self
                    .project_batch(batch, is_last_of_page || retrying, cancel)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(Error::Projection(error)) => error,
                    Err(other) => return Err(other),
                };

                warn!(
                    attempts = *attempts,
                    error = %error,
                    "transaction batch failed to project"
                );

                match self.policy.resolve(&error, *attempts, cancel).await {
                    Resolution::Abort => return Err(Error::Projection(error)),
                    Resolution::Retry => {
                        debug!(attempts = *attempts, "retrying transaction batch");
                        retrying = true;
                    }
                    Resolution::Ignore => {
                        debug!("ignoring failed transaction batch");
                        return Ok(());
                    }
                    Resolution::RetryIndividual => {
                        if retrying_individually {
                            return Err(Error::AlreadyRetryingIndividually);
                        }

                        debug!("retrying transactions of the failed batch individually");

                        for transaction in batch {
                            self.project_with_retry(
                                std::slice::from_ref(transaction),
                                true,
                                true,
                                attempts,
                                cancel,
                            )
                            .await?;
                        }

                        return Ok(());
                    }
                }
            }
        }
        .boxed()
    }

    async fn project_batch(
        &self,
        batch: &[Transaction<E>],
        treat_as_last: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error<E>> {
        let session = self
            .factory
            .open_session()
            .await
            .map_err(|error| self.store_failure(error, batch))?;

        session
            .begin()
            .await
            .map_err(|error| self.store_failure(error, batch))?;

        let result = match self.run_batch(&session, batch, treat_as_last, cancel).await {
            Ok(()) => session
                .commit()
                .await
                .map_err(|error| self.store_failure(error, batch)),
            Err(error) => Err(error),
        };

        if let Err(error) = result {
            // Cached projections must not outlive the transaction they
            // were loaded under.
            self.dispatcher.clear_cache();

            if let Err(rollback_error) = session.rollback().await {
                warn!(
                    error = %rollback_error,
                    "store rollback failed after batch failure"
                );
            }

            return Err(match error {
                Error::Projection(error) => {
                    Error::Projection(error.with_batch(&self.state_key, batch))
                }
                other => other,
            });
        }

        Ok(())
    }

    async fn run_batch(
        &self,
        session: &F::Session,
        batch: &[Transaction<E>],
        treat_as_last: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error<E>> {
        let mut dirty = false;

        for transaction in batch {
            if cancel.is_canceled() {
                return Err(Error::Canceled);
            }

            let handled = AtomicBool::new(false);

            for event in &transaction.events {
                let ctx = Context::for_event(transaction, event, session, &handled);

                self.dispatcher
                    .project_event(event, &ctx)
                    .await
                    .map_err(Error::Projection)?;
            }

            dirty |= handled.load(Ordering::SeqCst);
        }

        let persist = match self.persist_behavior {
            PersistBehavior::EveryBatch => true,
            PersistBehavior::DirtyBatch => dirty,
            PersistBehavior::LastBatchOfPage => treat_as_last,
        };

        if persist {
            if let Some(last) = batch.last() {
                let mut state = ProjectorState::new(self.state_key.as_str(), last.checkpoint);
                (self.enrich)(&mut state, last);

                session
                    .save_state(state)
                    .await
                    .map_err(|error| self.store_failure(error, batch))?;
            }
        }

        session
            .flush()
            .await
            .map_err(|error| self.store_failure(error, batch))?;

        Ok(())
    }

    fn store_failure<Err>(&self, error: Err, batch: &[Transaction<E>]) -> Error<E>
    where
        Err: std::error::Error + Send + Sync + 'static,
    {
        Error::Projection(ProjectionError::batch(
            &self.state_key,
            batch,
            anyhow::Error::new(error),
        ))
    }
}

/// Fluent builder for a [`Projector`], validating its options at
/// [`Builder::build`].
pub struct Builder<P, E, F>
where
    P: Projection,
    E: Event,
    F: SessionFactory,
{
    factory: F,
    dispatcher: Dispatcher<P, E, F::Session>,
    batch_size: usize,
    state_key: String,
    persist_behavior: PersistBehavior,
    enrich: EnrichFn<E>,
    policy: Arc<dyn RetryPolicy<E>>,
}

impl<P, E, F> Builder<P, E, F>
where
    P: Projection,
    E: Event,
    F: SessionFactory,
    F::Session: ProjectionStore<P> + 'static,
{
    /// Sets the number of transactions projected inside one store
    /// transaction. Must be at least 1; defaults to 1.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overrides the identity the checkpoint row is stored under.
    /// Defaults to the projection's type name.
    #[must_use]
    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = state_key.into();
        self
    }

    /// Sets when the checkpoint row is written. Defaults to
    /// [`PersistBehavior::EveryBatch`].
    #[must_use]
    pub fn persist_behavior(mut self, persist_behavior: PersistBehavior) -> Self {
        self.persist_behavior = persist_behavior;
        self
    }

    /// Sets a hook mutating the checkpoint row, inside the open store
    /// transaction, before it is written.
    #[must_use]
    pub fn enrich_state<G>(mut self, enrich: G) -> Self
    where
        G: Fn(&mut ProjectorState, &Transaction<E>) + Send + Sync + 'static,
    {
        self.enrich = Box::new(enrich);
        self
    }

    /// Sets the policy consulted when a batch fails to project. Defaults
    /// to [`AlwaysAbort`].
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy<E> + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Validates the options and returns the [`Projector`].
    pub fn build(self) -> Result<Projector<P, E, F>, ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::BatchSize);
        }

        if self.state_key.is_empty() {
            return Err(ConfigError::EmptyStateKey);
        }

        Ok(Projector {
            factory: self.factory,
            dispatcher: self.dispatcher,
            batch_size: self.batch_size,
            state_key: self.state_key,
            persist_behavior: self.persist_behavior,
            enrich: self.enrich,
            policy: self.policy,
        })
    }
}
