//! Module `retry` contains the [`RetryPolicy`] consulted when a batch
//! fails to project, and the [`Resolution`]s it can return.

use std::future::Future;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::ProjectionError;
use crate::transaction::Event;

/// The outcome a [`RetryPolicy`] chooses for a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Rethrow the failure to the caller of
    /// [`Projector::handle`](crate::projector::Projector::handle).
    Abort,

    /// Run the whole batch again.
    Retry,

    /// Bisect the batch: run every transaction of the batch individually,
    /// in input order, each inside its own store transaction.
    RetryIndividual,

    /// Swallow the failure and skip the batch.
    ///
    /// The checkpoint does not advance for an ignored batch, so its
    /// transactions are delivered again on the next run; handlers must be
    /// prepared for that.
    Ignore,
}

/// A policy deciding how the projector responds to a failed batch.
///
/// The policy is consulted with the failure (the original batch of
/// transactions is attached to it) and the number of attempts made so
/// far, starting at 1. Policies are shared, read-only, for the lifetime
/// of the projector.
#[async_trait]
pub trait RetryPolicy<E>: Send + Sync
where
    E: Event,
{
    /// Chooses a [`Resolution`] for the given failure.
    async fn resolve(
        &self,
        error: &ProjectionError<E>,
        attempts: u32,
        cancel: &CancelToken,
    ) -> Resolution;
}

#[async_trait]
impl<E, F, Fut> RetryPolicy<E> for F
where
    E: Event,
    F: Send + Sync + Fn(&ProjectionError<E>, u32, &CancelToken) -> Fut,
    Fut: Send + Future<Output = Resolution>,
{
    async fn resolve(
        &self,
        error: &ProjectionError<E>,
        attempts: u32,
        cancel: &CancelToken,
    ) -> Resolution {
        self(error, attempts, cancel).await
    }
}

/// The default [`RetryPolicy`]: every failure aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAbort;

#[async_trait]
impl<E> RetryPolicy<E> for AlwaysAbort
where
    E: Event,
{
    async fn resolve(
        &self,
        _error: &ProjectionError<E>,
        _attempts: u32,
        _cancel: &CancelToken,
    ) -> Resolution {
        Resolution::Abort
    }
}
