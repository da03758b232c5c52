//! Module `error` contains the error types surfaced by a
//! [`Projector`](crate::projector::Projector) and its collaborators.

use crate::transaction::{Event, Transaction};

/// A failure raised by an event handler or a store call while projecting.
///
/// The error is tagged while it propagates: the dispatcher records the
/// transaction and event under way, a child projector adds its own
/// identity, and the batch driver attaches the projector identity and the
/// full batch of transactions before the error reaches the
/// [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProjectionError<E>
where
    E: Event,
{
    message: String,

    /// Identity of the projector that failed.
    pub projector: Option<String>,

    /// Identity of the child projector that failed, when the failure
    /// originated in a nested dispatcher.
    pub child_projector: Option<String>,

    /// Identifier of the transaction under way when the failure occurred.
    pub transaction_id: Option<String>,

    /// Name of the event under way when the failure occurred.
    pub event: Option<String>,

    /// The full batch of transactions under way when the failure occurred.
    pub batch: Vec<Transaction<E>>,

    /// The underlying cause.
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl<E> ProjectionError<E>
where
    E: Event,
{
    /// Creates an error for a failure raised while projecting a single
    /// event.
    pub(crate) fn event(
        projector: &str,
        transaction_id: &str,
        event: &str,
        cause: anyhow::Error,
    ) -> Self {
        Self {
            message: "Projector failed to project an event.".to_owned(),
            projector: Some(projector.to_owned()),
            child_projector: None,
            transaction_id: Some(transaction_id.to_owned()),
            event: Some(event.to_owned()),
            batch: Vec::new(),
            cause: Some(cause),
        }
    }

    /// Creates an error for a failure raised outside of event dispatch,
    /// with the batch under way attached.
    pub(crate) fn batch(projector: &str, batch: &[Transaction<E>], cause: anyhow::Error) -> Self {
        Self {
            message: "Projector failed to project transaction batch.".to_owned(),
            projector: Some(projector.to_owned()),
            child_projector: None,
            transaction_id: None,
            event: None,
            batch: batch.to_vec(),
            cause: Some(cause),
        }
    }

    /// Records the identity of the child projector the error escaped
    /// from, unless an inner child already claimed it.
    #[must_use]
    pub(crate) fn with_child(mut self, child: &str) -> Self {
        if self.child_projector.is_none() {
            self.child_projector = Some(child.to_owned());
        }

        self
    }

    /// Attaches the projector identity and the batch under way, keeping
    /// any more specific tags recorded closer to the failure.
    #[must_use]
    pub(crate) fn with_batch(mut self, projector: &str, batch: &[Transaction<E>]) -> Self {
        if self.projector.is_none() {
            self.projector = Some(projector.to_owned());
        }

        if self.batch.is_empty() {
            self.batch = batch.to_vec();
        }

        self
    }

    /// Returns the human-readable failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// List of possible errors returned by
/// [`Projector::handle`](crate::projector::Projector::handle).
#[derive(Debug, thiserror::Error)]
pub enum Error<E>
where
    E: Event,
{
    /// A batch failed to project and the
    /// [`RetryPolicy`](crate::retry::RetryPolicy) resolved to abort.
    #[error(transparent)]
    Projection(#[from] ProjectionError<E>),

    /// The [`CancelToken`](crate::cancel::CancelToken) fired while a batch
    /// was under way; the store transaction was rolled back and the cache
    /// cleared.
    #[error("projection was canceled while a batch was under way")]
    Canceled,

    /// The [`RetryPolicy`](crate::retry::RetryPolicy) resolved to retry
    /// transactions individually while the controller was already
    /// retrying individually. Non-recoverable.
    #[error("the retry policy requested individual retries while already retrying individually")]
    AlreadyRetryingIndividually,
}

/// List of possible errors returned when building a
/// [`Projector`](crate::projector::Projector) with invalid options.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The configured batch size was zero.
    #[error("batch size must be at least 1")]
    BatchSize,

    /// The configured state key was empty.
    #[error("state key must not be empty")]
    EmptyStateKey,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transaction::tests::StringEvent;
    use crate::transaction::Transaction;

    #[test]
    fn event_errors_keep_their_message_when_tagged_with_a_batch() {
        let batch = vec![Transaction::builder()
            .stream_id("stream:test")
            .checkpoint(1)
            .event(StringEvent("hello"))
            .build()];

        let error = ProjectionError::event("Row", "tx-1", "string_event", anyhow::anyhow!("boom"))
            .with_batch("rows", &batch);

        assert_eq!("Projector failed to project an event.", error.message());
        assert_eq!(Some("Row".to_owned()), error.projector);
        assert_eq!(Some("tx-1".to_owned()), error.transaction_id);
        assert_eq!(Some("string_event".to_owned()), error.event);
        assert_eq!(1, error.batch.len());
    }

    #[test]
    fn the_first_child_to_annotate_wins() {
        let error = ProjectionError::<StringEvent>::event(
            "Row",
            "tx-1",
            "string_event",
            anyhow::anyhow!("boom"),
        )
        .with_child("inner")
        .with_child("outer");

        assert_eq!(Some("inner".to_owned()), error.child_projector);
    }
}
