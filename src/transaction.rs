//! Module `transaction` contains the input types consumed by a
//! [`Projector`](crate::projector::Projector): ordered [`Transaction`]s,
//! each carrying one or more [`Envelope`]d events.

use std::collections::HashMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An Event is a single immutable fact recorded in some source system,
/// consumed by zero or more handlers registered in a [`Map`](crate::map::Map).
///
/// The value returned by [`Event::name`] is the dispatch key used to route
/// the event to its registered handler, so it should be unique per event
/// kind. Usually, the implementing type is an `enum`.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// Returns the name used to route this event to a registered handler.
    fn name(&self) -> &'static str;
}

/// Additional out-of-band information attached to a [`Transaction`]
/// or to a single [`Envelope`]d event.
pub type Headers = HashMap<String, serde_json::Value>;

/// An [`Event`] together with the headers recorded next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<E>
where
    E: Event,
{
    /// The actual event carried by this envelope.
    pub body: E,

    /// Headers recorded for this specific event.
    pub headers: Headers,
}

impl<E> From<E> for Envelope<E>
where
    E: Event,
{
    fn from(body: E) -> Self {
        Envelope {
            body,
            headers: Headers::default(),
        }
    }
}

impl<E> PartialEq for Envelope<E>
where
    E: Event + PartialEq,
{
    fn eq(&self, other: &Envelope<E>) -> bool {
        self.body == other.body
    }
}

/// An atomic, ordered bundle of events sharing a stream identifier
/// and a monotonically increasing checkpoint.
///
/// Transactions are the unit of input of a
/// [`Projector`](crate::projector::Projector). The `checkpoint` is expected
/// to increase monotonically within a stream; this is a precondition of the
/// source, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction<E>
where
    E: Event,
{
    /// Unique identifier of the transaction.
    pub id: String,

    /// Identifier of the stream the transaction belongs to.
    pub stream_id: String,

    /// Position marker of this transaction in the source, used to resume
    /// projection after a restart.
    pub checkpoint: i64,

    /// The point in time at which the transaction was committed
    /// to the source system.
    pub timestamp: DateTime<Utc>,

    /// Headers recorded for the whole transaction.
    pub headers: Headers,

    /// The events carried by this transaction, in commit order.
    pub events: Vec<Envelope<E>>,
}

impl<E> Transaction<E>
where
    E: Event,
{
    /// Starts building a new [`Transaction`] with a generated id and the
    /// current time as its timestamp.
    #[must_use]
    pub fn builder() -> Builder<E> {
        Builder::default()
    }
}

/// Fluent builder for [`Transaction`] values, mostly useful in tests
/// and examples.
#[derive(Debug)]
pub struct Builder<E>
where
    E: Event,
{
    id: Option<String>,
    stream_id: String,
    checkpoint: i64,
    timestamp: Option<DateTime<Utc>>,
    headers: Headers,
    events: Vec<Envelope<E>>,
}

impl<E> Default for Builder<E>
where
    E: Event,
{
    fn default() -> Self {
        Self {
            id: None,
            stream_id: String::default(),
            checkpoint: 0,
            timestamp: None,
            headers: Headers::default(),
            events: Vec::default(),
        }
    }
}

impl<E> Builder<E>
where
    E: Event,
{
    /// Overrides the generated transaction id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the stream the transaction belongs to.
    #[must_use]
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    /// Sets the checkpoint of the transaction.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: i64) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Overrides the transaction timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Adds a transaction-level header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Appends an event with empty headers.
    #[must_use]
    pub fn event(mut self, body: E) -> Self {
        self.events.push(Envelope::from(body));
        self
    }

    /// Appends an already-enveloped event.
    #[must_use]
    pub fn envelope(mut self, envelope: Envelope<E>) -> Self {
        self.events.push(envelope);
        self
    }

    /// Finalizes the [`Transaction`], generating an id and timestamp
    /// where none were provided.
    pub fn build(self) -> Transaction<E> {
        Transaction {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            stream_id: self.stream_id,
            checkpoint: self.checkpoint,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            headers: self.headers,
            events: self.events,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StringEvent(pub(crate) &'static str);

    impl Event for StringEvent {
        fn name(&self) -> &'static str {
            "string_event"
        }
    }

    #[test]
    fn builder_generates_id_and_timestamp() {
        let transaction = Transaction::builder()
            .stream_id("stream:test")
            .checkpoint(42)
            .event(StringEvent("hello"))
            .build();

        assert!(!transaction.id.is_empty());
        assert_eq!("stream:test", transaction.stream_id);
        assert_eq!(42, transaction.checkpoint);
        assert_eq!(1, transaction.events.len());
    }

    #[test]
    fn envelope_headers_do_not_affect_equality() {
        let envelope = Envelope::from(StringEvent("hello"));

        let mut with_headers = envelope.clone();
        with_headers
            .headers
            .insert("importance".to_owned(), serde_json::json!("high"));

        assert_eq!(envelope, with_headers);
    }
}
