//! Module `store` contains the contracts the projector uses to talk to a
//! durable relational backend: a unit-of-work [`Session`], the typed
//! [`ProjectionStore`] operations over it, and the [`ProjectorState`]
//! checkpoint row.
//!
//! The crate ships an in-memory implementation in [`memory`], useful for
//! tests and transient projections; persistent backends implement these
//! traits against their own database driver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::projection::Projection;
use crate::transaction::Headers;

pub mod memory;

/// A unit-of-work against a relational backend.
///
/// A session is opened per batch through a [`SessionFactory`], owns exactly
/// one store transaction at a time, and is exclusively borrowed by the
/// running batch for its whole lifetime.
#[async_trait]
pub trait Session: Send + Sync {
    /// The error type returned by the backing store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Begins a store transaction on this session.
    async fn begin(&self) -> Result<(), Self::Error>;

    /// Pushes all pending changes to the backend, within the open
    /// transaction.
    async fn flush(&self) -> Result<(), Self::Error>;

    /// Commits the open store transaction.
    async fn commit(&self) -> Result<(), Self::Error>;

    /// Rolls back the open store transaction, discarding pending changes.
    async fn rollback(&self) -> Result<(), Self::Error>;

    /// Returns the checkpoint row stored under `id`, if any.
    async fn find_state(&self, id: &str) -> Result<Option<ProjectorState>, Self::Error>;

    /// Inserts or replaces the checkpoint row, within the open transaction.
    async fn save_state(&self, state: ProjectorState) -> Result<(), Self::Error>;
}

/// Typed projection operations a [`Session`] supports for a specific
/// [`Projection`] type.
///
/// A session implements this trait once per projection type it can store,
/// so a single store transaction can span a parent projection and all of
/// its children.
#[async_trait]
pub trait ProjectionStore<P>: Session
where
    P: Projection,
{
    /// Loads the projection stored under `key`, or `None` if absent.
    async fn load(&self, key: &P::Key) -> Result<Option<P>, Self::Error>;

    /// Marks a new projection for insertion at flush.
    async fn insert(&self, projection: P) -> Result<(), Self::Error>;

    /// Records the new value of an already-tracked projection.
    async fn update(&self, projection: P) -> Result<(), Self::Error>;

    /// Marks a projection for deletion at flush.
    async fn delete(&self, projection: &P) -> Result<(), Self::Error>;

    /// Declares an instance loaded in an earlier session as a tracked,
    /// unmodified entity of this session, without reloading it.
    ///
    /// Stores without change tracking can leave the default no-op in place;
    /// the dispatcher always records mutations through
    /// [`ProjectionStore::update`] afterwards.
    async fn reattach(&self, _projection: &P) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Produces a fresh [`Session`] per batch.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// The session type produced by this factory.
    type Session: Session;

    /// Opens a new session against the backend.
    async fn open_session(&self) -> Result<Self::Session, <Self::Session as Session>::Error>;
}

/// The checkpoint row a projector keeps about itself: exactly one row per
/// projector, keyed by a stable state key.
///
/// After a successful batch commit in which state persistence was due, the
/// stored `checkpoint` equals the checkpoint of the last transaction of
/// that batch.
///
/// Backends must store `checkpoint` as a 64-bit signed integer and accept
/// `id` values of at least 150 characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorState {
    /// The state key identifying the owning projector.
    pub id: String,

    /// Checkpoint of the last transaction projected before this row
    /// was written.
    pub checkpoint: i64,

    /// The point in time at which this row was last written.
    pub last_update: DateTime<Utc>,

    /// Free-form extensions, populated through the projector's
    /// `enrich_state` hook.
    pub metadata: Headers,
}

impl ProjectorState {
    /// Creates a fresh state row stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, checkpoint: i64) -> Self {
        Self {
            id: id.into(),
            checkpoint,
            last_update: Utc::now(),
            metadata: Headers::default(),
        }
    }
}
