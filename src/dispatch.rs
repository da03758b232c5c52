//! Module `dispatch` contains the per-event machinery: the [`Context`]
//! handed to every handler, the [`Dispatcher`] interpreting a
//! [`Map`](crate::map::Map) against a keyed projection, and the
//! [`ChildProjector`] adapter that lets a dispatcher nest inside another
//! one.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProjectionError;
use crate::map::{Handler, KeyFn, Map, ProjectFn};
use crate::projection::{Cache, NoCache, Projection};
use crate::store::ProjectionStore;
use crate::transaction::{Envelope, Event, Headers, Transaction};

/// The context a handler runs in: the coordinates of the transaction and
/// event under way, plus a borrow of the open store session.
///
/// A fresh context is built per event, but the handled flag it writes to is
/// sticky for the enclosing transaction: once set, no later event can reset
/// it.
pub struct Context<'a, S> {
    /// Identifier of the transaction under way.
    pub transaction_id: &'a str,

    /// Identifier of the stream the transaction belongs to.
    pub stream_id: &'a str,

    /// Checkpoint of the transaction under way.
    pub checkpoint: i64,

    /// Timestamp of the transaction under way.
    pub timestamp: DateTime<Utc>,

    /// Headers of the transaction under way.
    pub transaction_headers: &'a Headers,

    /// Headers of the event under way.
    pub event_headers: &'a Headers,

    /// The store session owning the open transaction. Valid only for the
    /// enclosing batch.
    pub session: &'a S,

    handled: &'a AtomicBool,
}

impl<'a, S> Context<'a, S> {
    pub(crate) fn for_event<E>(
        transaction: &'a Transaction<E>,
        event: &'a Envelope<E>,
        session: &'a S,
        handled: &'a AtomicBool,
    ) -> Self
    where
        E: Event,
    {
        Self {
            transaction_id: &transaction.id,
            stream_id: &transaction.stream_id,
            checkpoint: transaction.checkpoint,
            timestamp: transaction.timestamp,
            transaction_headers: &transaction.headers,
            event_headers: &event.headers,
            session,
            handled,
        }
    }

    /// Marks the enclosing transaction as handled. Sticky: once set, it
    /// stays set for the rest of the transaction.
    pub fn mark_handled(&self) {
        self.handled.fetch_or(true, Ordering::SeqCst);
    }

    /// Returns `true` once any event of the enclosing transaction matched
    /// a registered handler.
    pub fn was_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

/// Applies a [`Map`](crate::map::Map) to the events of a transaction
/// stream, against projections of type `P` stored through sessions of
/// type `S`.
///
/// The dispatcher owns the projection [`Cache`], an optional filter
/// predicate consulted before updates, and an ordered list of
/// [`Child`] projectors that observe every event before the dispatcher's
/// own map runs.
pub struct Dispatcher<P, E, S>
where
    P: Projection,
    E: Event,
{
    map: Map<P, E, S>,
    children: Vec<Box<dyn Child<E, S>>>,
    cache: Box<dyn Cache<P>>,
    filter: Box<dyn Fn(&P) -> bool + Send + Sync>,
}

impl<P, E, S> Dispatcher<P, E, S>
where
    P: Projection,
    E: Event,
    S: ProjectionStore<P> + 'static,
{
    /// Creates a dispatcher for the given routing table, with no caching,
    /// an accept-all filter and no children.
    #[must_use]
    pub fn new(map: Map<P, E, S>) -> Self {
        Self {
            map,
            children: Vec::default(),
            cache: Box::new(NoCache),
            filter: Box::new(|_| true),
        }
    }

    /// Replaces the projection cache.
    #[must_use]
    pub fn with_cache(mut self, cache: impl Cache<P> + 'static) -> Self {
        self.cache = Box::new(cache);
        self
    }

    /// Replaces the filter predicate consulted before an existing row
    /// is updated.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.filter = Box::new(filter);
        self
    }

    /// Appends a child projector. Children observe every event before
    /// this dispatcher's own map, in the order they were appended.
    #[must_use]
    pub fn with_child(mut self, child: impl Child<E, S> + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    /// Returns the identity of this dispatcher, used to tag failures.
    #[must_use]
    pub fn name(&self) -> &'static str {
        P::type_name()
    }

    pub(crate) fn clear_cache(&self) {
        self.cache.clear();

        for child in &self.children {
            child.clear_cache();
        }
    }

    /// Projects a single event: children first, in declared order, then
    /// this dispatcher's own map. The context is marked handled iff the
    /// event kind is registered in the map.
    ///
    /// A child failure propagates without invoking this dispatcher's own
    /// handler for the event.
    pub async fn project_event(
        &self,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> Result<(), ProjectionError<E>> {
        for child in &self.children {
            child.project_event(event, ctx).await?;
        }

        let Some(handler) = self.map.handler(event.body.name()) else {
            return Ok(());
        };

        let outcome = match handler {
            Handler::Create {
                key,
                should_overwrite,
                project,
            } => self.on_create(key, should_overwrite, project, event, ctx).await,
            Handler::Update {
                key,
                create_if_missing,
                project,
            } => {
                self.on_update(key, create_if_missing, project, event, ctx)
                    .await
            }
            Handler::Delete { key } => self.on_delete(key, event, ctx).await.map(|deleted| {
                if !deleted {
                    tracing::trace!(
                        event = event.body.name(),
                        "no projection found for delete event"
                    );
                }
            }),
            Handler::Custom { run } => run(&event.body, ctx).await,
        };

        outcome.map_err(|cause| {
            ProjectionError::event(
                P::type_name(),
                ctx.transaction_id,
                event.body.name(),
                cause,
            )
        })?;

        ctx.mark_handled();

        Ok(())
    }

    async fn on_create(
        &self,
        key: &KeyFn<P, E>,
        should_overwrite: &(dyn Fn(&P, &E) -> bool + Send + Sync),
        project: &ProjectFn<P, E, S>,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<()> {
        let key = key(&event.body);

        match self.load_or_cache(&key, ctx).await? {
            None => self.create(key, &event.body, project, ctx).await,
            Some(mut existing) => {
                if should_overwrite(&existing, &event.body) {
                    self.overwrite(&mut existing, &event.body, project, ctx)
                        .await?;
                }

                Ok(())
            }
        }
    }

    async fn on_update(
        &self,
        key: &KeyFn<P, E>,
        create_if_missing: &(dyn Fn() -> bool + Send + Sync),
        project: &ProjectFn<P, E, S>,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<()> {
        let key = key(&event.body);

        match self.load_or_cache(&key, ctx).await? {
            None if create_if_missing() => self.create(key, &event.body, project, ctx).await,
            Some(mut existing) if (self.filter)(&existing) => {
                self.overwrite(&mut existing, &event.body, project, ctx)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn on_delete(
        &self,
        key: &KeyFn<P, E>,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<bool> {
        let key = key(&event.body);

        match self.load_or_cache(&key, ctx).await? {
            None => Ok(false),
            Some(existing) => {
                <S as ProjectionStore<P>>::delete(ctx.session, &existing)
                    .await
                    .map_err(anyhow::Error::new)?;
                self.cache.remove(&key);

                Ok(true)
            }
        }
    }

    async fn load_or_cache(
        &self,
        key: &P::Key,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<Option<P>> {
        let session = ctx.session;
        let lookup = key.clone();

        self.cache
            .get_or_load(
                key,
                Box::pin(async move {
                    <S as ProjectionStore<P>>::load(session, &lookup)
                        .await
                        .map_err(anyhow::Error::new)
                }),
            )
            .await
    }

    // Create path: the identity is assigned exactly once, before the
    // handler sees the new instance.
    async fn create(
        &self,
        key: P::Key,
        event: &E,
        project: &ProjectFn<P, E, S>,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<()> {
        let mut projection = P::default();
        projection.set_key(key);

        project(&mut projection, event, ctx).await?;

        <S as ProjectionStore<P>>::insert(ctx.session, projection.clone())
            .await
            .map_err(anyhow::Error::new)?;
        self.cache.add(projection);

        Ok(())
    }

    // Mutation path for rows that already exist: the session is told the
    // instance is a known, clean entity before the handler mutates it.
    async fn overwrite(
        &self,
        existing: &mut P,
        event: &E,
        project: &ProjectFn<P, E, S>,
        ctx: &Context<'_, S>,
    ) -> anyhow::Result<()> {
        <S as ProjectionStore<P>>::reattach(ctx.session, existing)
            .await
            .map_err(anyhow::Error::new)?;

        project(existing, event, ctx).await?;

        <S as ProjectionStore<P>>::update(ctx.session, existing.clone())
            .await
            .map_err(anyhow::Error::new)?;
        self.cache.add(existing.clone());

        Ok(())
    }
}

/// A projector nested inside a parent [`Dispatcher`]: it observes every
/// event before the parent's own map, within the same store transaction.
#[async_trait]
pub trait Child<E, S>: Send + Sync
where
    E: Event,
{
    /// Returns the identity of this child, used to tag failures.
    fn name(&self) -> &'static str;

    /// Evicts all cached projections of this child and its own children.
    fn clear_cache(&self);

    /// Projects a single event through this child.
    async fn project_event(
        &self,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> Result<(), ProjectionError<E>>;
}

/// Adapter wrapping a [`Dispatcher`] so it can nest inside a parent, and
/// tagging every escaping failure with the child's identity.
pub struct ChildProjector<P, E, S>
where
    P: Projection,
    E: Event,
{
    inner: Dispatcher<P, E, S>,
}

impl<P, E, S> From<Dispatcher<P, E, S>> for ChildProjector<P, E, S>
where
    P: Projection,
    E: Event,
{
    fn from(inner: Dispatcher<P, E, S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P, E, S> Child<E, S> for ChildProjector<P, E, S>
where
    P: Projection,
    E: Event,
    S: ProjectionStore<P> + 'static,
{
    fn name(&self) -> &'static str {
        P::type_name()
    }

    fn clear_cache(&self) {
        self.inner.clear_cache();
    }

    async fn project_event(
        &self,
        event: &Envelope<E>,
        ctx: &Context<'_, S>,
    ) -> Result<(), ProjectionError<E>> {
        self.inner
            .project_event(event, ctx)
            .await
            .map_err(|error| error.with_child(P::type_name()))
    }
}
