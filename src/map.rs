//! Module `map` contains the [`Map`], the immutable routing table from
//! event kind to projection handler, and the fluent [`Builder`] used to
//! declare it.
//!
//! A map routes each event to one of four handler variants: `create`,
//! `update`, `delete`, or `custom`. The first three work against a keyed
//! projection row through the dispatching
//! [`Dispatcher`](crate::dispatch::Dispatcher); a custom handler
//! encapsulates its own store interactions.

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::dispatch::Context;
use crate::projection::Projection;
use crate::transaction::Event;

/// Handler body mutating a projection in response to an event.
pub type ProjectFn<P, E, S> = Box<
    dyn for<'a> Fn(&'a mut P, &'a E, &'a Context<'a, S>) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Handler body performing its own store interactions.
pub type CustomFn<E, S> = Box<
    dyn for<'a> Fn(&'a E, &'a Context<'a, S>) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync,
>;

/// Extracts the projection key an event applies to.
pub type KeyFn<P, E> = Box<dyn Fn(&E) -> <P as Projection>::Key + Send + Sync>;

type OverwriteFn<P, E> = Box<dyn Fn(&P, &E) -> bool + Send + Sync>;
type MissingFn = Box<dyn Fn() -> bool + Send + Sync>;

pub(crate) enum Handler<P, E, S>
where
    P: Projection,
{
    Create {
        key: KeyFn<P, E>,
        should_overwrite: OverwriteFn<P, E>,
        project: ProjectFn<P, E, S>,
    },
    Update {
        key: KeyFn<P, E>,
        create_if_missing: MissingFn,
        project: ProjectFn<P, E, S>,
    },
    Delete {
        key: KeyFn<P, E>,
    },
    Custom {
        run: CustomFn<E, S>,
    },
}

/// Immutable routing table from event kind to handler, built once through
/// [`Map::builder`] and queried per event.
///
/// An event whose kind is not registered is a silent no-op.
pub struct Map<P, E, S>
where
    P: Projection,
{
    handlers: HashMap<&'static str, Handler<P, E, S>>,
}

impl<P, E, S> Map<P, E, S>
where
    P: Projection,
    E: Event,
{
    /// Starts declaring a new [`Map`].
    #[must_use]
    pub fn builder() -> Builder<P, E, S> {
        Builder::default()
    }

    /// Returns `true` if a handler is registered for the given event kind.
    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Returns the number of registered event kinds.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn handler(&self, event: &str) -> Option<&Handler<P, E, S>> {
        self.handlers.get(event)
    }
}

/// Fluent builder for a [`Map`].
///
/// Registering the same event kind twice replaces the earlier handler.
pub struct Builder<P, E, S>
where
    P: Projection,
{
    handlers: HashMap<&'static str, Handler<P, E, S>>,
}

impl<P, E, S> Default for Builder<P, E, S>
where
    P: Projection,
{
    fn default() -> Self {
        Self {
            handlers: HashMap::default(),
        }
    }
}

impl<P, E, S> Builder<P, E, S>
where
    P: Projection,
    E: Event,
{
    /// Starts registering a handler for the given event kind.
    #[must_use]
    pub fn map(self, event: &'static str) -> EventBuilder<P, E, S> {
        EventBuilder {
            event,
            builder: self,
        }
    }

    /// Finalizes the routing table.
    #[must_use]
    pub fn build(self) -> Map<P, E, S> {
        Map {
            handlers: self.handlers,
        }
    }

    fn register(mut self, event: &'static str, handler: Handler<P, E, S>) -> Self {
        self.handlers.insert(event, handler);
        self
    }
}

/// Second stage of the [`Builder`] DSL: choosing the handler variant for
/// one event kind.
pub struct EventBuilder<P, E, S>
where
    P: Projection,
{
    event: &'static str,
    builder: Builder<P, E, S>,
}

impl<P, E, S> EventBuilder<P, E, S>
where
    P: Projection,
    E: Event,
{
    /// Registers the event as creating the projection identified by the
    /// extracted key. By default a duplicate key leaves the existing row
    /// untouched; see [`CreateBuilder`] for the overwrite policies.
    #[must_use]
    pub fn as_create_of<KF>(self, key: KF) -> CreateBuilder<P, E, S>
    where
        KF: Fn(&E) -> P::Key + Send + Sync + 'static,
    {
        CreateBuilder {
            event: self.event,
            key: Box::new(key),
            should_overwrite: Box::new(|_, _| false),
            builder: self.builder,
        }
    }

    /// Registers the event as updating the projection identified by the
    /// extracted key. By default a missing row is left missing; see
    /// [`UpdateBuilder::creating_if_missing`].
    #[must_use]
    pub fn as_update_of<KF>(self, key: KF) -> UpdateBuilder<P, E, S>
    where
        KF: Fn(&E) -> P::Key + Send + Sync + 'static,
    {
        UpdateBuilder {
            event: self.event,
            key: Box::new(key),
            create_if_missing: Box::new(|| false),
            builder: self.builder,
        }
    }

    /// Registers the event as deleting the projection identified by the
    /// extracted key. Deleting a missing row is a no-op.
    #[must_use]
    pub fn as_delete_of<KF>(self, key: KF) -> Builder<P, E, S>
    where
        KF: Fn(&E) -> P::Key + Send + Sync + 'static,
    {
        let event = self.event;

        self.builder
            .register(event, Handler::Delete { key: Box::new(key) })
    }

    /// Registers a custom handler for the event, responsible for its own
    /// store interactions through the
    /// [`Context`](crate::dispatch::Context).
    #[must_use]
    pub fn using_custom(self, run: CustomFn<E, S>) -> Builder<P, E, S> {
        let event = self.event;

        self.builder.register(event, Handler::Custom { run })
    }
}

/// Final stage of the [`Builder`] DSL for `create` handlers.
pub struct CreateBuilder<P, E, S>
where
    P: Projection,
{
    event: &'static str,
    key: KeyFn<P, E>,
    should_overwrite: OverwriteFn<P, E>,
    builder: Builder<P, E, S>,
}

impl<P, E, S> CreateBuilder<P, E, S>
where
    P: Projection,
    E: Event,
{
    /// Leaves an existing row untouched when its key is created again.
    /// This is the default.
    #[must_use]
    pub fn ignoring_duplicates(mut self) -> Self {
        self.should_overwrite = Box::new(|_, _| false);
        self
    }

    /// Projects the event into the existing row when its key is created
    /// again, without re-inserting it or re-assigning its identity.
    #[must_use]
    pub fn overwriting_duplicates(mut self) -> Self {
        self.should_overwrite = Box::new(|_, _| true);
        self
    }

    /// Decides per event whether an existing row should be overwritten.
    #[must_use]
    pub fn handling_duplicates_with<F>(mut self, should_overwrite: F) -> Self
    where
        F: Fn(&P, &E) -> bool + Send + Sync + 'static,
    {
        self.should_overwrite = Box::new(should_overwrite);
        self
    }

    /// Supplies the handler body and registers the handler.
    #[must_use]
    pub fn using(self, project: ProjectFn<P, E, S>) -> Builder<P, E, S> {
        let event = self.event;

        self.builder.register(
            event,
            Handler::Create {
                key: self.key,
                should_overwrite: self.should_overwrite,
                project,
            },
        )
    }

    /// Supplies a synchronous handler body and registers the handler.
    #[must_use]
    pub fn using_sync<F>(self, project: F) -> Builder<P, E, S>
    where
        F: Fn(&mut P, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.using(Box::new(move |projection, event, _context| {
            let result = project(projection, event);
            Box::pin(async move { result })
        }))
    }
}

/// Final stage of the [`Builder`] DSL for `update` handlers.
pub struct UpdateBuilder<P, E, S>
where
    P: Projection,
{
    event: &'static str,
    key: KeyFn<P, E>,
    create_if_missing: MissingFn,
    builder: Builder<P, E, S>,
}

impl<P, E, S> UpdateBuilder<P, E, S>
where
    P: Projection,
    E: Event,
{
    /// Creates the row (identity assigned first) when the key is
    /// missing, instead of skipping the event.
    #[must_use]
    pub fn creating_if_missing(mut self) -> Self {
        self.create_if_missing = Box::new(|| true);
        self
    }

    /// Decides per occurrence whether a missing row should be created.
    #[must_use]
    pub fn creating_if_missing_when<F>(mut self, create_if_missing: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.create_if_missing = Box::new(create_if_missing);
        self
    }

    /// Supplies the handler body and registers the handler.
    #[must_use]
    pub fn using(self, project: ProjectFn<P, E, S>) -> Builder<P, E, S> {
        let event = self.event;

        self.builder.register(
            event,
            Handler::Update {
                key: self.key,
                create_if_missing: self.create_if_missing,
                project,
            },
        )
    }

    /// Supplies a synchronous handler body and registers the handler.
    #[must_use]
    pub fn using_sync<F>(self, project: F) -> Builder<P, E, S>
    where
        F: Fn(&mut P, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.using(Box::new(move |projection, event, _context| {
            let result = project(projection, event);
            Box::pin(async move { result })
        }))
    }
}
