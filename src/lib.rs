//! `materially` is a library to materialize relational projections (rows
//! keyed by a domain identifier) from an ordered stream of transactions,
//! while durably tracking how far projection has advanced.
//!
//! ## How it works
//!
//! Events are routed through a declarative [`Map`]: each event kind is
//! registered as creating, updating or deleting the projection row it
//! refers to, or as a custom handler performing its own store work. A
//! [`Dispatcher`] interprets the map against a
//! [store session](crate::store::Session), memoizing rows through a
//! replaceable [`Cache`] and nesting [`ChildProjector`]s that observe
//! every event before their parent.
//!
//! The [`Projector`] drives the whole thing: it groups transactions into
//! batches, projects each batch inside one store transaction, writes its
//! [`ProjectorState`] checkpoint row per the configured
//! [`PersistBehavior`], and consults a [`RetryPolicy`] when a batch
//! fails. The policy may retry the batch, bisect it into
//! single-transaction retries, ignore it, or abort.
//!
//! Delivery is at-least-once with idempotent checkpoint advancement:
//! transactions at or below the persisted checkpoint are skipped on
//! replay.
//!
//! ```text
//! let map = Map::builder()
//!     .map("ProductAdded")
//!     .as_create_of(|e: &CatalogEvent| e.product_id())
//!     .using_sync(|product, e| { product.apply(e); Ok(()) })
//!     .map("ProductDiscontinued")
//!     .as_delete_of(|e| e.product_id())
//!     .build();
//!
//! let projector = Projector::builder(store, Dispatcher::new(map)).build()?;
//! projector.handle(transactions, &CancelToken::new()).await?;
//! ```

pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod map;
pub mod projection;
pub mod projector;
pub mod retry;
pub mod store;
pub mod transaction;

pub use crate::cancel::CancelToken;
pub use crate::dispatch::{Child, ChildProjector, Context, Dispatcher};
pub use crate::error::{ConfigError, Error, ProjectionError};
pub use crate::map::Map;
pub use crate::projection::{Cache, LruCache, NoCache, Projection};
pub use crate::projector::{PersistBehavior, Projector};
pub use crate::retry::{AlwaysAbort, Resolution, RetryPolicy};
pub use crate::store::{ProjectionStore, ProjectorState, Session, SessionFactory};
pub use crate::transaction::{Envelope, Event, Headers, Transaction};
