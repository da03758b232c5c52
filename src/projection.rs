//! Module `projection` contains the [`Projection`] abstraction, a
//! materialized row keyed by a domain identifier, and the replaceable
//! [`Cache`] used to avoid re-loading projections from the store on every
//! event of a batch.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

/// A Projection is a materialized read model keyed by a domain identifier,
/// kept current by applying registered event handlers.
///
/// New instances are created through [`Default`] when the first creating
/// event for a key arrives; the identity is assigned exactly once through
/// [`Projection::set_key`], before any handler sees the instance.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// The type used to uniquely identify an instance of the Projection.
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// A stable name for the Projection type, used to identify the
    /// projector in errors and as the default state key.
    fn type_name() -> &'static str;

    /// Returns the identity of this instance.
    fn key(&self) -> Self::Key;

    /// Assigns the identity of a freshly created instance. Called exactly
    /// once per instance, before any handler is invoked on it.
    fn set_key(&mut self, key: Self::Key);
}

/// Replaceable per-key memoization of [`Projection`] rows.
///
/// The dispatcher writes through the cache on every create and update, and
/// the batch driver calls [`Cache::clear`] whenever a store transaction is
/// rolled back, so in-memory state can never diverge from the store.
///
/// A cache instance is exclusively owned by a single dispatcher; it is not
/// meant to be shared across concurrently running projectors.
#[async_trait]
pub trait Cache<P>: Send + Sync
where
    P: Projection,
{
    /// Returns the cached value for `key`, or awaits `loader` and memoizes
    /// a successful, non-empty load.
    async fn get_or_load(
        &self,
        key: &P::Key,
        loader: BoxFuture<'_, anyhow::Result<Option<P>>>,
    ) -> anyhow::Result<Option<P>>;

    /// Records the latest value of a projection under its own key.
    fn add(&self, projection: P);

    /// Evicts the entry for `key`, if any.
    fn remove(&self, key: &P::Key);

    /// Evicts all entries. Must be called on any batch abort.
    fn clear(&self);
}

#[async_trait]
impl<P, C> Cache<P> for Arc<C>
where
    P: Projection,
    C: Cache<P> + ?Sized,
{
    async fn get_or_load(
        &self,
        key: &P::Key,
        loader: BoxFuture<'_, anyhow::Result<Option<P>>>,
    ) -> anyhow::Result<Option<P>> {
        C::get_or_load(self, key, loader).await
    }

    fn add(&self, projection: P) {
        C::add(self, projection);
    }

    fn remove(&self, key: &P::Key) {
        C::remove(self, key);
    }

    fn clear(&self) {
        C::clear(self);
    }
}

/// [`Cache`] implementation that never retains anything: every
/// [`get_or_load`](Cache::get_or_load) hits the loader.
///
/// This is the safe default, as there is no state to invalidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl<P> Cache<P> for NoCache
where
    P: Projection,
{
    async fn get_or_load(
        &self,
        _key: &P::Key,
        loader: BoxFuture<'_, anyhow::Result<Option<P>>>,
    ) -> anyhow::Result<Option<P>> {
        loader.await
    }

    fn add(&self, _projection: P) {}

    fn remove(&self, _key: &P::Key) {}

    fn clear(&self) {}
}

/// [`Cache`] implementation backed by a bounded, least-recently-used
/// in-memory map.
pub struct LruCache<P>
where
    P: Projection,
{
    entries: RwLock<lru::LruCache<P::Key, P>>,
}

impl<P> LruCache<P>
where
    P: Projection,
{
    /// Creates a new cache retaining at most `capacity` projections.
    #[must_use]
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(lru::LruCache::new(capacity)),
        }
    }

    /// Returns the number of currently cached projections.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("acquire read lock on projection cache")
            .len()
    }

    /// Returns `true` if the cache holds no projections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<P> Cache<P> for LruCache<P>
where
    P: Projection,
{
    async fn get_or_load(
        &self,
        key: &P::Key,
        loader: BoxFuture<'_, anyhow::Result<Option<P>>>,
    ) -> anyhow::Result<Option<P>> {
        {
            let mut entries = self
                .entries
                .write()
                .expect("acquire write lock on projection cache");

            if let Some(hit) = entries.get(key) {
                return Ok(Some(hit.clone()));
            }
        }

        let loaded = loader.await?;

        if let Some(projection) = &loaded {
            self.entries
                .write()
                .expect("acquire write lock on projection cache")
                .put(key.clone(), projection.clone());
        }

        Ok(loaded)
    }

    fn add(&self, projection: P) {
        self.entries
            .write()
            .expect("acquire write lock on projection cache")
            .put(projection.key(), projection);
    }

    fn remove(&self, key: &P::Key) {
        self.entries
            .write()
            .expect("acquire write lock on projection cache")
            .pop(key);
    }

    fn clear(&self) {
        self.entries
            .write()
            .expect("acquire write lock on projection cache")
            .clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub(crate) struct Row {
        pub(crate) id: String,
        pub(crate) value: u64,
    }

    impl Projection for Row {
        type Key = String;

        fn type_name() -> &'static str {
            "Row"
        }

        fn key(&self) -> Self::Key {
            self.id.clone()
        }

        fn set_key(&mut self, key: Self::Key) {
            self.id = key;
        }
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("capacity should be non-zero")
    }

    #[tokio::test]
    async fn lru_cache_memoizes_successful_loads() {
        let cache = LruCache::<Row>::with_capacity(capacity(4));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let loaded = cache
                .get_or_load(
                    &"row:1".to_owned(),
                    Box::pin(async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(Some(Row {
                            id: "row:1".to_owned(),
                            value: 7,
                        }))
                    }),
                )
                .await
                .expect("load should not fail");

            assert_eq!(Some(7), loaded.map(|row| row.value));
        }

        assert_eq!(1, loads.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lru_cache_does_not_memoize_missing_rows() {
        let cache = LruCache::<Row>::with_capacity(capacity(4));
        let loads = AtomicUsize::new(0);

        for _ in 0..2 {
            let loaded = cache
                .get_or_load(
                    &"row:missing".to_owned(),
                    Box::pin(async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }),
                )
                .await
                .expect("load should not fail");

            assert!(loaded.is_none());
        }

        assert_eq!(2, loads.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lru_cache_evicts_least_recently_used_entry() {
        let cache = LruCache::<Row>::with_capacity(capacity(2));

        cache.add(Row {
            id: "row:1".to_owned(),
            value: 1,
        });
        cache.add(Row {
            id: "row:2".to_owned(),
            value: 2,
        });
        cache.add(Row {
            id: "row:3".to_owned(),
            value: 3,
        });

        assert_eq!(2, cache.len());

        let loads = AtomicUsize::new(0);
        let loaded = cache
            .get_or_load(
                &"row:1".to_owned(),
                Box::pin(async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }),
            )
            .await
            .expect("load should not fail");

        assert!(loaded.is_none());
        assert_eq!(1, loads.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = LruCache::<Row>::with_capacity(capacity(4));

        cache.add(Row {
            id: "row:1".to_owned(),
            value: 1,
        });
        cache.remove(&"row:1".to_owned());
        cache.add(Row {
            id: "row:2".to_owned(),
            value: 2,
        });
        cache.clear();

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn no_cache_always_invokes_the_loader() {
        let cache = NoCache;
        let loads = AtomicUsize::new(0);

        for _ in 0..2 {
            let loaded: Option<Row> = Cache::<Row>::get_or_load(
                &cache,
                &"row:1".to_owned(),
                Box::pin(async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(Row {
                        id: "row:1".to_owned(),
                        value: 7,
                    }))
                }),
            )
            .await
            .expect("load should not fail");

            assert!(loaded.is_some());
        }

        assert_eq!(2, loads.load(Ordering::SeqCst));
    }
}
