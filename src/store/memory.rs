//! Contains an in-memory implementation of the [`Session`] and
//! [`ProjectionStore`] contracts, backed by a thread-safe map shared by all
//! sessions of an [`InMemoryStore`].
//!
//! Every session stages its changes privately and applies them to the
//! shared backend atomically at commit, so a rollback is a no-op on the
//! backend. The store also records every committed operation, which is
//! useful in tests to assert what a projector actually wrote.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::projection::Projection;
use crate::store::{ProjectionStore, ProjectorState, Session, SessionFactory};

/// List of possible errors returned by an [`InMemorySession`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Returned by mutating operations and [`Session::commit`] when
    /// [`Session::begin`] has not been called on the session.
    #[error("no store transaction is active on this session")]
    NoActiveTransaction,

    /// Returned by [`Session::begin`] when the session already has an
    /// open transaction.
    #[error("a store transaction is already active on this session")]
    TransactionAlreadyActive,
}

/// A single operation committed through an [`InMemorySession`], recorded
/// by the backend in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A new projection row was inserted.
    Insert {
        /// Type name of the projection.
        projection: &'static str,
        /// Debug rendering of the row key.
        key: String,
    },

    /// An existing projection row was updated.
    Update {
        /// Type name of the projection.
        projection: &'static str,
        /// Debug rendering of the row key.
        key: String,
    },

    /// A projection row was deleted.
    Delete {
        /// Type name of the projection.
        projection: &'static str,
        /// Debug rendering of the row key.
        key: String,
    },

    /// A checkpoint row was written.
    SaveState {
        /// The state key the row is stored under.
        id: String,
        /// The checkpoint recorded in the row.
        checkpoint: i64,
    },
}

type Table = Box<dyn Any + Send + Sync>;

#[derive(Default)]
struct Backend {
    tables: HashMap<TypeId, Table>,
    states: HashMap<String, ProjectorState>,
    operations: Vec<Operation>,
}

impl Backend {
    fn table<P>(&self) -> Option<&HashMap<P::Key, P>>
    where
        P: Projection,
    {
        self.tables
            .get(&TypeId::of::<P>())
            .and_then(|table| table.downcast_ref())
    }

    fn table_mut<P>(&mut self) -> &mut HashMap<P::Key, P>
    where
        P: Projection,
    {
        self.tables
            .entry(TypeId::of::<P>())
            .or_insert_with(|| Box::<HashMap<P::Key, P>>::default())
            .downcast_mut()
            .expect("projection table should have the registered row type")
    }
}

type ApplyFn = Box<dyn FnOnce(&mut Backend) + Send>;

#[derive(Default)]
struct Staged {
    in_transaction: bool,
    // Read-your-writes view of this session's pending changes: a key maps
    // to the staged row, or to None once staged for deletion.
    overlay: HashMap<TypeId, Table>,
    state: Option<ProjectorState>,
    apply: Vec<ApplyFn>,
    operations: Vec<Operation>,
}

impl Staged {
    fn slots<P>(&self) -> Option<&HashMap<P::Key, Option<P>>>
    where
        P: Projection,
    {
        self.overlay
            .get(&TypeId::of::<P>())
            .and_then(|slots| slots.downcast_ref())
    }

    fn slots_mut<P>(&mut self) -> &mut HashMap<P::Key, Option<P>>
    where
        P: Projection,
    {
        self.overlay
            .entry(TypeId::of::<P>())
            .or_insert_with(|| Box::<HashMap<P::Key, Option<P>>>::default())
            .downcast_mut()
            .expect("staged projection slots should have the registered row type")
    }
}

/// In-memory [`SessionFactory`], sharing one backend across all the
/// sessions it opens.
///
/// Clones share the same backend, so a test can keep a clone around to
/// inspect the rows and [`Operation`]s a projector committed.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    backend: Arc<RwLock<Backend>>,
}

impl InMemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed projection stored under `key`, if any.
    pub fn projection<P>(&self, key: &P::Key) -> Option<P>
    where
        P: Projection,
    {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on store backend");

        backend.table::<P>().and_then(|table| table.get(key)).cloned()
    }

    /// Returns all committed projections of type `P`, in no particular
    /// order.
    pub fn projections<P>(&self) -> Vec<P>
    where
        P: Projection,
    {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on store backend");

        backend
            .table::<P>()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the committed checkpoint row stored under `id`, if any.
    pub fn state(&self, id: &str) -> Option<ProjectorState> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on store backend");

        backend.states.get(id).cloned()
    }

    /// Returns the list of operations committed through this store so far,
    /// in commit order.
    pub fn recorded_operations(&self) -> Vec<Operation> {
        self.backend
            .read()
            .expect("acquire read lock on store backend")
            .operations
            .clone()
    }
}

#[async_trait]
impl SessionFactory for InMemoryStore {
    type Session = InMemorySession;

    async fn open_session(&self) -> Result<Self::Session, Error> {
        Ok(InMemorySession {
            backend: self.backend.clone(),
            staged: Mutex::default(),
        })
    }
}

/// In-memory [`Session`], produced by [`InMemoryStore::open_session`].
pub struct InMemorySession {
    backend: Arc<RwLock<Backend>>,
    staged: Mutex<Staged>,
}

impl InMemorySession {
    fn staged(&self) -> std::sync::MutexGuard<'_, Staged> {
        self.staged
            .lock()
            .expect("acquire lock on session staged changes")
    }
}

#[async_trait]
impl Session for InMemorySession {
    type Error = Error;

    async fn begin(&self) -> Result<(), Self::Error> {
        let mut staged = self.staged();

        if staged.in_transaction {
            return Err(Error::TransactionAlreadyActive);
        }

        staged.in_transaction = true;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Self::Error> {
        // Staged changes are already visible to this session; a persistent
        // backend would push its pending statements here.
        Ok(())
    }

    async fn commit(&self) -> Result<(), Self::Error> {
        let staged = {
            let mut staged = self.staged();

            if !staged.in_transaction {
                return Err(Error::NoActiveTransaction);
            }

            std::mem::take(&mut *staged)
        };

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on store backend");

        for apply in staged.apply {
            apply(&mut backend);
        }

        backend.operations.extend(staged.operations);

        Ok(())
    }

    async fn rollback(&self) -> Result<(), Self::Error> {
        let mut staged = self.staged();
        *staged = Staged::default();
        Ok(())
    }

    async fn find_state(&self, id: &str) -> Result<Option<ProjectorState>, Self::Error> {
        {
            let staged = self.staged();

            if let Some(state) = &staged.state {
                if state.id == id {
                    return Ok(Some(state.clone()));
                }
            }
        }

        let backend = self
            .backend
            .read()
            .expect("acquire read lock on store backend");

        Ok(backend.states.get(id).cloned())
    }

    async fn save_state(&self, state: ProjectorState) -> Result<(), Self::Error> {
        let mut staged = self.staged();

        if !staged.in_transaction {
            return Err(Error::NoActiveTransaction);
        }

        staged.operations.push(Operation::SaveState {
            id: state.id.clone(),
            checkpoint: state.checkpoint,
        });

        staged.state = Some(state.clone());
        staged.apply.push(Box::new(move |backend| {
            backend.states.insert(state.id.clone(), state);
        }));

        Ok(())
    }
}

#[async_trait]
impl<P> ProjectionStore<P> for InMemorySession
where
    P: Projection,
{
    async fn load(&self, key: &P::Key) -> Result<Option<P>, Self::Error> {
        {
            let staged = self.staged();

            if let Some(slots) = staged.slots::<P>() {
                if let Some(slot) = slots.get(key) {
                    return Ok(slot.clone());
                }
            }
        }

        let backend = self
            .backend
            .read()
            .expect("acquire read lock on store backend");

        Ok(backend.table::<P>().and_then(|table| table.get(key)).cloned())
    }

    async fn insert(&self, projection: P) -> Result<(), Self::Error> {
        let mut staged = self.staged();

        if !staged.in_transaction {
            return Err(Error::NoActiveTransaction);
        }

        let key = projection.key();

        staged.operations.push(Operation::Insert {
            projection: P::type_name(),
            key: format!("{key:?}"),
        });

        staged.slots_mut::<P>().insert(key.clone(), Some(projection.clone()));
        staged.apply.push(Box::new(move |backend| {
            backend.table_mut::<P>().insert(key, projection);
        }));

        Ok(())
    }

    async fn update(&self, projection: P) -> Result<(), Self::Error> {
        let mut staged = self.staged();

        if !staged.in_transaction {
            return Err(Error::NoActiveTransaction);
        }

        let key = projection.key();

        staged.operations.push(Operation::Update {
            projection: P::type_name(),
            key: format!("{key:?}"),
        });

        staged.slots_mut::<P>().insert(key.clone(), Some(projection.clone()));
        staged.apply.push(Box::new(move |backend| {
            backend.table_mut::<P>().insert(key, projection);
        }));

        Ok(())
    }

    async fn delete(&self, projection: &P) -> Result<(), Self::Error> {
        let mut staged = self.staged();

        if !staged.in_transaction {
            return Err(Error::NoActiveTransaction);
        }

        let key = projection.key();

        staged.operations.push(Operation::Delete {
            projection: P::type_name(),
            key: format!("{key:?}"),
        });

        staged.slots_mut::<P>().insert(key.clone(), None);
        staged.apply.push(Box::new(move |backend| {
            backend.table_mut::<P>().remove(&key);
        }));

        Ok(())
    }
}
