//! Module `cancel` contains the cooperative [`CancelToken`] checked by the
//! batch driver between batches and at the top of every transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, clonable cooperative stop flag.
///
/// Cancellation is cooperative: the driver polls the token at batch and
/// transaction boundaries. A cancel observed between batches stops further
/// work silently; a cancel observed inside a batch rolls the open store
/// transaction back and surfaces as
/// [`Error::Canceled`](crate::error::Error::Canceled).
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new, untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation on all clones of this token.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`CancelToken::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}
