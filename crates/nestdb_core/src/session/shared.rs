//! A session shared between threads.

use super::Session;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::sync::Arc;

/// A [`Session`] behind a mutex.
///
/// Every call holds the lock for its whole duration, so operations from
/// different threads never interleave inside one transaction step.
#[derive(Debug, Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
}

impl SharedSession {
    /// Wraps a session.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Runs `f` with exclusive access to the session.
    pub fn with<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut session = self.inner.lock();
        f(&mut session)
    }

    /// Runs `f` inside a transaction while holding the lock.
    ///
    /// See [`Session::with_transaction`].
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Session) -> CoreResult<T>) -> CoreResult<T> {
        self.inner.lock().with_transaction(f)
    }
}

impl From<Session> for SharedSession {
    fn from(session: Session) -> Self {
        Self::new(session)
    }
}
