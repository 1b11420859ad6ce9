//! Browser session pool
//!
//! At most `size` sessions exist at once. A fetch holds its session through
//! a `PooledSession` guard, which hands the session back to the pool when
//! dropped, whatever path the fetch exits through.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{BrowserBackend, BrowserSession, FetchError};

type IdleSessions = Arc<Mutex<Vec<Box<dyn BrowserSession>>>>;

/// Pool of reusable browser sessions
pub struct SessionPool {
    backend: Arc<dyn BrowserBackend>,
    idle: IdleSessions,
    permits: Arc<Semaphore>,
    size: usize,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn BrowserBackend>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            backend,
            idle: Arc::new(Mutex::new(Vec::with_capacity(size))),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot, then reuse an idle session or open a new one
    pub async fn acquire(&self) -> Result<PooledSession, FetchError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::PoolClosed)?;

        let reused = lock(&self.idle).pop();
        let session = match reused {
            Some(session) => session,
            None => {
                debug!(backend = self.backend.name(), "Opening browser session");
                self.backend.open_session().await?
            }
        };

        Ok(PooledSession {
            session: Some(session),
            idle: Arc::clone(&self.idle),
            discard: false,
            _permit: permit,
        })
    }

    /// Stop handing out sessions; waiting acquirers fail with `PoolClosed`
    pub fn close(&self) {
        self.permits.close();
        lock(&self.idle).clear();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions currently parked in the pool
    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Slots not held by an in-flight fetch
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

fn lock(idle: &Mutex<Vec<Box<dyn BrowserSession>>>) -> MutexGuard<'_, Vec<Box<dyn BrowserSession>>> {
    idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive handle on a pooled session
pub struct PooledSession {
    session: Option<Box<dyn BrowserSession>>,
    idle: IdleSessions,
    discard: bool,
    // Released after `drop` has returned the session
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// Close the session instead of returning it to the pool
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledSession {
    type Target = dyn BrowserSession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session is only taken in drop"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("session is only taken in drop"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if !self.discard {
                lock(&self.idle).push(session);
            }
        }
    }
}
