//! Async, serialized access to a [`DataAccessHelper`].
//!
//! Every operation runs on the tokio blocking pool while holding a single
//! lock, so concurrent tasks never bootstrap or clear the same file at once.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::BootstrapResult;
use crate::helper::{BootstrapOutcome, DataAccessHelper};
use crate::sqlite::{ClearSummary, DatabaseEngine, DatabaseHandle, SqliteEngine};

pub struct SharedDataAccessHelper<E = SqliteEngine> {
    inner: Arc<DataAccessHelper<E>>,
    lock: Arc<Mutex<()>>,
}

// Manual impl so `E` need not be `Clone`.
impl<E> Clone for SharedDataAccessHelper<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<E> SharedDataAccessHelper<E>
where
    E: DatabaseEngine + Send + Sync + 'static,
{
    pub fn new(helper: DataAccessHelper<E>) -> Self {
        Self {
            inner: Arc::new(helper),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The wrapped helper, for path accessors. Calling its operations directly
    /// bypasses the lock.
    pub fn helper(&self) -> &DataAccessHelper<E> {
        &self.inner
    }

    pub async fn create_and_validate_database(&self) -> BootstrapResult<BootstrapOutcome> {
        self.run(|helper| helper.try_create_and_validate_database())
            .await
    }

    pub async fn delete_all_data(&self) -> BootstrapResult<ClearSummary> {
        self.run(|helper| helper.delete_all_data()).await
    }

    /// Open a handle, run `f` against it, and close it, all under the lock.
    pub async fn with_database<F, T>(&self, f: F) -> BootstrapResult<T>
    where
        F: FnOnce(&mut E::Handle) -> BootstrapResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |helper| {
            let mut handle = helper.open_application_database()?;
            let out = f(&mut handle)?;
            handle.close()?;
            Ok(out)
        })
        .await
    }

    async fn run<F, T>(&self, f: F) -> BootstrapResult<T>
    where
        F: FnOnce(&DataAccessHelper<E>) -> BootstrapResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            // The lock guards no data, so a panicked holder leaves nothing to repair.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f(&inner)
        })
        .await?
    }
}
