//! Execution contexts for blocking work.
//!
//! Providers, sync processors and key derivation block. Async callers hand
//! them to [`Dispatchers`], which runs them on tokio's blocking pool with a
//! separate concurrency limit per context.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

pub const DEFAULT_IO_PERMITS: usize = 4;
pub const DEFAULT_CPU_PERMITS: usize = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Execution context is shut down")]
    Closed,

    #[error("Task was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Dispatchers {
    io: Arc<Semaphore>,
    cpu: Arc<Semaphore>,
}

impl Default for Dispatchers {
    fn default() -> Self {
        Self::new(DEFAULT_IO_PERMITS, DEFAULT_CPU_PERMITS)
    }
}

impl Dispatchers {
    pub fn new(io_permits: usize, cpu_permits: usize) -> Self {
        Self {
            io: Arc::new(Semaphore::new(io_permits.max(1))),
            cpu: Arc::new(Semaphore::new(cpu_permits.max(1))),
        }
    }

    /// Run network or file work
    pub async fn io<F, T>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(&self.io, f).await
    }

    /// Run CPU-bound work such as key derivation
    pub async fn cpu<F, T>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(&self.cpu, f).await
    }

    pub fn shutdown(&self) {
        self.io.close();
        self.cpu.close();
    }
}

async fn run_blocking<F, T>(semaphore: &Arc<Semaphore>, f: F) -> Result<T, DispatchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let permit = Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|_| DispatchError::Closed)?;

    let handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        f()
    });

    match handle.await {
        Ok(value) => Ok(value),
        // Contract violations must reach the caller as panics
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(DispatchError::Cancelled),
    }
}
