//! Request-scoped reader handles

use std::sync::Arc;
use tracing::{debug, error};

use crate::broker::{BrokerClient, ReaderHandle};
use crate::Result;

/// Hands out one fresh reader handle per request.
///
/// A broker reader can only consume each topic partition once at a time, so
/// concurrent requests must never share a handle.
#[derive(Clone)]
pub struct ConsumerFactory {
    client: Arc<dyn BrokerClient>,
}

impl ConsumerFactory {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self { client }
    }

    /// Acquire a handle that is released when the returned lease is dropped
    pub async fn acquire(&self) -> Result<ReaderLease> {
        let handle = self.client.acquire_reader().await?;
        debug!(handle = handle.id(), "Acquired reader handle");
        Ok(ReaderLease {
            factory: self.clone(),
            handle: Arc::new(handle),
        })
    }

    /// Return a handle to the broker client
    pub fn release(&self, handle: &ReaderHandle) -> Result<()> {
        self.client.release_reader(handle)
    }
}

/// Scoped ownership of a [`ReaderHandle`].
///
/// Dropping the lease releases the handle, so every exit path of a request
/// (success, error, cancellation or a dropped future) releases exactly once.
pub struct ReaderLease {
    factory: ConsumerFactory,
    handle: Arc<ReaderHandle>,
}

impl ReaderLease {
    /// Shared view of the handle for partition fetchers
    pub fn handle(&self) -> Arc<ReaderHandle> {
        Arc::clone(&self.handle)
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        match self.factory.release(&self.handle) {
            Ok(()) => debug!(handle = self.handle.id(), "Released reader handle"),
            Err(e) => error!(handle = self.handle.id(), error = %e, "Closing reader handle failed"),
        }
    }
}
