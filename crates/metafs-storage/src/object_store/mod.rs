//! Object-store client abstraction for the checkpoint container
//!
//! Provides the container/object interface the checkpoint engine is written
//! against, with two backends:
//! - Local filesystem (development and testing)
//! - In-memory mock with failure injection (testing)
//!
//! A production deployment supplies its own implementation speaking the
//! proxy's HTTP API; the engine only ever sees this trait.

mod local;
mod mock;

pub use local::LocalObjectClient;
pub use mock::{CallHistoryEntry, MockFailure, MockObjectClient};

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use metafs_core::Result;

/// Container, account and object headers as delivered by the back-end.
pub type Headers = HashMap<String, String>;

/// Object-store client consumed by the checkpoint engine.
///
/// All implementations must be thread-safe (Send + Sync). Accounts,
/// containers and object names are UTF-8 strings treated as opaque
/// identifiers; checkpoint objects are named by hex-printed nonces.
///
/// # Error Handling
///
/// - `Error::NotFound` - container or object does not exist
/// - `Error::Storage` - backend-specific error (network, permissions, etc.)
/// - `Error::IoError` - I/O error (local filesystem only)
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch a container's headers without listing its contents.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the container does not exist
    async fn container_head(&self, account: &str, container: &str) -> Result<Headers>;

    /// Create a container carrying the given headers.
    async fn container_put(&self, account: &str, container: &str, headers: Headers) -> Result<()>;

    /// Merge headers into an existing container.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the container does not exist
    async fn container_post(&self, account: &str, container: &str, headers: Headers)
        -> Result<()>;

    /// Merge headers into an account, creating it if necessary.
    async fn account_post(&self, account: &str, headers: Headers) -> Result<()>;

    /// Fetch the last `length` bytes of the named object.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the object does not exist
    /// - `Error::Storage` if the object is shorter than `length`
    async fn object_tail(
        &self,
        account: &str,
        container: &str,
        name: &str,
        length: u64,
    ) -> Result<Bytes>;

    /// Fetch `length` bytes of the named object starting at `offset`.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the object does not exist
    /// - `Error::Storage` if the range falls outside the object
    async fn object_get_range(
        &self,
        account: &str,
        container: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;

    /// Delete an object (idempotent).
    ///
    /// The engine issues these from detached tasks during checkpoint
    /// garbage collection; a missing object is a no-op.
    async fn object_delete(&self, account: &str, container: &str, name: &str) -> Result<()>;

    /// Start a chunked PUT of the named object.
    ///
    /// The object becomes visible only once the returned context is
    /// closed; chunks sent before then are not readable.
    async fn object_chunked_put(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Box<dyn ChunkedPutContext>>;
}

/// In-flight chunked PUT of a single object.
#[async_trait]
pub trait ChunkedPutContext: Send {
    /// Append one chunk to the object.
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Running byte count of everything sent so far.
    fn bytes_put(&self) -> u64;

    /// Finalize the object, making it visible to readers.
    async fn close(self: Box<Self>) -> Result<()>;
}
