//! In-memory object-store mock for testing
//!
//! Simulates the container/object back-end with deterministic failure
//! injection and call-history tracking, so engine tests can assert on
//! exactly which operations were issued (header POSTs, GC deletes) and
//! how the engine reacts when the back-end misbehaves.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{ChunkedPutContext, Headers, ObjectClient};
use metafs_core::{Error, Result};

/// Scripted outcome for the next back-end call.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Back-end error with the given message.
    Storage(&'static str),

    /// Success (no error).
    Ok,
}

impl MockFailure {
    fn to_error(&self) -> Option<Error> {
        match self {
            MockFailure::Storage(msg) => Some(Error::Storage((*msg).to_string())),
            MockFailure::Ok => None,
        }
    }
}

/// One recorded back-end call.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    /// Operation name: "container_head", "container_put", "container_post",
    /// "account_post", "object_tail", "object_get_range", "object_delete",
    /// "chunked_put_close".
    pub operation: &'static str,

    /// Container or object the call targeted.
    pub target: String,

    /// Whether the operation succeeded.
    pub success: bool,
}

#[derive(Default)]
struct MockContainer {
    headers: Headers,
    objects: HashMap<String, Bytes>,
}

#[derive(Default)]
struct MockAccount {
    headers: Headers,
    containers: HashMap<String, MockContainer>,
}

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, MockAccount>,
}

/// In-memory mock of the object-store client.
pub struct MockObjectClient {
    state: Arc<RwLock<MockState>>,
    failure_queue: Arc<RwLock<VecDeque<MockFailure>>>,
    call_history: Arc<RwLock<Vec<CallHistoryEntry>>>,
}

impl Default for MockObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockObjectClient {
    /// Create a mock with no scripted failures.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            failure_queue: Arc::new(RwLock::new(VecDeque::new())),
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a mock with a deterministic failure pattern.
    ///
    /// Outcomes are consumed in order, one per back-end call. Once the
    /// queue is empty, all operations succeed.
    pub fn with_failures(pattern: Vec<MockFailure>) -> Self {
        let mock = Self::new();
        *mock.failure_queue.write() = pattern.into();
        mock
    }

    /// Snapshot of every call made so far.
    pub fn call_history(&self) -> Vec<CallHistoryEntry> {
        self.call_history.read().clone()
    }

    /// Number of successful calls of the given operation.
    pub fn calls(&self, operation: &str) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|e| e.operation == operation && e.success)
            .count()
    }

    /// Names of all objects deleted so far, in order.
    pub fn deleted_objects(&self) -> Vec<String> {
        self.call_history
            .read()
            .iter()
            .filter(|e| e.operation == "object_delete" && e.success)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Current contents of an object, if present.
    pub fn object(&self, account: &str, container: &str, name: &str) -> Option<Bytes> {
        self.state
            .read()
            .accounts
            .get(account)?
            .containers
            .get(container)?
            .objects
            .get(name)
            .cloned()
    }

    /// Current headers of a container, if present.
    pub fn container_headers(&self, account: &str, container: &str) -> Option<Headers> {
        self.state
            .read()
            .accounts
            .get(account)?
            .containers
            .get(container)
            .map(|c| c.headers.clone())
    }

    /// Current headers of an account, if present.
    pub fn account_headers(&self, account: &str) -> Option<Headers> {
        self.state
            .read()
            .accounts
            .get(account)
            .map(|a| a.headers.clone())
    }

    fn next_failure(&self) -> Option<Error> {
        self.failure_queue
            .write()
            .pop_front()
            .and_then(|f| f.to_error())
    }

    fn record(&self, operation: &'static str, target: impl Into<String>, success: bool) {
        self.call_history.write().push(CallHistoryEntry {
            operation,
            target: target.into(),
            success,
        });
    }

    fn check(&self, operation: &'static str, target: &str) -> Result<()> {
        if let Some(err) = self.next_failure() {
            self.record(operation, target, false);
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectClient for MockObjectClient {
    async fn container_head(&self, account: &str, container: &str) -> Result<Headers> {
        self.check("container_head", container)?;
        let state = self.state.read();
        let result = state
            .accounts
            .get(account)
            .and_then(|a| a.containers.get(container))
            .map(|c| c.headers.clone())
            .ok_or_else(|| Error::not_found("container", container));
        drop(state);
        self.record("container_head", container, result.is_ok());
        result
    }

    async fn container_put(&self, account: &str, container: &str, headers: Headers) -> Result<()> {
        self.check("container_put", container)?;
        let mut state = self.state.write();
        let account = state.accounts.entry(account.to_string()).or_default();
        account
            .containers
            .insert(container.to_string(), MockContainer {
                headers,
                objects: HashMap::new(),
            });
        drop(state);
        self.record("container_put", container, true);
        Ok(())
    }

    async fn container_post(
        &self,
        account: &str,
        container: &str,
        headers: Headers,
    ) -> Result<()> {
        self.check("container_post", container)?;
        let mut state = self.state.write();
        let result = state
            .accounts
            .get_mut(account)
            .and_then(|a| a.containers.get_mut(container))
            .map(|c| c.headers.extend(headers))
            .ok_or_else(|| Error::not_found("container", container));
        drop(state);
        self.record("container_post", container, result.is_ok());
        result
    }

    async fn account_post(&self, account: &str, headers: Headers) -> Result<()> {
        self.check("account_post", account)?;
        let mut state = self.state.write();
        state
            .accounts
            .entry(account.to_string())
            .or_default()
            .headers
            .extend(headers);
        drop(state);
        self.record("account_post", account, true);
        Ok(())
    }

    async fn object_tail(
        &self,
        account: &str,
        container: &str,
        name: &str,
        length: u64,
    ) -> Result<Bytes> {
        self.check("object_tail", name)?;
        let result = (|| {
            let data = self
                .object(account, container, name)
                .ok_or_else(|| Error::not_found("object", name))?;
            let length = length as usize;
            if length > data.len() {
                return Err(Error::Storage(format!(
                    "object `{}` is {} bytes, shorter than requested tail of {}",
                    name,
                    data.len(),
                    length
                )));
            }
            Ok(data.slice(data.len() - length..))
        })();
        self.record("object_tail", name, result.is_ok());
        result
    }

    async fn object_get_range(
        &self,
        account: &str,
        container: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.check("object_get_range", name)?;
        let result = (|| {
            let data = self
                .object(account, container, name)
                .ok_or_else(|| Error::not_found("object", name))?;
            let offset = offset as usize;
            let length = length as usize;
            if offset.checked_add(length).map_or(true, |end| end > data.len()) {
                return Err(Error::Storage(format!(
                    "range [{}, {}) falls outside object `{}` of {} bytes",
                    offset,
                    offset.saturating_add(length),
                    name,
                    data.len()
                )));
            }
            Ok(data.slice(offset..offset + length))
        })();
        self.record("object_get_range", name, result.is_ok());
        result
    }

    async fn object_delete(&self, account: &str, container: &str, name: &str) -> Result<()> {
        self.check("object_delete", name)?;
        let mut state = self.state.write();
        if let Some(c) = state
            .accounts
            .get_mut(account)
            .and_then(|a| a.containers.get_mut(container))
        {
            c.objects.remove(name);
        }
        drop(state);
        self.record("object_delete", name, true);
        Ok(())
    }

    async fn object_chunked_put(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Box<dyn ChunkedPutContext>> {
        self.check("object_chunked_put", name)?;
        Ok(Box::new(MockChunkedPut {
            state: Arc::clone(&self.state),
            call_history: Arc::clone(&self.call_history),
            account: account.to_string(),
            container: container.to_string(),
            name: name.to_string(),
            buffered: Vec::new(),
        }))
    }
}

struct MockChunkedPut {
    state: Arc<RwLock<MockState>>,
    call_history: Arc<RwLock<Vec<CallHistoryEntry>>>,
    account: String,
    container: String,
    name: String,
    buffered: Vec<u8>,
}

#[async_trait]
impl ChunkedPutContext for MockChunkedPut {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffered.extend_from_slice(&chunk);
        Ok(())
    }

    fn bytes_put(&self) -> u64 {
        self.buffered.len() as u64
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.state.write();
        state
            .accounts
            .entry(self.account.clone())
            .or_default()
            .containers
            .entry(self.container.clone())
            .or_default()
            .objects
            .insert(self.name.clone(), Bytes::from(self.buffered));
        drop(state);
        self.call_history.write().push(CallHistoryEntry {
            operation: "chunked_put_close",
            target: self.name,
            success: true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_failure_queue() {
        let mock = MockObjectClient::with_failures(vec![
            MockFailure::Storage("503 Service Unavailable"),
            MockFailure::Ok,
        ]);

        let result = mock.container_put("acct", "ckpt", headers(&[])).await;
        assert!(matches!(result, Err(Error::Storage(_))));

        mock.container_put("acct", "ckpt", headers(&[]))
            .await
            .unwrap();

        // Queue drained; everything succeeds now
        mock.container_post("acct", "ckpt", headers(&[("X-A", "1")]))
            .await
            .unwrap();
        assert_eq!(mock.calls("container_post"), 1);
    }

    #[tokio::test]
    async fn test_call_history_and_objects() {
        let mock = MockObjectClient::new();
        mock.container_put("acct", "ckpt", headers(&[]))
            .await
            .unwrap();

        let mut ctx = mock
            .object_chunked_put("acct", "ckpt", "0000000000000065")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"abcdef")).await.unwrap();
        ctx.close().await.unwrap();

        assert_eq!(
            mock.object("acct", "ckpt", "0000000000000065").unwrap(),
            Bytes::from_static(b"abcdef")
        );

        let tail = mock
            .object_tail("acct", "ckpt", "0000000000000065", 3)
            .await
            .unwrap();
        assert_eq!(tail, Bytes::from_static(b"def"));

        mock.object_delete("acct", "ckpt", "0000000000000065")
            .await
            .unwrap();
        assert_eq!(mock.deleted_objects(), vec!["0000000000000065"]);
        assert!(mock.object("acct", "ckpt", "0000000000000065").is_none());
    }

    #[tokio::test]
    async fn test_range_overflow_is_an_error() {
        let mock = MockObjectClient::new();
        let mut ctx = mock
            .object_chunked_put("acct", "ckpt", "obj")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"abc")).await.unwrap();
        ctx.close().await.unwrap();

        // offset + length overflows; must come back as a storage error,
        // never a panic.
        let result = mock
            .object_get_range("acct", "ckpt", "obj", u64::MAX, 2)
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_header_merge() {
        let mock = MockObjectClient::new();
        mock.container_put("acct", "ckpt", headers(&[("X-A", "1")]))
            .await
            .unwrap();
        mock.container_post("acct", "ckpt", headers(&[("X-A", "2"), ("X-B", "3")]))
            .await
            .unwrap();

        let got = mock.container_headers("acct", "ckpt").unwrap();
        assert_eq!(got.get("X-A").unwrap(), "2");
        assert_eq!(got.get("X-B").unwrap(), "3");

        mock.account_post("acct", headers(&[("X-Bi-Modal", "true")]))
            .await
            .unwrap();
        let got = mock.account_headers("acct").unwrap();
        assert_eq!(got.get("X-Bi-Modal").unwrap(), "true");
    }
}
