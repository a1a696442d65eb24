//! Local filesystem implementation of the object-store client
//!
//! Maps accounts and containers to directories under a base directory and
//! objects to files inside them. Account and container headers live in
//! `.headers.json` sidecar files, a name no checkpoint object can collide
//! with (objects are hex-printed nonces).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ChunkedPutContext, Headers, ObjectClient};
use metafs_core::{Error, Result};

const HEADERS_SIDECAR: &str = ".headers.json";

/// Directory-backed object store for development and testing.
pub struct LocalObjectClient {
    base_dir: PathBuf,
}

impl LocalObjectClient {
    /// Create a new local object client rooted at `base_dir`.
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn account_dir(&self, account: &str) -> PathBuf {
        self.base_dir.join(account)
    }

    fn container_dir(&self, account: &str, container: &str) -> PathBuf {
        self.account_dir(account).join(container)
    }

    fn object_path(&self, account: &str, container: &str, name: &str) -> PathBuf {
        self.container_dir(account, container).join(name)
    }

    async fn read_headers(path: &Path) -> Result<Headers> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_headers(path: &Path, headers: Headers) -> Result<()> {
        let mut merged = Self::read_headers(path).await?;
        merged.extend(headers);
        tokio::fs::write(path, serde_json::to_vec(&merged)?).await?;
        Ok(())
    }

    async fn read_object(&self, account: &str, container: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(account, container, name);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found("object", name)
            } else {
                Error::from(e)
            }
        })
    }
}

#[async_trait]
impl ObjectClient for LocalObjectClient {
    async fn container_head(&self, account: &str, container: &str) -> Result<Headers> {
        let dir = self.container_dir(account, container);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::not_found("container", container));
        }
        Self::read_headers(&dir.join(HEADERS_SIDECAR)).await
    }

    async fn container_put(&self, account: &str, container: &str, headers: Headers) -> Result<()> {
        let dir = self.container_dir(account, container);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(HEADERS_SIDECAR), serde_json::to_vec(&headers)?).await?;
        Ok(())
    }

    async fn container_post(
        &self,
        account: &str,
        container: &str,
        headers: Headers,
    ) -> Result<()> {
        let dir = self.container_dir(account, container);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::not_found("container", container));
        }
        Self::merge_headers(&dir.join(HEADERS_SIDECAR), headers).await
    }

    async fn account_post(&self, account: &str, headers: Headers) -> Result<()> {
        let dir = self.account_dir(account);
        tokio::fs::create_dir_all(&dir).await?;
        Self::merge_headers(&dir.join(HEADERS_SIDECAR), headers).await
    }

    async fn object_tail(
        &self,
        account: &str,
        container: &str,
        name: &str,
        length: u64,
    ) -> Result<Bytes> {
        let data = self.read_object(account, container, name).await?;
        let length = length as usize;
        if length > data.len() {
            return Err(Error::Storage(format!(
                "object `{}` is {} bytes, shorter than requested tail of {}",
                name,
                data.len(),
                length
            )));
        }
        Ok(Bytes::copy_from_slice(&data[data.len() - length..]))
    }

    async fn object_get_range(
        &self,
        account: &str,
        container: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let data = self.read_object(account, container, name).await?;
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
        Ok(Bytes::copy_from_slice(&data[offset..offset + length]))
    }

    async fn object_delete(&self, account: &str, container: &str, name: &str) -> Result<()> {
        let path = self.object_path(account, container, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Idempotent - no error if the object is already gone
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn object_chunked_put(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Box<dyn ChunkedPutContext>> {
        Ok(Box::new(LocalChunkedPut {
            path: self.object_path(account, container, name),
            buffered: Vec::new(),
        }))
    }
}

/// Chunked PUT that buffers in memory and materializes the file on close.
struct LocalChunkedPut {
    path: PathBuf,
    buffered: Vec<u8>,
}

#[async_trait]
impl ChunkedPutContext for LocalChunkedPut {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffered.extend_from_slice(&chunk);
        Ok(())
    }

    fn bytes_put(&self) -> u64 {
        self.buffered.len() as u64
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, &self.buffered).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn client() -> (LocalObjectClient, TempDir) {
        let dir = TempDir::new().unwrap();
        let client = LocalObjectClient::new(dir.path()).await.unwrap();
        (client, dir)
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_container_head_missing() {
        let (client, _dir) = client().await;
        let result = client.container_head("acct", "nope").await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_container_put_head_post() {
        let (client, _dir) = client().await;

        client
            .container_put("acct", "ckpt", headers(&[("X-Storage-Policy", "standard")]))
            .await
            .unwrap();

        let got = client.container_head("acct", "ckpt").await.unwrap();
        assert_eq!(got.get("X-Storage-Policy").unwrap(), "standard");

        client
            .container_post("acct", "ckpt", headers(&[("X-Header", "v1")]))
            .await
            .unwrap();
        client
            .container_post("acct", "ckpt", headers(&[("X-Header", "v2")]))
            .await
            .unwrap();

        let got = client.container_head("acct", "ckpt").await.unwrap();
        assert_eq!(got.get("X-Header").unwrap(), "v2");
        assert_eq!(got.get("X-Storage-Policy").unwrap(), "standard");
    }

    #[tokio::test]
    async fn test_container_post_missing() {
        let (client, _dir) = client().await;
        let result = client.container_post("acct", "nope", headers(&[])).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_chunked_put_visible_on_close() {
        let (client, _dir) = client().await;
        client
            .container_put("acct", "ckpt", headers(&[]))
            .await
            .unwrap();

        let mut ctx = client
            .object_chunked_put("acct", "ckpt", "0000000000000065")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        assert_eq!(ctx.bytes_put(), 6);

        // Not visible yet
        let result = client
            .object_get_range("acct", "ckpt", "0000000000000065", 0, 6)
            .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));

        ctx.send_chunk(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(ctx.bytes_put(), 11);
        ctx.close().await.unwrap();

        let got = client
            .object_get_range("acct", "ckpt", "0000000000000065", 6, 5)
            .await
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"world"));

        let tail = client
            .object_tail("acct", "ckpt", "0000000000000065", 5)
            .await
            .unwrap();
        assert_eq!(tail, Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn test_range_overflow_is_an_error() {
        let (client, _dir) = client().await;
        let mut ctx = client
            .object_chunked_put("acct", "ckpt", "obj")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"abc")).await.unwrap();
        ctx.close().await.unwrap();

        // offset + length overflows; must come back as a storage error,
        // never a panic.
        let result = client
            .object_get_range("acct", "ckpt", "obj", u64::MAX, 2)
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_tail_too_long() {
        let (client, _dir) = client().await;
        let mut ctx = client
            .object_chunked_put("acct", "ckpt", "obj")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"abc")).await.unwrap();
        ctx.close().await.unwrap();

        let result = client.object_tail("acct", "ckpt", "obj", 4).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (client, _dir) = client().await;
        let mut ctx = client
            .object_chunked_put("acct", "ckpt", "obj")
            .await
            .unwrap();
        ctx.send_chunk(Bytes::from_static(b"abc")).await.unwrap();
        ctx.close().await.unwrap();

        client.object_delete("acct", "ckpt", "obj").await.unwrap();
        client.object_delete("acct", "ckpt", "obj").await.unwrap();

        let result = client.object_get_range("acct", "ckpt", "obj", 0, 1).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
