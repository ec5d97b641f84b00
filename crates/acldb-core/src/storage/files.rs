//! File content storage.
//!
//! File attributes above the inline threshold are moved out of the record
//! and addressed by an opaque token.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{Error, Result};

/// Blob storage for file attribute content.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store content and return its token.
    async fn create(&self, name: &str, data: Vec<u8>) -> Result<String>;

    /// Remove stored content. Unknown tokens are ignored.
    async fn destroy(&self, token: &str) -> Result<()>;

    /// Fetch stored content.
    async fn file_data(&self, token: &str) -> Result<Vec<u8>>;

    /// A location string clients can use to fetch the content.
    fn file_location(&self, token: &str) -> String;
}

/// File store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn create(&self, name: &str, data: Vec<u8>) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&data);
        let token = hasher.finalize().to_hex().to_string();
        self.files.insert(token.clone(), data);
        Ok(token)
    }

    async fn destroy(&self, token: &str) -> Result<()> {
        self.files.remove(token);
        Ok(())
    }

    async fn file_data(&self, token: &str) -> Result<Vec<u8>> {
        self.files
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::FileStore(format!("unknown file token {token}")))
    }

    fn file_location(&self, token: &str) -> String {
        format!("memory://{token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_fetch_destroy() {
        let store = MemoryFileStore::new();
        let token = store.create("a.txt", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.file_data(&token).await.unwrap(), b"hello");
        assert_eq!(store.file_location(&token), format!("memory://{token}"));

        store.destroy(&token).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.file_data(&token).await,
            Err(Error::FileStore(_))
        ));
    }
}
