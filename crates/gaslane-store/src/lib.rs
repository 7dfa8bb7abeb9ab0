//! Storage adapter trait and implementations for the Gaslane SDK.
//!
//! Defines the `StorageAdapter` trait that all storage backends must implement.
//! Provides a `MemoryStore` for testing and ephemeral use.
//!
//! The SDK persists exactly two session entries (signer account and
//! contract-wallet address) under fixed keys owned by `gaslane-session`.
//! Writes are last-writer-wins; no transactional guarantees are provided.

use async_trait::async_trait;
use gaslane_types::Result;

pub mod memory;

pub use memory::MemoryStore;

/// The core storage adapter trait.
///
/// All methods are async to support both in-memory and persistent backends
/// (browser local storage, files, embedded key-value stores).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // --- Lifecycle ---
    async fn init(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // --- Key-value entries ---
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}
