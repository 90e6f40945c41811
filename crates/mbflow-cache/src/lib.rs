//! Shared cache capability.
//!
//! The trigger subsystem keeps its cross-process state (trigger fire
//! records, rate-limit buckets) and its pub/sub channels behind this trait.
//! The in-memory implementation is suitable for embedded use and tests; a
//! networked backend plugs in behind the same trait.

mod memory;

pub use memory::MemoryCache;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache backend error: {message}")]
  Backend { message: String },

  #[error("value at '{key}' is not an integer")]
  NotAnInteger { key: String },
}

/// One message received from a subscription.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
  pub channel: String,
  pub payload: Vec<u8>,
}

/// Byte-oriented cache with counters, expiry, and pub/sub.
#[async_trait]
pub trait Cache: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

  /// Set a value, optionally with a time-to-live. `None` means no expiry.
  async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

  async fn del(&self, key: &str) -> Result<(), CacheError>;

  /// Atomically increment an integer value, creating it at 1 if absent.
  async fn incr(&self, key: &str) -> Result<i64, CacheError>;

  /// Set the expiry of an existing key. Returns false if the key is absent.
  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

  async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), CacheError>;

  /// Subscribe to one or more channels. Messages from every channel arrive
  /// on the single returned receiver.
  async fn subscribe(
    &self,
    channels: &[String],
  ) -> Result<mpsc::Receiver<PubSubMessage>, CacheError>;
}
