use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::{Cache, CacheError, PubSubMessage};

#[derive(Clone)]
struct Entry {
  value: Vec<u8>,
  expires_at: Option<Instant>,
}

impl Entry {
  fn expired(&self) -> bool {
    self.expires_at.is_some_and(|at| Instant::now() >= at)
  }
}

/// In-process cache with expiring entries and broadcast-backed pub/sub.
#[derive(Default)]
pub struct MemoryCache {
  entries: DashMap<String, Entry>,
  channels: DashMap<String, broadcast::Sender<PubSubMessage>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn channel(&self, name: &str) -> broadcast::Sender<PubSubMessage> {
    self
      .channels
      .entry(name.to_string())
      .or_insert_with(|| broadcast::channel(256).0)
      .clone()
  }
}

#[async_trait]
impl Cache for MemoryCache {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    if let Some(entry) = self.entries.get(key) {
      if entry.expired() {
        drop(entry);
        self.entries.remove(key);
        return Ok(None);
      }
      return Ok(Some(entry.value.clone()));
    }
    Ok(None)
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
    self.entries.insert(
      key.to_string(),
      Entry {
        value: value.to_vec(),
        expires_at: ttl.map(|t| Instant::now() + t),
      },
    );
    Ok(())
  }

  async fn del(&self, key: &str) -> Result<(), CacheError> {
    self.entries.remove(key);
    Ok(())
  }

  async fn incr(&self, key: &str) -> Result<i64, CacheError> {
    let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
      value: b"0".to_vec(),
      expires_at: None,
    });
    if entry.expired() {
      entry.value = b"0".to_vec();
      entry.expires_at = None;
    }
    let current: i64 = std::str::from_utf8(&entry.value)
      .ok()
      .and_then(|s| s.parse().ok())
      .ok_or_else(|| CacheError::NotAnInteger {
        key: key.to_string(),
      })?;
    let next = current + 1;
    entry.value = next.to_string().into_bytes();
    Ok(next)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
    match self.entries.get_mut(key) {
      Some(mut entry) if !entry.expired() => {
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), CacheError> {
    // No subscribers is fine; the send error just means nobody listened.
    let _ = self.channel(channel).send(PubSubMessage {
      channel: channel.to_string(),
      payload: payload.to_vec(),
    });
    Ok(())
  }

  async fn subscribe(
    &self,
    channels: &[String],
  ) -> Result<mpsc::Receiver<PubSubMessage>, CacheError> {
    let (tx, rx) = mpsc::channel(256);
    for name in channels {
      let mut sub = self.channel(name).subscribe();
      let tx = tx.clone();
      tokio::spawn(async move {
        loop {
          match sub.recv().await {
            Ok(message) => {
              if tx.send(message).await.is_err() {
                return;
              }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
          }
        }
      });
    }
    Ok(rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn set_get_del_round_trip() {
    let cache = MemoryCache::new();
    cache.set("k", b"v", None).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    cache.del("k").await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn ttl_expires_entries() {
    let cache = MemoryCache::new();
    cache
      .set("k", b"v", Some(Duration::from_millis(20)))
      .await
      .unwrap();
    assert!(cache.get("k").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn incr_counts_from_zero() {
    let cache = MemoryCache::new();
    assert_eq!(cache.incr("n").await.unwrap(), 1);
    assert_eq!(cache.incr("n").await.unwrap(), 2);
    assert_eq!(cache.get("n").await.unwrap(), Some(b"2".to_vec()));
  }

  #[tokio::test]
  async fn incr_rejects_non_integer() {
    let cache = MemoryCache::new();
    cache.set("k", b"not a number", None).await.unwrap();
    assert!(cache.incr("k").await.is_err());
  }

  #[tokio::test]
  async fn expire_requires_existing_key() {
    let cache = MemoryCache::new();
    assert!(!cache.expire("ghost", Duration::from_secs(1)).await.unwrap());
    cache.set("k", b"v", None).await.unwrap();
    assert!(cache.expire("k", Duration::from_millis(20)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
  }

  #[tokio::test]
  async fn pub_sub_delivers_across_channels() {
    let cache = MemoryCache::new();
    let mut rx = cache
      .subscribe(&["a".to_string(), "b".to_string()])
      .await
      .unwrap();

    cache.publish("a", b"one").await.unwrap();
    cache.publish("b", b"two").await.unwrap();
    cache.publish("c", b"ignored").await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let mut channels = vec![first.channel, second.channel];
    channels.sort();
    assert_eq!(channels, vec!["a", "b"]);
  }
}
