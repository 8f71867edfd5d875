//! Retained messages.
//!
//! The store keeps the last retained message of every topic in a [`TopicTree`] keyed by
//! topic name and answers subscriptions by matching a filter against the stored names:
//!
//! ```text
//! Root
//! ├── sensors
//! │   └── room1
//! │       ├── temp (retained)
//! │       └── humidity (retained)
//! └── $SYS
//!     └── uptime (retained, skipped by `#` and `+/...`)
//! ```
//!
//! Expiry is an absolute timestamp so it survives a restart through the persistence
//! backend. Expired entries are purged lazily on lookup and by a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::storage::Persister;
use crate::trie::TopicTree;
use crate::types::*;
use crate::utils::{timestamp_millis, Counter};
use crate::Result;

/// A retained message as stored and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retained {
    pub from: From,
    pub publish: Publish,
    pub expiry_at: Option<TimestampMillis>,
}

impl Retained {
    pub fn new(from: From, publish: Publish, default_expiry: Duration) -> Self {
        let expiry_at = publish.expiry_at(default_expiry);
        Self { from, publish, expiry_at }
    }

    #[inline]
    pub fn topic(&self) -> &TopicName {
        &self.publish.topic
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiry_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[async_trait]
pub trait RetainStorage: Sync + Send {
    /// False when the broker was configured without retained message support.
    fn enable(&self) -> bool;

    /// Replaces the retained message of `retained.topic()`; an empty payload deletes it.
    async fn set(&self, retained: Retained) -> Result<()>;

    /// Live retained messages whose topic matches `topic_filter`.
    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<Retained>>;

    /// Drops every expired message, returning how many were removed.
    async fn remove_expired_messages(&self) -> usize;

    /// Read-only snapshot of at most `limit` retained messages.
    async fn list(&self, limit: usize) -> Vec<Retained>;

    fn count(&self) -> isize;

    fn max(&self) -> isize;
}

pub struct DefaultRetainStorage {
    enable: bool,
    messages: RwLock<TopicTree<Retained>>,
    counter: Arc<Counter>,
    persister: Option<Persister>,
}

impl DefaultRetainStorage {
    pub fn new(enable: bool, persister: Option<Persister>) -> Self {
        Self { enable, messages: RwLock::new(TopicTree::default()), counter: Arc::new(Counter::new()), persister }
    }

    /// Fills the store with messages loaded from the persistence backend at startup.
    /// Nothing is written back.
    pub fn warm(&self, retaineds: Vec<Retained>) -> usize {
        let now = timestamp_millis();
        let mut messages = self.messages.write();
        let mut loaded = 0;
        for r in retaineds {
            if r.is_expired(now) || r.publish.payload.is_empty() {
                continue;
            }
            let topic = r.topic().clone();
            if messages.insert(&topic, r).is_none() {
                self.counter.inc();
            }
            loaded += 1;
        }
        loaded
    }

    fn remove(&self, topic: &TopicName) -> Option<Retained> {
        let removed = self.messages.write().remove(topic);
        if removed.is_some() {
            self.counter.dec();
            if let Some(p) = self.persister.as_ref() {
                p.remove_retained(topic.clone());
            }
        }
        removed
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    #[inline]
    fn enable(&self) -> bool {
        self.enable
    }

    async fn set(&self, retained: Retained) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        let topic = retained.topic().clone();
        if retained.publish.payload.is_empty() {
            let removed = self.remove(&topic);
            log::debug!("{:?} clear retained message, topic: {}, existed: {}", retained.from.id, topic, removed.is_some());
            return Ok(());
        }

        let old = self.messages.write().insert(&topic, retained.clone());
        if old.is_none() {
            self.counter.inc();
        }
        log::debug!("{:?} set retained message, topic: {}", retained.from.id, topic);
        if let Some(p) = self.persister.as_ref() {
            p.store_retained(retained);
        }
        Ok(())
    }

    async fn get(&self, topic_filter: &TopicFilter) -> Result<Vec<Retained>> {
        if !self.enable {
            return Ok(Vec::new());
        }
        let now = timestamp_millis();
        let (live, expired): (Vec<Retained>, Vec<Retained>) =
            self.messages.read().matches_filter(topic_filter).into_iter().cloned().partition(|r| !r.is_expired(now));

        for r in expired {
            //the entry may have been replaced after the read lock was released
            let still_expired = self.messages.read().get(r.topic()).map(|r| r.is_expired(now)).unwrap_or(false);
            if still_expired {
                log::debug!("retained message expired, topic: {}", r.topic());
                self.remove(r.topic());
            }
        }
        Ok(live)
    }

    async fn remove_expired_messages(&self) -> usize {
        let now = timestamp_millis();
        let mut expired = Vec::new();
        let removed = self.messages.write().retain(&mut |r: &Retained| {
            if r.is_expired(now) {
                expired.push(r.topic().clone());
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.counter.decs(removed as isize);
            if let Some(p) = self.persister.as_ref() {
                for topic in expired {
                    p.remove_retained(topic);
                }
            }
            log::debug!("removed {} expired retained messages", removed);
        }
        removed
    }

    async fn list(&self, limit: usize) -> Vec<Retained> {
        self.messages.read().values().into_iter().take(limit).cloned().collect()
    }

    #[inline]
    fn count(&self) -> isize {
        self.counter.count()
    }

    #[inline]
    fn max(&self) -> isize {
        self.counter.max()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use bytes::Bytes;

    use super::*;

    fn retained(topic: &'static str, payload: &'static [u8]) -> Retained {
        let from = From::from_custom(Id::new(0, 1, ClientId::from_static("pub"), None, None));
        let publish = Publish::new(topic, Bytes::from_static(payload), QoS::AtLeastOnce, true);
        Retained::new(from, publish, Duration::ZERO)
    }

    fn topics(mut rs: Vec<Retained>) -> Vec<String> {
        rs.sort_by(|a, b| a.topic().cmp(b.topic()));
        rs.into_iter().map(|r| r.topic().to_string()).collect()
    }

    #[tokio::test]
    async fn set_replace_and_delete() {
        let store = DefaultRetainStorage::new(true, None);
        store.set(retained("a/b", b"1")).await.unwrap();
        store.set(retained("a/b", b"2")).await.unwrap();
        assert_eq!(store.count(), 1);

        let got = store.get(&TopicFilter::from_static("a/b")).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].publish.payload, Bytes::from_static(b"2"));

        store.set(retained("a/b", b"")).await.unwrap();
        assert!(store.get(&TopicFilter::from_static("a/b")).await.unwrap().is_empty());
        assert_eq!(store.count(), 0);
        assert_eq!(store.max(), 1);
    }

    #[tokio::test]
    async fn wildcard_lookup() {
        let store = DefaultRetainStorage::new(true, None);
        for t in ["sensors/room1/temp", "sensors/room2/temp", "sensors/room1/humidity", "$SYS/uptime"] {
            store.set(retained(t, b"x")).await.unwrap();
        }
        let got = store.get(&TopicFilter::from_static("sensors/+/temp")).await.unwrap();
        assert_eq!(topics(got), vec!["sensors/room1/temp", "sensors/room2/temp"]);
        assert_eq!(store.get(&TopicFilter::from_static("#")).await.unwrap().len(), 3);
        assert_eq!(store.get(&TopicFilter::from_static("$SYS/#")).await.unwrap().len(), 1);
        assert_eq!(store.list(2).await.len(), 2);
    }

    #[tokio::test]
    async fn expired_messages_are_purged() {
        let store = DefaultRetainStorage::new(true, None);
        let mut r = retained("a/old", b"x");
        r.publish.properties.message_expiry_interval = NonZeroU32::new(1);
        r.expiry_at = Some(timestamp_millis() - 1);
        store.set(r.clone()).await.unwrap();
        store.set(retained("a/new", b"y")).await.unwrap();

        let got = store.get(&TopicFilter::from_static("a/+")).await.unwrap();
        assert_eq!(topics(got), vec!["a/new"]);
        assert_eq!(store.count(), 1);

        let mut r2 = r.clone();
        r2.publish.topic = TopicName::from_static("b/old");
        store.set(r2).await.unwrap();
        assert_eq!(store.remove_expired_messages().await, 1);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn disabled_store_keeps_nothing() {
        let store = DefaultRetainStorage::new(false, None);
        store.set(retained("a/b", b"1")).await.unwrap();
        assert!(store.get(&TopicFilter::from_static("a/b")).await.unwrap().is_empty());
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn warm_skips_expired_and_tombstones() {
        let store = DefaultRetainStorage::new(true, None);
        let mut expired = retained("x/1", b"x");
        expired.expiry_at = Some(0);
        let n = store.warm(vec![retained("x/2", b"x"), expired, retained("x/3", b"")]);
        assert_eq!(n, 1);
        assert_eq!(store.count(), 1);
    }
}
