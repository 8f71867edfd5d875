#![deny(unsafe_code)]

//! Embedded on-disk [`Storage`] backend built on sled.
//!
//! Three trees:
//! - `sessions`: client id to the session snapshot
//! - `queues`: messages enqueued for offline sessions after their last snapshot, keyed
//!   by client id, a `0xFF` separator and a monotonic sequence number
//! - `retaineds`: topic name to the retained message
//!
//! A snapshot and the queue entries it supersedes are written in one transaction.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Transactional, Tree};

use tmqtt::conf::{PersistenceType, Settings, SledConfig};
use tmqtt::retain::Retained;
use tmqtt::storage::{Storage, StoredSession};
use tmqtt::types::{ClientId, From, NodeId, Publish, TopicName};
use tmqtt::Result;

const SESSIONS: &str = "sessions";
const QUEUES: &str = "queues";
const RETAINEDS: &str = "retaineds";

//never part of a UTF-8 string
const SEPARATOR: u8 = 0xFF;

type Message = (From, Publish);

/// Opens the backend named by the persistence settings.
pub fn storage(settings: &Settings) -> Result<Arc<dyn Storage>> {
    if settings.persistence.typ != PersistenceType::Sled {
        return Err(anyhow!("persistence is {:?}, not sled", settings.persistence.typ));
    }
    Ok(Arc::new(SledStorage::open(&settings.persistence.sled, settings.node.id)?))
}

#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
    sessions: Tree,
    queues: Tree,
    retaineds: Tree,
}

impl SledStorage {
    /// `{node}` in the configured path is replaced by the node id.
    pub fn open(cfg: &SledConfig, node_id: NodeId) -> Result<Self> {
        let path = cfg.path.replace("{node}", &node_id.to_string());
        log::info!("open sled storage at {}, cache_capacity: {}", path, cfg.cache_capacity);
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(cfg.cache_capacity)
            .open()
            .map_err(|e| anyhow!("open sled storage at {} error, {:?}", path, e))?;
        Ok(Self {
            sessions: db.open_tree(SESSIONS)?,
            queues: db.open_tree(QUEUES)?,
            retaineds: db.open_tree(RETAINEDS)?,
            db,
        })
    }

    #[inline]
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }

    fn get_session(&self, client_id: &ClientId) -> Result<Option<StoredSession>> {
        match self.sessions.get(client_id.as_bytes())? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    /// Decodable queue entries of one client, oldest first.
    fn queued(&self, client_id: &ClientId) -> Result<Vec<Message>> {
        let mut msgs = Vec::new();
        for item in self.queues.scan_prefix(queue_prefix(client_id)).values() {
            match decode::<Message>(&item?) {
                Ok(msg) => msgs.push(msg),
                Err(e) => log::warn!("{:?} skip undecodable queued message, {:?}", client_id, e),
            }
        }
        Ok(msgs)
    }

    fn queue_keys(&self, client_id: &ClientId) -> Result<Vec<sled::IVec>> {
        let mut keys = Vec::new();
        for k in self.queues.scan_prefix(queue_prefix(client_id)).keys() {
            keys.push(k?);
        }
        Ok(keys)
    }

    /// Applies a snapshot change and queue changes of one client atomically.
    fn commit(
        &self,
        client_id: &ClientId,
        session: SessionWrite<'_>,
        push: Option<(&[u8], &[u8])>,
        drop_keys: &[sled::IVec],
    ) -> Result<()> {
        (&self.sessions, &self.queues)
            .transaction(|(sessions, queues)| -> ConflictableTransactionResult<(), ()> {
                match session {
                    SessionWrite::Keep => {}
                    SessionWrite::Put(data) => {
                        sessions.insert(client_id.as_bytes().as_ref(), data)?;
                    }
                    SessionWrite::Remove => {
                        sessions.remove(client_id.as_bytes().as_ref())?;
                    }
                }
                if let Some((k, v)) = push {
                    queues.insert(k, v)?;
                }
                for k in drop_keys {
                    queues.remove(k.as_ref())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<()>| anyhow!("{:?} sled transaction error, {:?}", client_id, e))
    }
}

#[derive(Clone, Copy)]
enum SessionWrite<'a> {
    Keep,
    Put(&'a [u8]),
    Remove,
}

#[async_trait]
impl Storage for SledStorage {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn ping(&self) -> Result<()> {
        self.db.size_on_disk()?;
        Ok(())
    }

    async fn load_session(&self, client_id: &ClientId) -> Result<Option<StoredSession>> {
        let Some(mut s) = self.get_session(client_id)? else {
            return Ok(None);
        };
        s.queued.extend(self.queued(client_id)?);
        Ok(Some(s))
    }

    async fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut sessions = Vec::new();
        for item in self.sessions.iter() {
            let (k, v) = item?;
            match decode::<StoredSession>(&v) {
                Ok(mut s) => {
                    s.queued.extend(self.queued(&s.client_id)?);
                    sessions.push(s);
                }
                Err(e) => log::warn!("{:?} skip undecodable session, {:?}", String::from_utf8_lossy(&k), e),
            }
        }
        Ok(sessions)
    }

    async fn store_session(&self, session: &StoredSession) -> Result<()> {
        let data = encode(session)?;
        let drops = self.queue_keys(&session.client_id)?;
        self.commit(&session.client_id, SessionWrite::Put(&data), None, &drops)
    }

    async fn delete_session(&self, client_id: &ClientId) -> Result<()> {
        let drops = self.queue_keys(client_id)?;
        self.commit(client_id, SessionWrite::Remove, None, &drops)
    }

    async fn enqueue_message(&self, client_id: &ClientId, msg: &(From, Publish), limit: usize) -> Result<()> {
        let mut key = queue_prefix(client_id);
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        let data = encode(msg)?;

        let mut stored = self.get_session(client_id)?;
        let mut queued = self.queue_keys(client_id)?;
        let mut drops = Vec::new();
        let mut session_changed = false;
        loop {
            let stored_len = stored.as_ref().map(|s| s.queued.len()).unwrap_or_default();
            if stored_len + queued.len() < limit.max(1) {
                break;
            }
            match stored.as_mut() {
                Some(s) if !s.queued.is_empty() => {
                    s.queued.remove(0);
                    session_changed = true;
                }
                _ => {
                    if queued.is_empty() {
                        break;
                    }
                    drops.push(queued.remove(0));
                }
            }
        }
        if !drops.is_empty() || session_changed {
            log::debug!("{:?} offline queue is full, {} oldest messages discarded", client_id, drops.len());
        }

        match stored.filter(|_| session_changed) {
            Some(s) => {
                let session = encode(&s)?;
                self.commit(client_id, SessionWrite::Put(&session), Some((&key, &data)), &drops)
            }
            None => self.commit(client_id, SessionWrite::Keep, Some((&key, &data)), &drops),
        }
    }

    async fn dequeue_messages(&self, client_id: &ClientId) -> Result<Vec<(From, Publish)>> {
        let drops = self.queue_keys(client_id)?;
        let queued = self.queued(client_id)?;
        let mut msgs = match self.get_session(client_id)? {
            Some(mut s) => {
                let msgs = std::mem::take(&mut s.queued);
                let session = encode(&s)?;
                self.commit(client_id, SessionWrite::Put(&session), None, &drops)?;
                msgs
            }
            None => {
                self.commit(client_id, SessionWrite::Keep, None, &drops)?;
                Vec::new()
            }
        };
        msgs.extend(queued);
        Ok(msgs)
    }

    async fn store_retained(&self, retained: &Retained) -> Result<()> {
        self.retaineds.insert(retained.topic().as_bytes(), encode(retained)?)?;
        Ok(())
    }

    async fn remove_retained(&self, topic: &TopicName) -> Result<()> {
        self.retaineds.remove(topic.as_bytes())?;
        Ok(())
    }

    async fn load_retained(&self) -> Result<Vec<Retained>> {
        let mut retaineds = Vec::new();
        for item in self.retaineds.iter() {
            let (k, v) = item?;
            match decode::<Retained>(&v) {
                Ok(r) => retaineds.push(r),
                Err(e) => {
                    log::warn!("{:?} undecodable retained message removed, {:?}", String::from_utf8_lossy(&k), e);
                    self.retaineds.remove(k)?;
                }
            }
        }
        Ok(retaineds)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn queue_prefix(client_id: &ClientId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1 + 8);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

#[inline]
fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(v)?)
}

#[inline]
fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tmqtt::types::{Id, QoS, SubscriptionEntry, SubscriptionOptions, TopicFilter};

    use super::*;

    fn open(dir: &tempfile::TempDir) -> SledStorage {
        let cfg = SledConfig { path: dir.path().join("node-{node}").display().to_string(), cache_capacity: 1024 * 1024 };
        SledStorage::open(&cfg, 1).unwrap()
    }

    fn client(id: &'static str) -> ClientId {
        ClientId::from_static(id)
    }

    fn msg(payload: &'static str) -> Message {
        (
            From::from_system(Id::system(1)),
            Publish::new("home/light", Bytes::from_static(payload.as_bytes()), QoS::AtLeastOnce, false),
        )
    }

    fn payloads(msgs: &[Message]) -> Vec<&[u8]> {
        msgs.iter().map(|(_, p)| p.payload.as_ref()).collect()
    }

    #[tokio::test]
    async fn session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = StoredSession::new(client("c1"), 3600, false);
        s.subscriptions.push(SubscriptionEntry::new(
            TopicFilter::from_static("home/#"),
            SubscriptionOptions::qos(QoS::AtLeastOnce),
            None,
        ));
        {
            let storage = open(&dir);
            storage.store_session(&s).await.unwrap();
            storage.enqueue_message(&client("c1"), &msg("a"), 10).await.unwrap();
            storage.enqueue_message(&client("c1"), &msg("b"), 10).await.unwrap();
            storage.flush().await.unwrap();
        }

        let storage = open(&dir);
        let loaded = storage.load_session(&client("c1")).await.unwrap().unwrap();
        assert_eq!(loaded.subscriptions, s.subscriptions);
        assert_eq!(payloads(&loaded.queued), vec![b"a".as_ref(), b"b".as_ref()]);
        assert!(storage.load_session(&client("c2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_session_loads_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(&dir);
            storage.store_session(&StoredSession::new(client("c1"), 60, false)).await.unwrap();
            storage.store_session(&StoredSession::new(client("c10"), 60, false)).await.unwrap();
            storage.enqueue_message(&client("c1"), &msg("a"), 10).await.unwrap();
            storage.flush().await.unwrap();
        }
        let storage = open(&dir);
        let mut sessions = storage.load_sessions().await.unwrap();
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        assert_eq!(sessions.len(), 2);
        assert_eq!(payloads(&sessions[0].queued), vec![b"a".as_ref()]);
        assert!(sessions[1].queued.is_empty());
    }

    #[tokio::test]
    async fn snapshot_supersedes_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let c = client("c1");
        storage.store_session(&StoredSession::new(c.clone(), 60, false)).await.unwrap();
        storage.enqueue_message(&c, &msg("old"), 10).await.unwrap();

        let mut s = StoredSession::new(c.clone(), 60, false);
        s.queued.push(msg("snap"));
        storage.store_session(&s).await.unwrap();
        let loaded = storage.load_session(&c).await.unwrap().unwrap();
        assert_eq!(payloads(&loaded.queued), vec![b"snap".as_ref()]);
    }

    #[tokio::test]
    async fn queue_limit_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let c = client("c1");
        let mut s = StoredSession::new(c.clone(), 60, false);
        s.queued.push(msg("1"));
        storage.store_session(&s).await.unwrap();
        for p in ["2", "3", "4"] {
            storage.enqueue_message(&c, &msg(p), 2).await.unwrap();
        }
        let loaded = storage.load_session(&c).await.unwrap().unwrap();
        assert_eq!(payloads(&loaded.queued), vec![b"3".as_ref(), b"4".as_ref()]);
    }

    #[tokio::test]
    async fn dequeue_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let c = client("c1");
        let mut s = StoredSession::new(c.clone(), 60, false);
        s.queued.push(msg("a"));
        storage.store_session(&s).await.unwrap();
        storage.enqueue_message(&c, &msg("b"), 10).await.unwrap();
        storage.enqueue_message(&client("c10"), &msg("other"), 10).await.unwrap();

        let msgs = storage.dequeue_messages(&c).await.unwrap();
        assert_eq!(payloads(&msgs), vec![b"a".as_ref(), b"b".as_ref()]);
        let loaded = storage.load_session(&c).await.unwrap().unwrap();
        assert!(loaded.queued.is_empty());

        storage.delete_session(&c).await.unwrap();
        assert!(storage.load_session(&c).await.unwrap().is_none());
        assert_eq!(storage.dequeue_messages(&client("c10")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retained_messages_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(&dir);
            let (from, mut p) = msg("on");
            p.retain = true;
            storage.store_retained(&Retained::new(from.clone(), p.clone(), Duration::ZERO)).await.unwrap();
            p.topic = TopicName::from_static("home/door");
            storage.store_retained(&Retained::new(from, p, Duration::ZERO)).await.unwrap();
            storage.remove_retained(&TopicName::from_static("home/door")).await.unwrap();
            storage.flush().await.unwrap();
        }
        let storage = open(&dir);
        let retaineds = storage.load_retained().await.unwrap();
        assert_eq!(retaineds.len(), 1);
        assert_eq!(&retaineds[0].topic()[..], "home/light");
    }

    #[test]
    fn only_opens_when_configured() {
        assert!(storage(&Settings::default()).is_err());
    }
}
