//! Session and retained message persistence.
//!
//! [`Storage`] is the backend seam; [`MemoryStorage`] is the built-in backend and
//! `tmqtt-session-storage` provides an embedded on-disk one. Runtime writes go through
//! the [`Persister`], a single ordered task that drains queued operations in batches,
//! so the publish path never waits on storage I/O. Writes that fail are logged and
//! counted; the broker keeps serving from memory.

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::inflight::OutInflightMessage;
use crate::retain::Retained;
use crate::types::*;
use crate::utils::{timestamp_millis, Counter};
use crate::Result;

/// Snapshot of a client session, written as one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: ClientId,
    pub subscriptions: Vec<SubscriptionEntry>,
    pub inflight: Vec<OutInflightMessage>,
    pub awaiting_rel: Vec<NonZeroU16>,
    pub queued: Vec<(From, Publish)>,
    pub last_will: Option<LastWill>,
    pub session_expiry_interval_secs: u32,
    pub clean_start: bool,
    pub created_at: TimestampMillis,
    pub disconnected_at: Option<TimestampMillis>,
}

impl StoredSession {
    pub fn new(client_id: ClientId, session_expiry_interval_secs: u32, clean_start: bool) -> Self {
        Self {
            client_id,
            subscriptions: Vec::new(),
            inflight: Vec::new(),
            awaiting_rel: Vec::new(),
            queued: Vec::new(),
            last_will: None,
            session_expiry_interval_secs,
            clean_start,
            created_at: timestamp_millis(),
            disconnected_at: None,
        }
    }

    /// A session of a connected client never expires.
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        match self.disconnected_at {
            Some(at) => at + self.session_expiry_interval_secs as i64 * 1000 <= now,
            None => false,
        }
    }
}

#[async_trait]
pub trait Storage: Sync + Send {
    fn name(&self) -> &'static str;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// The stored session including every message enqueued after it was stored.
    async fn load_session(&self, client_id: &ClientId) -> Result<Option<StoredSession>>;

    /// Every stored session, each with its enqueued messages, for rebuilding state at startup.
    async fn load_sessions(&self) -> Result<Vec<StoredSession>>;

    /// Replaces the stored session. The snapshot's queue supersedes messages enqueued
    /// before it.
    async fn store_session(&self, session: &StoredSession) -> Result<()>;

    async fn delete_session(&self, client_id: &ClientId) -> Result<()>;

    /// Appends a message to an offline session's queue, discarding the oldest message
    /// beyond `limit`.
    async fn enqueue_message(&self, client_id: &ClientId, msg: &(From, Publish), limit: usize) -> Result<()>;

    /// Takes every queued message of the session, leaving the session itself in place.
    async fn dequeue_messages(&self, client_id: &ClientId) -> Result<Vec<(From, Publish)>>;

    async fn store_retained(&self, retained: &Retained) -> Result<()>;

    async fn remove_retained(&self, topic: &TopicName) -> Result<()>;

    async fn load_retained(&self) -> Result<Vec<Retained>>;

    /// Makes previously written data durable.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything in process memory; state does not survive a restart.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: DashMap<ClientId, StoredSession>,
    queues: DashMap<ClientId, VecDeque<(From, Publish)>>,
    retaineds: DashMap<TopicName, Retained>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn load_session(&self, client_id: &ClientId) -> Result<Option<StoredSession>> {
        let Some(mut s) = self.sessions.get(client_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        if let Some(q) = self.queues.get(client_id) {
            s.queued.extend(q.iter().cloned());
        }
        Ok(Some(s))
    }

    async fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let client_ids = self.sessions.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        let mut sessions = Vec::with_capacity(client_ids.len());
        for client_id in client_ids {
            if let Some(s) = self.load_session(&client_id).await? {
                sessions.push(s);
            }
        }
        Ok(sessions)
    }

    async fn store_session(&self, session: &StoredSession) -> Result<()> {
        self.queues.remove(&session.client_id);
        self.sessions.insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, client_id: &ClientId) -> Result<()> {
        self.sessions.remove(client_id);
        self.queues.remove(client_id);
        Ok(())
    }

    async fn enqueue_message(&self, client_id: &ClientId, msg: &(From, Publish), limit: usize) -> Result<()> {
        let mut q = self.queues.entry(client_id.clone()).or_default();
        q.push_back(msg.clone());
        let mut stored = self.sessions.get_mut(client_id);
        loop {
            let stored_len = stored.as_ref().map(|s| s.queued.len()).unwrap_or_default();
            if stored_len + q.len() <= limit {
                break;
            }
            match stored.as_mut() {
                Some(s) if !s.queued.is_empty() => {
                    s.queued.remove(0);
                }
                _ => {
                    q.pop_front();
                }
            }
        }
        Ok(())
    }

    async fn dequeue_messages(&self, client_id: &ClientId) -> Result<Vec<(From, Publish)>> {
        let mut msgs = self.sessions.get_mut(client_id).map(|mut s| std::mem::take(&mut s.queued)).unwrap_or_default();
        if let Some((_, q)) = self.queues.remove(client_id) {
            msgs.extend(q);
        }
        Ok(msgs)
    }

    async fn store_retained(&self, retained: &Retained) -> Result<()> {
        self.retaineds.insert(retained.topic().clone(), retained.clone());
        Ok(())
    }

    async fn remove_retained(&self, topic: &TopicName) -> Result<()> {
        self.retaineds.remove(topic);
        Ok(())
    }

    async fn load_retained(&self) -> Result<Vec<Retained>> {
        Ok(self.retaineds.iter().map(|e| e.value().clone()).collect())
    }
}

#[derive(Debug)]
enum StoreOp {
    Session(Box<StoredSession>),
    DeleteSession(ClientId),
    Enqueue(ClientId, Box<(From, Publish)>),
    Retain(Box<Retained>),
    RemoveRetain(TopicName),
    Flush(oneshot::Sender<()>),
}

const BATCH_SIZE: usize = 128;

/// Write-behind handle to the persistence backend.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<StoreOp>,
    errors: Arc<Counter>,
}

impl Persister {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn start(storage: Arc<dyn Storage>, queue_limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = Arc::new(Counter::new());
        tokio::spawn(Self::run(storage, rx, queue_limit, errors.clone()));
        Self { tx, errors }
    }

    async fn run(
        storage: Arc<dyn Storage>,
        mut rx: mpsc::UnboundedReceiver<StoreOp>,
        queue_limit: usize,
        errors: Arc<Counter>,
    ) {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        while rx.recv_many(&mut batch, BATCH_SIZE).await > 0 {
            let mut flushes = Vec::new();
            for op in batch.drain(..) {
                let res = match op {
                    StoreOp::Session(s) => storage.store_session(&s).await,
                    StoreOp::DeleteSession(client_id) => storage.delete_session(&client_id).await,
                    StoreOp::Enqueue(client_id, msg) => storage.enqueue_message(&client_id, &msg, queue_limit).await,
                    StoreOp::Retain(r) => storage.store_retained(&r).await,
                    StoreOp::RemoveRetain(topic) => storage.remove_retained(&topic).await,
                    StoreOp::Flush(done) => {
                        flushes.push(done);
                        Ok(())
                    }
                };
                if let Err(e) = res {
                    errors.inc();
                    log::warn!("{} persistence write failed, continuing in memory, {:?}", storage.name(), e);
                }
            }
            if !flushes.is_empty() {
                if let Err(e) = storage.flush().await {
                    errors.inc();
                    log::warn!("{} persistence flush failed, {:?}", storage.name(), e);
                }
                for done in flushes {
                    let _ = done.send(());
                }
            }
        }
        log::debug!("{} persister exited", storage.name());
    }

    #[inline]
    fn send(&self, op: StoreOp) {
        if let Err(e) = self.tx.send(op) {
            self.errors.inc();
            log::warn!("persister is closed, dropped {:?}", e.0);
        }
    }

    pub fn store_session(&self, session: StoredSession) {
        self.send(StoreOp::Session(Box::new(session)));
    }

    pub fn delete_session(&self, client_id: ClientId) {
        self.send(StoreOp::DeleteSession(client_id));
    }

    pub fn enqueue_message(&self, client_id: ClientId, msg: (From, Publish)) {
        self.send(StoreOp::Enqueue(client_id, Box::new(msg)));
    }

    pub fn store_retained(&self, retained: Retained) {
        self.send(StoreOp::Retain(Box::new(retained)));
    }

    pub fn remove_retained(&self, topic: TopicName) {
        self.send(StoreOp::RemoveRetain(topic));
    }

    /// Waits until every operation queued before this call was applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(StoreOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    /// Number of failed writes since startup.
    #[inline]
    pub fn errors(&self) -> isize {
        self.errors.count()
    }
}
