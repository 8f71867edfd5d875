//! Client sessions.
//!
//! A [`Session`] outlives its connections: it holds the subscriptions, the outbound
//! message queue and, while no connection owns it, the saved QoS handshake state.
//! The [`SessionStore`] creates, resumes, persists and expires sessions and keeps the
//! router in step with every session's subscription set.

use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::inflight::OutInflightMessage;
use crate::queue::MessageQueue;
use crate::router::Router;
use crate::storage::{Persister, Storage, StoredSession};
use crate::types::*;
use crate::utils::{timestamp_millis, Counter};

#[derive(Debug)]
pub struct SessionData {
    /// Identity of the connection that owns, or last owned, the session.
    pub id: Id,
    pub online: bool,
    pub subscriptions: HashMap<TopicFilter, SubscriptionEntry>,
    /// Unacknowledged outgoing messages, saved while offline.
    pub inflight: Vec<OutInflightMessage>,
    /// Incoming QoS 2 ids waiting for PUBREL, saved while offline.
    pub awaiting_rel: Vec<NonZeroU16>,
    pub last_will: Option<LastWill>,
    /// Will whose delay interval is still running.
    pub pending_will: Option<LastWill>,
    pub session_expiry_interval_secs: u32,
    pub clean_start: bool,
    pub disconnected_at: Option<TimestampMillis>,
}

pub struct Session {
    pub client_id: ClientId,
    pub created_at: TimestampMillis,
    pub queue: Arc<MessageQueue>,
    data: Mutex<SessionData>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session {:?}", self.data.lock().id)
    }
}

impl Session {
    fn new(id: Id, queue_cap: usize, session_expiry_interval_secs: u32, clean_start: bool) -> Self {
        Self {
            client_id: id.client_id.clone(),
            created_at: timestamp_millis(),
            queue: Arc::new(MessageQueue::new(queue_cap)),
            data: Mutex::new(SessionData {
                id,
                online: true,
                subscriptions: HashMap::default(),
                inflight: Vec::new(),
                awaiting_rel: Vec::new(),
                last_will: None,
                pending_will: None,
                session_expiry_interval_secs,
                clean_start,
                disconnected_at: None,
            }),
        }
    }

    #[inline]
    pub fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock()
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.data.lock().id.clone()
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.data.lock().online
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        self.data.lock().subscriptions.values().cloned().collect()
    }

    #[inline]
    pub fn session_expiry_interval_secs(&self) -> u32 {
        self.data.lock().session_expiry_interval_secs
    }

    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        let data = self.data.lock();
        match (data.online, data.disconnected_at) {
            (false, Some(at)) => at + data.session_expiry_interval_secs as i64 * 1000 <= now,
            _ => false,
        }
    }

    /// Saved handshake state for the connection that resumes the session.
    pub fn take_inflight(&self) -> (Vec<OutInflightMessage>, Vec<NonZeroU16>) {
        let mut data = self.data.lock();
        (std::mem::take(&mut data.inflight), std::mem::take(&mut data.awaiting_rel))
    }

    /// Takes the will still waiting for its delay, if any.
    pub fn take_pending_will(&self) -> Option<(Id, LastWill)> {
        let mut data = self.data.lock();
        let will = data.pending_will.take()?;
        Some((data.id.clone(), will))
    }

    /// Queues the session snapshot for writing. `handshake` is the live state of the
    /// owning connection; without it the state saved in the session is written.
    ///
    /// The snapshot is taken and handed to the persister while the message queue is
    /// locked, so it is ordered with every enqueue recorded by [`Queue::push_with`].
    ///
    /// [`Queue::push_with`]: crate::queue::Queue::push_with
    fn store(&self, persister: &Persister, handshake: Option<(Vec<OutInflightMessage>, Vec<NonZeroU16>)>) {
        let data = self.data.lock();
        let (inflight, awaiting_rel) =
            handshake.unwrap_or_else(|| (data.inflight.clone(), data.awaiting_rel.clone()));
        let mut stored = StoredSession {
            client_id: self.client_id.clone(),
            subscriptions: data.subscriptions.values().cloned().collect(),
            inflight,
            awaiting_rel,
            queued: Vec::new(),
            last_will: data.pending_will.clone().or_else(|| data.last_will.clone()),
            session_expiry_interval_secs: data.session_expiry_interval_secs,
            clean_start: data.clean_start,
            created_at: self.created_at,
            disconnected_at: data.disconnected_at,
        };
        self.queue.snapshot_with(|queued| {
            stored.queued = queued;
            persister.store_session(stored);
        });
    }

    pub fn to_info(&self) -> ClientInfo {
        let data = self.data.lock();
        ClientInfo {
            client_id: self.client_id.to_string(),
            node_id: data.id.node_id,
            conn_id: data.id.conn_id,
            username: data.id.username.as_ref().map(|u| u.to_string()),
            remote_addr: data.id.remote_addr.map(|a| a.to_string()),
            connected: data.online,
            clean_start: data.clean_start,
            session_expiry_interval_secs: data.session_expiry_interval_secs,
            subscriptions: data.subscriptions.len(),
            queued: self.queue.len(),
            inflight: data.inflight.len(),
            created_at: self.created_at,
            disconnected_at: data.disconnected_at,
        }
    }
}

/// Read-only view of one session for management.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub node_id: NodeId,
    pub conn_id: ConnId,
    pub username: Option<String>,
    pub remote_addr: Option<String>,
    pub connected: bool,
    pub clean_start: bool,
    pub session_expiry_interval_secs: u32,
    pub subscriptions: usize,
    pub queued: usize,
    /// Saved unacknowledged messages of an offline session.
    pub inflight: usize,
    pub created_at: TimestampMillis,
    pub disconnected_at: Option<TimestampMillis>,
}

/// What the caller must do with the will of a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WillAction {
    None,
    /// Publish right away.
    Publish(Id, LastWill),
    /// Publish after the delay unless the session is resumed or expires first.
    Delay(Duration),
}

pub struct SessionStore {
    sessions: DashMap<ClientId, Arc<Session>>,
    storage: Arc<dyn Storage>,
    persister: Persister,
    router: Arc<dyn Router>,
    queue_cap: usize,
    locks: DashMap<ClientId, Arc<tokio::sync::Mutex<()>>>,
    counter: Arc<Counter>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, persister: Persister, router: Arc<dyn Router>, queue_cap: usize) -> Self {
        Self {
            sessions: DashMap::default(),
            storage,
            persister,
            router,
            queue_cap,
            locks: DashMap::default(),
            counter: Arc::new(Counter::new()),
        }
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    #[inline]
    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    /// Serializes CONNECT handling for one client id.
    pub async fn connect_lock(&self, client_id: &ClientId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self.locks.entry(client_id.clone()).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Creates the session of a connecting client or resumes its previous one.
    ///
    /// The in-memory session wins; otherwise a session stored by an earlier broker run
    /// is loaded, its subscriptions re-registered and its queue restored. Returns the
    /// session and whether a previous session was present. Fails only when the
    /// persistence backend cannot be read or cleared.
    pub async fn create_or_resume(
        &self,
        id: &Id,
        clean_start: bool,
        session_expiry_interval_secs: u32,
        last_will: Option<LastWill>,
    ) -> std::result::Result<(Arc<Session>, bool), MqttError> {
        let client_id = &id.client_id;
        let existing = self.get(client_id);

        if clean_start {
            if let Some(old) = existing {
                self.terminate(&old).await;
            }
            self.storage.delete_session(client_id).await.map_err(|e| MqttError::StorageUnavailable(e.to_string()))?;
            let s = self.insert_new(id, session_expiry_interval_secs, clean_start, last_will);
            return Ok((s, false));
        }

        if let Some(s) = existing {
            if !s.is_expired(timestamp_millis()) {
                {
                    let mut data = s.data();
                    data.id = id.clone();
                    data.online = true;
                    data.last_will = last_will;
                    data.pending_will = None;
                    data.session_expiry_interval_secs = session_expiry_interval_secs;
                    data.clean_start = clean_start;
                    data.disconnected_at = None;
                }
                self.persist(&s);
                log::debug!("{:?} session resumed from memory", id);
                return Ok((s, true));
            }
            self.terminate(&s).await;
        }

        //writes still queued for this client must land before the backend is read
        self.persister.flush().await;
        let stored = self.storage.load_session(client_id).await.map_err(|e| MqttError::StorageUnavailable(e.to_string()))?;
        match stored {
            Some(stored) if !stored.is_expired(timestamp_millis()) => {
                let s = self.insert_new(id, session_expiry_interval_secs, clean_start, last_will);
                self.restore(&s, stored).await;
                self.persist(&s);
                log::debug!("{:?} session resumed from {} storage", id, self.storage.name());
                Ok((s, true))
            }
            Some(_) => {
                self.storage.delete_session(client_id).await.map_err(|e| MqttError::StorageUnavailable(e.to_string()))?;
                Ok((self.insert_new(id, session_expiry_interval_secs, clean_start, last_will), false))
            }
            None => Ok((self.insert_new(id, session_expiry_interval_secs, clean_start, last_will), false)),
        }
    }

    fn insert_new(
        &self,
        id: &Id,
        session_expiry_interval_secs: u32,
        clean_start: bool,
        last_will: Option<LastWill>,
    ) -> Arc<Session> {
        let s = Arc::new(Session::new(id.clone(), self.queue_cap, session_expiry_interval_secs, clean_start));
        s.data().last_will = last_will;
        if self.sessions.insert(id.client_id.clone(), s.clone()).is_none() {
            self.counter.inc();
        }
        log::debug!("{:?} session created", id);
        s
    }

    async fn restore(&self, s: &Session, stored: StoredSession) {
        for entry in stored.subscriptions {
            if let Err(e) = self.router.add(&s.client_id, entry.clone()).await {
                log::warn!("{:?} restore subscription {} error, {:?}", s.id(), entry.topic_filter, e);
                continue;
            }
            s.data().subscriptions.insert(entry.topic_filter.clone(), entry);
        }
        {
            let mut data = s.data();
            data.inflight = stored.inflight;
            data.awaiting_rel = stored.awaiting_rel;
        }
        s.queue.push_front_all(stored.queued);
    }

    /// Adds or replaces a subscription in both the session and the router.
    pub async fn subscribe(&self, s: &Session, entry: SubscriptionEntry) -> crate::Result<Option<SubscriptionEntry>> {
        self.router.add(&s.client_id, entry.clone()).await?;
        Ok(s.data().subscriptions.insert(entry.topic_filter.clone(), entry))
    }

    pub async fn unsubscribe(&self, s: &Session, topic_filter: &TopicFilter) -> crate::Result<bool> {
        let removed = s.data().subscriptions.remove(topic_filter).is_some();
        if removed {
            self.router.remove(&s.client_id, topic_filter).await?;
        }
        Ok(removed)
    }

    /// Rebuilds the sessions stored by an earlier run as offline sessions, re-registering
    /// their subscriptions. Expired ones are deleted instead. A session that was still
    /// connected when it was stored counts as disconnected now.
    pub async fn restore_all(&self, node_id: NodeId, stored: Vec<StoredSession>) -> usize {
        let now = timestamp_millis();
        let mut restored = 0;
        for mut stored in stored {
            stored.disconnected_at = Some(stored.disconnected_at.unwrap_or(now));
            if stored.is_expired(now) || self.sessions.contains_key(&stored.client_id) {
                if stored.is_expired(now) {
                    self.persister.delete_session(stored.client_id.clone());
                }
                continue;
            }
            let id = Id::new(node_id, 0, stored.client_id.clone(), None, None);
            let s = self.insert_new(&id, stored.session_expiry_interval_secs, stored.clean_start, None);
            {
                let mut data = s.data();
                data.online = false;
                data.disconnected_at = stored.disconnected_at;
                data.pending_will = stored.last_will.take();
            }
            self.restore(&s, stored).await;
            restored += 1;
        }
        restored
    }

    /// Whether `s` is still the session registered for its client id.
    #[inline]
    fn is_current(&self, s: &Arc<Session>) -> bool {
        self.get(&s.client_id).is_some_and(|cur| Arc::ptr_eq(&cur, s))
    }

    /// Writes the session snapshot behind the publish path. Sessions that end with their
    /// connection, or were already replaced, are never written.
    pub fn persist(&self, s: &Arc<Session>) {
        if s.session_expiry_interval_secs() == 0 || !self.is_current(s) {
            return;
        }
        s.store(&self.persister, None);
    }

    /// Writes the snapshot of a connected session with the connection's handshake state.
    /// Ignored unless `conn_id` still owns the session.
    pub fn checkpoint(
        &self,
        s: &Arc<Session>,
        conn_id: ConnId,
        inflight: Vec<OutInflightMessage>,
        awaiting_rel: Vec<NonZeroU16>,
    ) {
        if s.session_expiry_interval_secs() == 0 || !self.is_current(s) {
            return;
        }
        if s.data().id.conn_id != conn_id {
            return;
        }
        s.store(&self.persister, Some((inflight, awaiting_rel)));
    }

    /// Detaches the session from a closed connection.
    ///
    /// The handshake state of the connection is saved into the session. A session with
    /// a zero expiry interval ends here; any other is persisted and stays for resume.
    pub async fn disconnect(
        &self,
        s: &Arc<Session>,
        conn_id: ConnId,
        inflight: Vec<OutInflightMessage>,
        awaiting_rel: Vec<NonZeroU16>,
        publish_will: bool,
    ) -> WillAction {
        if !self.is_current(s) {
            log::debug!("{:?} session already replaced, conn_id: {}", s.id(), conn_id);
            return WillAction::None;
        }
        let (will, expiry) = {
            let mut data = s.data();
            if data.id.conn_id != conn_id || !data.online {
                log::debug!("{:?} session already taken over, conn_id: {}", data.id, conn_id);
                return WillAction::None;
            }
            data.online = false;
            data.disconnected_at = Some(timestamp_millis());
            data.inflight = inflight;
            data.awaiting_rel = awaiting_rel;
            let will = data.last_will.take().filter(|_| publish_will);
            (will, data.session_expiry_interval_secs)
        };

        let action = match will {
            None => WillAction::None,
            Some(will) => match will.will_delay_interval_sec.filter(|d| *d > 0 && expiry > 0) {
                Some(delay) => {
                    s.data().pending_will = Some(will);
                    WillAction::Delay(Duration::from_secs(delay.min(expiry) as u64))
                }
                None => WillAction::Publish(s.id(), will),
            },
        };

        if expiry == 0 {
            self.terminate(s).await;
        } else {
            self.persist(s);
        }
        action
    }

    /// Removes an offline session whose expiry interval elapsed. Returns the delayed
    /// will that must now be published, if one was still pending.
    pub async fn expire(&self, client_id: &ClientId) -> Option<Option<(Id, LastWill)>> {
        let s = self.get(client_id)?;
        if !s.is_expired(timestamp_millis()) {
            return None;
        }
        log::debug!("{:?} session expired", s.id());
        let will = s.take_pending_will();
        self.terminate(&s).await;
        Some(will)
    }

    /// Expires every due session, returning the client ids removed and their pending wills.
    pub async fn remove_expired(&self) -> Vec<(ClientId, Option<(Id, LastWill)>)> {
        let now = timestamp_millis();
        let expired =
            self.sessions.iter().filter(|e| e.value().is_expired(now)).map(|e| e.key().clone()).collect::<Vec<_>>();
        let mut removed = Vec::new();
        for client_id in expired {
            if let Some(will) = self.expire(&client_id).await {
                removed.push((client_id, will));
            }
        }
        removed
    }

    /// Ends the session: drops it from memory, the router and the backend.
    pub async fn terminate(&self, s: &Arc<Session>) {
        let removed = self.sessions.remove_if(&s.client_id, |_, v| Arc::ptr_eq(v, s)).is_some();
        if !removed {
            return;
        }
        self.counter.dec();
        let subs = s.data().subscriptions.drain().map(|(tf, _)| tf).collect::<Vec<_>>();
        for tf in subs {
            if let Err(e) = self.router.remove(&s.client_id, &tf).await {
                log::warn!("{:?} remove subscription {} error, {:?}", s.id(), tf, e);
            }
        }
        s.queue.drain();
        self.persister.delete_session(s.client_id.clone());
        self.locks.remove_if(&s.client_id, |_, l| Arc::strong_count(l) == 1);
        log::debug!("{:?} session terminated", s.id());
    }

    /// Snapshot of at most `limit` sessions.
    pub fn clients(&self, limit: usize) -> Vec<ClientInfo> {
        self.sessions.iter().take(limit).map(|e| e.value().to_info()).collect()
    }

    /// Every session currently held in memory.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    #[inline]
    pub fn count(&self) -> Counter {
        self.counter.as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::router::DefaultRouter;
    use crate::storage::MemoryStorage;

    struct Fixture {
        store: SessionStore,
        storage: Arc<MemoryStorage>,
        router: Arc<DefaultRouter>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let router = Arc::new(DefaultRouter::new());
        let persister = Persister::start(storage.clone(), 100);
        let store = SessionStore::new(storage.clone(), persister, router.clone(), 100);
        Fixture { store, storage, router }
    }

    fn id(client_id: &'static str, conn_id: ConnId) -> Id {
        Id::new(0, conn_id, ClientId::from_static(client_id), None, None)
    }

    fn entry(filter: &'static str) -> SubscriptionEntry {
        SubscriptionEntry::new(TopicFilter::from_static(filter), SubscriptionOptions::qos(QoS::AtLeastOnce), None)
    }

    fn will(delay: Option<u32>) -> LastWill {
        LastWill {
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: TopicName::from_static("status"),
            message: Bytes::from_static(b"gone"),
            will_delay_interval_sec: delay,
            properties: PublishProperties::default(),
        }
    }

    async fn matched(router: &DefaultRouter, topic: &'static str) -> usize {
        let from = From::from_system(Id::system(0));
        router.matches(&from, &TopicName::from_static(topic)).await.unwrap().len()
    }

    #[tokio::test]
    async fn resume_keeps_subscriptions_and_queue() {
        let f = fixture();
        let (s, present) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        assert!(!present);
        f.store.subscribe(&s, entry("a/+")).await.unwrap();
        f.store.disconnect(&s, 1, Vec::new(), Vec::new(), true).await;
        assert!(!s.is_online());

        let (from, p) = (From::from_system(Id::system(0)), Publish::new("a/1", Bytes::new(), QoS::AtLeastOnce, false));
        s.queue.push((from, p), crate::queue::Policy::Early).unwrap();

        let (s2, present) = f.store.create_or_resume(&id("c1", 2), false, 60, None).await.unwrap();
        assert!(present);
        assert!(Arc::ptr_eq(&s, &s2));
        assert_eq!(s2.id().conn_id, 2);
        assert_eq!(s2.subscriptions().len(), 1);
        assert_eq!(s2.queue.len(), 1);
        assert_eq!(matched(&f.router, "a/x").await, 1);
    }

    #[tokio::test]
    async fn clean_start_discards_previous_state() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        f.store.subscribe(&s, entry("a/+")).await.unwrap();
        f.store.disconnect(&s, 1, Vec::new(), Vec::new(), false).await;

        let (s2, present) = f.store.create_or_resume(&id("c1", 2), true, 60, None).await.unwrap();
        assert!(!present);
        assert!(!Arc::ptr_eq(&s, &s2));
        assert!(s2.subscriptions().is_empty());
        assert_eq!(matched(&f.router, "a/x").await, 0);
    }

    #[tokio::test]
    async fn resume_from_storage() {
        let f = fixture();
        let mut stored = StoredSession::new(ClientId::from_static("c1"), 60, false);
        stored.subscriptions.push(entry("x/#"));
        stored.disconnected_at = Some(timestamp_millis());
        stored.awaiting_rel.push(NonZeroU16::MIN);
        stored.queued.push((From::from_system(Id::system(0)), Publish::new("x/1", Bytes::new(), QoS::AtLeastOnce, false)));
        f.storage.store_session(&stored).await.unwrap();

        let (s, present) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        assert!(present);
        assert_eq!(s.queue.len(), 1);
        assert_eq!(s.take_inflight().1, vec![NonZeroU16::MIN]);
        assert_eq!(matched(&f.router, "x/y").await, 1);
    }

    #[tokio::test]
    async fn zero_expiry_ends_with_connection() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), true, 0, Some(will(None))).await.unwrap();
        f.store.subscribe(&s, entry("a/b")).await.unwrap();
        let action = f.store.disconnect(&s, 1, Vec::new(), Vec::new(), true).await;
        assert!(matches!(action, WillAction::Publish(_, w) if w.topic == "status"));
        assert!(f.store.get(&ClientId::from_static("c1")).is_none());
        assert_eq!(matched(&f.router, "a/b").await, 0);
        assert_eq!(f.store.count().count(), 0);
    }

    #[tokio::test]
    async fn clean_stop_suppresses_will() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 60, Some(will(None))).await.unwrap();
        assert_eq!(f.store.disconnect(&s, 1, Vec::new(), Vec::new(), false).await, WillAction::None);
        assert_eq!(s.take_pending_will(), None);
    }

    #[tokio::test]
    async fn delayed_will_cancelled_by_resume() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 60, Some(will(Some(5)))).await.unwrap();
        let action = f.store.disconnect(&s, 1, Vec::new(), Vec::new(), true).await;
        assert_eq!(action, WillAction::Delay(Duration::from_secs(5)));
        assert!(s.data().pending_will.is_some());
        f.store.create_or_resume(&id("c1", 2), false, 60, None).await.unwrap();
        assert_eq!(s.take_pending_will(), None);
    }

    #[tokio::test]
    async fn expire_publishes_pending_will() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 1, Some(will(Some(30)))).await.unwrap();
        f.store.subscribe(&s, entry("a/b")).await.unwrap();
        assert_eq!(f.store.disconnect(&s, 1, Vec::new(), Vec::new(), true).await, WillAction::Delay(Duration::from_secs(1)));
        assert!(f.store.expire(&s.client_id).await.is_none());

        s.data().disconnected_at = Some(timestamp_millis() - 2000);
        let removed = f.store.remove_expired().await;
        assert_eq!(removed.len(), 1);
        assert!(matches!(&removed[0].1, Some((_, w)) if w.topic == "status"));
        assert!(f.store.get(&s.client_id).is_none());
        assert_eq!(matched(&f.router, "a/b").await, 0);

        f.store.persister().flush().await;
        assert_eq!(f.storage.load_session(&s.client_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_disconnect_is_ignored() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        f.store.create_or_resume(&id("c1", 2), false, 60, None).await.unwrap();
        assert_eq!(f.store.disconnect(&s, 1, Vec::new(), Vec::new(), true).await, WillAction::None);
        assert!(s.is_online());
        assert_eq!(f.store.clients(10).len(), 1);
    }

    fn unacked(packet_id: u16) -> OutInflightMessage {
        let mut p = Publish::new("a/1", Bytes::from_static(b"x"), QoS::AtLeastOnce, false);
        p.packet_id = NonZeroU16::new(packet_id);
        OutInflightMessage::new(crate::inflight::MomentStatus::UnAck, From::from_system(Id::system(0)), p)
    }

    #[tokio::test]
    async fn checkpoint_writes_connection_handshake() {
        let f = fixture();
        let (s, _) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        f.store.subscribe(&s, entry("a/+")).await.unwrap();
        f.store.checkpoint(&s, 1, vec![unacked(1)], vec![NonZeroU16::MIN]);
        f.store.checkpoint(&s, 9, vec![unacked(1), unacked(2)], Vec::new());
        f.store.persister().flush().await;

        let stored = f.storage.load_session(&s.client_id).await.unwrap().unwrap();
        assert_eq!(stored.inflight.iter().map(|m| m.packet_id()).collect::<Vec<_>>(), vec![Some(1)]);
        assert_eq!(stored.awaiting_rel, vec![NonZeroU16::MIN]);
        assert_eq!(stored.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn replaced_session_is_never_written() {
        let f = fixture();
        let (old, _) = f.store.create_or_resume(&id("c1", 1), false, 60, None).await.unwrap();
        f.store.subscribe(&old, entry("a/+")).await.unwrap();
        //a clean start that did not wait for the old connection to detach
        let (new, present) = f.store.create_or_resume(&id("c1", 2), true, 60, None).await.unwrap();
        assert!(!present);

        f.store.checkpoint(&old, 1, vec![unacked(1)], Vec::new());
        assert_eq!(f.store.disconnect(&old, 1, Vec::new(), Vec::new(), true).await, WillAction::None);
        f.store.persister().flush().await;
        assert_eq!(f.storage.load_session(&ClientId::from_static("c1")).await.unwrap(), None);
        assert!(new.is_online());
        assert_eq!(matched(&f.router, "a/x").await, 0);
    }
}
