use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::alias::{alias_policy_factory, AliasPolicyFactory};
use crate::cluster::ClusterForwarder;
use crate::conf::{PersistenceType, Settings};
use crate::hook::{Handler, HookManager, Type};
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::router::{DefaultRouter, Router};
use crate::session::{ClientInfo, SessionStore};
use crate::shared::Peers;
use crate::stats::Stats;
use crate::storage::{MemoryStorage, Persister, Storage};
use crate::types::{ConnId, NodeId};
use crate::Result;

/// Everything a connection needs, shared by all of them.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub router: Arc<dyn Router>,
    pub retain: Arc<dyn RetainStorage>,
    pub sessions: SessionStore,
    pub storage: Arc<dyn Storage>,
    pub persister: Persister,
    pub hooks: HookManager,
    pub alias_policy: Arc<dyn AliasPolicyFactory>,
    pub cluster: Option<Arc<dyn ClusterForwarder>>,
    pub peers: Peers,
    pub stats: Stats,
    conn_ids: AtomicU64,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(settings: Settings) -> ServerContextBuilder {
        ServerContextBuilder::new(settings)
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.settings.node.id
    }

    #[inline]
    pub fn next_conn_id(&self) -> ConnId {
        self.conn_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Snapshot of at most `limit` sessions, online or not.
    pub fn clients(&self, limit: usize) -> Vec<ClientInfo> {
        self.sessions.clients(limit)
    }

    pub fn stats_json(&self) -> serde_json::Value {
        self.stats.to_json(self)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

/// Explicit startup composition: storage backend, hooks, alias policy and cluster
/// forwarder are registered here before the context is built.
pub struct ServerContextBuilder {
    settings: Settings,
    storage: Option<Arc<dyn Storage>>,
    router: Option<Arc<dyn Router>>,
    hooks: HookManager,
    alias_policy: Option<Arc<dyn AliasPolicyFactory>>,
    cluster: Option<Arc<dyn ClusterForwarder>>,
}

impl ServerContextBuilder {
    pub fn new(settings: Settings) -> Self {
        Self { settings, storage: None, router: None, hooks: HookManager::new(), alias_policy: None, cluster: None }
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn hook(mut self, typ: Type, handler: Box<dyn Handler>) -> Self {
        self.hooks.add(typ, handler);
        self
    }

    pub fn alias_policy(mut self, factory: Arc<dyn AliasPolicyFactory>) -> Self {
        self.alias_policy = Some(factory);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterForwarder>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Fails only when the persistence backend cannot be reached or read.
    pub async fn build(self) -> Result<ServerContext> {
        let settings = self.settings;
        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => {
                if settings.persistence.typ != PersistenceType::Memory {
                    return Err(anyhow!(
                        "persistence {:?} is configured but no storage backend was registered",
                        settings.persistence.typ
                    ));
                }
                Arc::new(MemoryStorage::new())
            }
        };
        storage.ping().await.map_err(|e| anyhow!("{} storage is unreachable, {}", storage.name(), e))?;

        let persister = Persister::start(storage.clone(), settings.mqtt.max_mqueue_len);
        let router = self.router.unwrap_or_else(|| Arc::new(DefaultRouter::new()));

        let retain = DefaultRetainStorage::new(settings.mqtt.retain_available, Some(persister.clone()));
        if settings.mqtt.retain_available {
            let retaineds = storage.load_retained().await?;
            let n = retain.warm(retaineds);
            log::info!("{} retained messages loaded from {} storage", n, storage.name());
        }

        let sessions = SessionStore::new(storage.clone(), persister.clone(), router.clone(), settings.mqtt.max_mqueue_len);
        let stored = storage.load_sessions().await?;
        let n = sessions.restore_all(settings.node.id, stored).await;
        log::info!("{} sessions restored from {} storage", n, storage.name());
        let alias_policy = self.alias_policy.unwrap_or_else(|| alias_policy_factory(settings.topic_alias_manager.typ));
        log::info!("topic alias policy is {}", alias_policy.name());

        Ok(ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                router,
                retain: Arc::new(retain),
                sessions,
                storage,
                persister,
                hooks: self.hooks,
                alias_policy,
                cluster: self.cluster,
                peers: Peers::new(),
                stats: Stats::new(),
                conn_ids: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::conf::Inner;
    use crate::retain::Retained;
    use crate::storage::StoredSession;
    use crate::types::*;

    struct Unreachable;

    #[async_trait]
    impl Storage for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        async fn ping(&self) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn load_session(&self, _: &ClientId) -> Result<Option<StoredSession>> {
            Err(anyhow!("connection refused"))
        }
        async fn load_sessions(&self) -> Result<Vec<StoredSession>> {
            Err(anyhow!("connection refused"))
        }
        async fn store_session(&self, _: &StoredSession) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn delete_session(&self, _: &ClientId) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn enqueue_message(&self, _: &ClientId, _: &(From, Publish), _: usize) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn dequeue_messages(&self, _: &ClientId) -> Result<Vec<(From, Publish)>> {
            Err(anyhow!("connection refused"))
        }
        async fn store_retained(&self, _: &Retained) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn remove_retained(&self, _: &TopicName) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn load_retained(&self) -> Result<Vec<Retained>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn unreachable_storage_is_fatal() {
        let res = ServerContext::new(Settings::default()).storage(Arc::new(Unreachable)).build().await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn sled_without_backend_is_fatal() {
        let mut inner = Inner::default();
        inner.persistence.typ = PersistenceType::Sled;
        assert!(ServerContext::new(inner.into()).build().await.is_err());
    }

    #[tokio::test]
    async fn retained_messages_are_warmed_at_startup() {
        let storage = Arc::new(MemoryStorage::new());
        let from = From::from_system(Id::system(0));
        let p = Publish::new("cfg/mode", Bytes::from_static(b"eco"), QoS::AtLeastOnce, true);
        storage.store_retained(&Retained::new(from, p, std::time::Duration::ZERO)).await.unwrap();

        let scx = ServerContext::new(Settings::default()).storage(storage).build().await.unwrap();
        assert_eq!(scx.retain.count(), 1);
        assert_eq!(scx.retain.get(&TopicFilter::from_static("cfg/#")).await.unwrap().len(), 1);
        assert_eq!(scx.next_conn_id(), 1);
        assert_eq!(scx.next_conn_id(), 2);
        assert_eq!(scx.stats_json()["retaineds"]["count"], 1);
    }

    #[tokio::test]
    async fn stored_sessions_are_rebuilt_offline() {
        let storage = Arc::new(MemoryStorage::new());
        let mut live = StoredSession::new(ClientId::from_static("live"), 300, false);
        live.subscriptions.push(SubscriptionEntry::new(
            TopicFilter::from_static("a/#"),
            SubscriptionOptions::qos(QoS::AtLeastOnce),
            None,
        ));
        storage.store_session(&live).await.unwrap();
        let mut stale = StoredSession::new(ClientId::from_static("stale"), 1, false);
        stale.disconnected_at = Some(1_000);
        storage.store_session(&stale).await.unwrap();

        let scx = ServerContext::new(Settings::default()).storage(storage.clone()).build().await.unwrap();
        let s = scx.sessions.get(&ClientId::from_static("live")).unwrap();
        assert!(!s.is_online());
        assert_eq!(s.subscriptions().len(), 1);
        assert!(scx.sessions.get(&ClientId::from_static("stale")).is_none());
        let from = From::from_system(Id::system(0));
        assert_eq!(scx.router.matches(&from, &TopicName::from_static("a/1")).await.unwrap().len(), 1);

        scx.persister.flush().await;
        assert_eq!(storage.load_session(&ClientId::from_static("stale")).await.unwrap(), None);
    }
}
