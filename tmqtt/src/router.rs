//! Subscription routing.
//!
//! The topic trie only records which filters exist; the subscribers of each filter live
//! in a sharded relation map next to it. The trie changes only when a filter gains its
//! first or loses its last subscriber, and both structures are updated while the
//! filter's relation shard is held, so they never disagree. Matching reads the trie,
//! releases it, then visits the relation shards of the matched filters.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::*;
use crate::utils::Counter;
use crate::Result;

/// Subscribers of one filter, keyed by client id.
pub type Relations = HashMap<ClientId, SubscriptionEntry>;
pub type AllRelationsMap = DashMap<TopicFilter, Relations>;

/// One subscriber selected for a published topic.
///
/// When several filters of the same client match, they are merged into one delivery at
/// the highest granted QoS, carrying every matching subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberMatch {
    pub client_id: ClientId,
    pub topic_filter: TopicFilter,
    pub opts: SubscriptionOptions,
    pub sub_ids: Vec<SubscriptionIdentifier>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub client_id: ClientId,
    pub topic_filter: TopicFilter,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub id: Option<u32>,
}

#[async_trait]
pub trait Router: Sync + Send {
    /// Adds or replaces the client's subscription, returning the one it replaced.
    async fn add(&self, client_id: &ClientId, entry: SubscriptionEntry) -> Result<Option<SubscriptionEntry>>;

    /// Removes the client's subscription to `topic_filter`.
    async fn remove(&self, client_id: &ClientId, topic_filter: &str) -> Result<bool>;

    /// Subscribers that should receive a message published by `from` to `topic`.
    async fn matches(&self, from: &From, topic: &TopicName) -> Result<Vec<SubscriberMatch>>;

    /// Read-only snapshot of at most `limit` subscription relations.
    async fn list_relations(&self, limit: usize) -> Vec<RelationInfo>;

    ///Number of distinct subscribed topic filters
    fn topics(&self) -> Counter;

    ///Number of subscription relations
    fn routes(&self) -> Counter;
}

#[derive(Clone, Default)]
pub struct DefaultRouter {
    topics: Arc<RwLock<TopicTree<TopicFilter>>>,
    topics_count: Arc<Counter>,
    relations: Arc<AllRelationsMap>,
    relations_count: Arc<Counter>,
}

impl DefaultRouter {
    #[inline]
    pub fn new() -> DefaultRouter {
        Self::default()
    }

    fn _matches(&self, from: &From, topic_name: &TopicName) -> Vec<SubscriberMatch> {
        let filters = self.topics.read().matches(topic_name).into_iter().cloned().collect::<Vec<_>>();

        let mut collected: HashMap<ClientId, SubscriberMatch> = HashMap::default();
        for topic_filter in filters {
            let Some(rels) = self.relations.get(&topic_filter) else {
                continue;
            };
            for (client_id, entry) in rels.iter() {
                //MQTT V5: No Local
                if entry.opts.no_local && from.is_custom() && from.client_id() == client_id {
                    continue;
                }
                match collected.get_mut(client_id) {
                    Some(m) => {
                        if entry.opts.qos > m.opts.qos {
                            m.opts = entry.opts;
                            m.topic_filter = topic_filter.clone();
                        }
                        if let Some(id) = entry.id {
                            m.sub_ids.push(id);
                        }
                    }
                    None => {
                        collected.insert(
                            client_id.clone(),
                            SubscriberMatch {
                                client_id: client_id.clone(),
                                topic_filter: topic_filter.clone(),
                                opts: entry.opts,
                                sub_ids: entry.id.into_iter().collect(),
                            },
                        );
                    }
                }
            }
        }
        log::debug!("{:?} {} matched {} subscribers", from.id, topic_name, collected.len());
        collected.into_values().collect()
    }
}

#[async_trait]
impl Router for DefaultRouter {
    async fn add(&self, client_id: &ClientId, entry: SubscriptionEntry) -> Result<Option<SubscriptionEntry>> {
        log::debug!("{} add, topic_filter: {:?}", client_id, entry.topic_filter);
        let topic_filter = entry.topic_filter.clone();
        topic_filter.parse::<Topic>()?;

        let mut rels = self.relations.entry(topic_filter.clone()).or_insert_with(|| {
            self.topics.write().insert(&topic_filter, topic_filter.clone());
            self.topics_count.inc();
            HashMap::default()
        });
        let old = rels.insert(client_id.clone(), entry);
        if old.is_none() {
            self.relations_count.inc();
        }
        Ok(old)
    }

    async fn remove(&self, client_id: &ClientId, topic_filter: &str) -> Result<bool> {
        let mut removed = false;
        self.relations.remove_if_mut(topic_filter, |_, rels| {
            removed = rels.remove(client_id).is_some();
            if removed {
                self.relations_count.dec();
            }
            if rels.is_empty() {
                self.topics.write().remove(topic_filter);
                self.topics_count.dec();
                true
            } else {
                false
            }
        });
        log::debug!("{} remove, topic_filter: {:?}, removed: {}", client_id, topic_filter, removed);
        Ok(removed)
    }

    #[inline]
    async fn matches(&self, from: &From, topic: &TopicName) -> Result<Vec<SubscriberMatch>> {
        Ok(self._matches(from, topic))
    }

    async fn list_relations(&self, limit: usize) -> Vec<RelationInfo> {
        self.relations
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .map(|(client_id, entry)| RelationInfo {
                        client_id: client_id.clone(),
                        topic_filter: e.key().clone(),
                        qos: entry.opts.qos.value(),
                        no_local: entry.opts.no_local,
                        retain_as_published: entry.opts.retain_as_published,
                        id: entry.id.map(|id| id.get()),
                    })
                    .collect::<Vec<_>>()
            })
            .take(limit)
            .collect()
    }

    #[inline]
    fn topics(&self) -> Counter {
        self.topics_count.as_ref().clone()
    }

    #[inline]
    fn routes(&self) -> Counter {
        self.relations_count.as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &'static str) -> ClientId {
        ClientId::from_static(id)
    }

    fn from(client_id: &'static str) -> From {
        From::from_custom(Id::new(0, 1, client(client_id), None, None))
    }

    fn entry(filter: &'static str, qos: QoS) -> SubscriptionEntry {
        SubscriptionEntry::new(TopicFilter::from_static(filter), SubscriptionOptions::qos(qos), None)
    }

    async fn matched(router: &DefaultRouter, publisher: &'static str, topic: &'static str) -> Vec<SubscriberMatch> {
        let mut m = router.matches(&from(publisher), &TopicName::from_static(topic)).await.unwrap();
        m.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        m
    }

    #[tokio::test]
    async fn single_level_wildcard() {
        let router = DefaultRouter::new();
        router.add(&client("c1"), entry("sensors/+/temp", QoS::AtLeastOnce)).await.unwrap();

        let m = matched(&router, "p", "sensors/room1/temp").await;
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].client_id, "c1");
        assert_eq!(m[0].opts.qos, QoS::AtLeastOnce);

        assert!(matched(&router, "p", "sensors/room1/humidity").await.is_empty());
        assert!(matched(&router, "p", "sensors/room1/temp/x").await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once_at_highest_qos() {
        let router = DefaultRouter::new();
        let c1 = client("c1");
        router.add(&c1, entry("a/#", QoS::AtMostOnce)).await.unwrap();
        let mut e = entry("a/+", QoS::ExactlyOnce);
        e.id = SubscriptionIdentifier::new(7);
        router.add(&c1, e).await.unwrap();
        let mut e = entry("a/b", QoS::AtLeastOnce);
        e.id = SubscriptionIdentifier::new(9);
        router.add(&c1, e).await.unwrap();
        router.add(&client("c2"), entry("#", QoS::AtLeastOnce)).await.unwrap();

        let m = matched(&router, "p", "a/b").await;
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].client_id, "c1");
        assert_eq!(m[0].opts.qos, QoS::ExactlyOnce);
        assert_eq!(m[0].topic_filter, "a/+");
        let mut ids = m[0].sub_ids.iter().map(|id| id.get()).collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec![7, 9]);
        assert_eq!(m[1].client_id, "c2");
    }

    #[tokio::test]
    async fn no_local_skips_publisher() {
        let router = DefaultRouter::new();
        let mut e = entry("chat/#", QoS::AtLeastOnce);
        e.opts.no_local = true;
        router.add(&client("c1"), e).await.unwrap();
        router.add(&client("c2"), entry("chat/#", QoS::AtLeastOnce)).await.unwrap();

        let m = matched(&router, "c1", "chat/room").await;
        assert_eq!(m.iter().map(|m| m.client_id.clone()).collect::<Vec<_>>(), vec![client("c2")]);

        let will = From::from_last_will(Id::new(0, 1, client("c1"), None, None));
        let m = router.matches(&will, &TopicName::from_static("chat/room")).await.unwrap();
        assert_eq!(m.len(), 2);
    }

    #[tokio::test]
    async fn dollar_topics_excluded_from_leading_wildcards() {
        let router = DefaultRouter::new();
        router.add(&client("all"), entry("#", QoS::AtMostOnce)).await.unwrap();
        router.add(&client("sys"), entry("$SYS/#", QoS::AtMostOnce)).await.unwrap();

        let m = matched(&router, "p", "$SYS/uptime").await;
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].client_id, "sys");
    }

    #[tokio::test]
    async fn add_replace_and_remove() {
        let router = DefaultRouter::new();
        let c1 = client("c1");
        assert!(router.add(&c1, entry("x/y", QoS::AtMostOnce)).await.unwrap().is_none());
        let old = router.add(&c1, entry("x/y", QoS::AtLeastOnce)).await.unwrap();
        assert_eq!(old.map(|e| e.opts.qos), Some(QoS::AtMostOnce));
        router.add(&client("c2"), entry("x/y", QoS::AtMostOnce)).await.unwrap();
        assert_eq!(router.topics().count(), 1);
        assert_eq!(router.routes().count(), 2);
        assert_eq!(router.list_relations(10).await.len(), 2);
        assert_eq!(router.list_relations(1).await.len(), 1);

        assert!(router.remove(&c1, "x/y").await.unwrap());
        assert!(!router.remove(&c1, "x/y").await.unwrap());
        assert_eq!(router.topics().count(), 1);
        assert!(router.remove(&client("c2"), "x/y").await.unwrap());
        assert_eq!(router.topics().count(), 0);
        assert_eq!(router.routes().count(), 0);
        assert!(matched(&router, "p", "x/y").await.is_empty());
        assert!(router.topics.read().is_empty());
    }

    #[tokio::test]
    async fn invalid_filter_rejected() {
        let router = DefaultRouter::new();
        assert!(router.add(&client("c1"), entry("a/#/b", QoS::AtMostOnce)).await.is_err());
        assert_eq!(router.topics().count(), 0);
    }
}
