//! Topic aliases, one table per connection and direction.
//!
//! Inbound aliases are chosen by the client and only checked and resolved here.
//! Outbound aliases are chosen by an [`AliasPolicy`] created per connection from the
//! [`AliasPolicyFactory`] registered on the server context.

use std::num::NonZeroU16;
use std::sync::Arc;

use rust_box::dequemap::DequeBTreeMap as DequeMap;

use crate::conf::AliasPolicyType;
use crate::types::{HashMap, Publish, TopicName};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("topic alias {0} is greater than topic alias maximum {1}")]
    OutOfRange(u16, u16),
    #[error("topic alias {0} is not bound to a topic")]
    Unbound(u16),
    #[error("empty topic name without topic alias")]
    EmptyTopic,
}

/// Aliases bound by the client on PUBLISH packets it sends.
#[derive(Debug, Default)]
pub struct ClientTopicAliases {
    max: u16,
    aliases: HashMap<u16, TopicName>,
}

impl ClientTopicAliases {
    pub fn new(max: u16) -> Self {
        Self { max, aliases: HashMap::default() }
    }

    /// Returns the topic the publish is addressed to, binding `alias` when the publish
    /// carries both a topic and an alias.
    pub fn resolve(&mut self, topic: &TopicName, alias: Option<NonZeroU16>) -> Result<TopicName, AliasError> {
        let Some(alias) = alias else {
            if topic.is_empty() {
                return Err(AliasError::EmptyTopic);
            }
            return Ok(topic.clone());
        };
        let alias = alias.get();
        if alias > self.max {
            return Err(AliasError::OutOfRange(alias, self.max));
        }
        if topic.is_empty() {
            self.aliases.get(&alias).cloned().ok_or(AliasError::Unbound(alias))
        } else {
            self.aliases.insert(alias, topic.clone());
            Ok(topic.clone())
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAction {
    /// Send the full topic without an alias.
    None,
    /// Send the full topic and bind it to the alias.
    Bind(NonZeroU16),
    /// Send an empty topic with the already bound alias.
    Reuse(NonZeroU16),
}

/// Decides which outgoing publishes are sent with an alias.
pub trait AliasPolicy: Send + Sync {
    fn assign(&mut self, topic: &TopicName) -> AliasAction;
}

pub trait AliasPolicyFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Policy for one connection whose client accepts at most `max` aliases.
    fn create(&self, max: u16) -> Box<dyn AliasPolicy>;
}

/// Bindings kept in insertion or use order; the front is evicted when the table is full.
struct DequePolicy {
    max: u16,
    allocated: u16,
    touch_on_reuse: bool,
    bindings: DequeMap<TopicName, NonZeroU16>,
}

impl DequePolicy {
    fn new(max: u16, touch_on_reuse: bool) -> Self {
        Self { max, allocated: 0, touch_on_reuse, bindings: DequeMap::default() }
    }
}

impl AliasPolicy for DequePolicy {
    fn assign(&mut self, topic: &TopicName) -> AliasAction {
        if self.max == 0 {
            return AliasAction::None;
        }
        if let Some(alias) = self.bindings.get(topic).copied() {
            if self.touch_on_reuse {
                self.bindings.remove(topic);
                self.bindings.insert(topic.clone(), alias);
            }
            return AliasAction::Reuse(alias);
        }

        let alias = if self.allocated < self.max {
            self.allocated += 1;
            NonZeroU16::new(self.allocated)
        } else {
            self.bindings.pop_front().map(|(_, alias)| alias)
        };
        match alias {
            Some(alias) => {
                self.bindings.insert(topic.clone(), alias);
                AliasAction::Bind(alias)
            }
            None => AliasAction::None,
        }
    }
}

/// Evicts the least recently used binding.
pub struct LruPolicyFactory;

impl AliasPolicyFactory for LruPolicyFactory {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn create(&self, max: u16) -> Box<dyn AliasPolicy> {
        Box::new(DequePolicy::new(max, true))
    }
}

/// Evicts the oldest binding, however often it was used.
pub struct FifoPolicyFactory;

impl AliasPolicyFactory for FifoPolicyFactory {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn create(&self, max: u16) -> Box<dyn AliasPolicy> {
        Box::new(DequePolicy::new(max, false))
    }
}

pub fn alias_policy_factory(typ: AliasPolicyType) -> Arc<dyn AliasPolicyFactory> {
    match typ {
        AliasPolicyType::Lru => Arc::new(LruPolicyFactory),
        AliasPolicyType::Fifo => Arc::new(FifoPolicyFactory),
    }
}

/// Aliases the broker binds on PUBLISH packets it sends to the client.
pub struct ServerTopicAliases {
    policy: Box<dyn AliasPolicy>,
}

impl ServerTopicAliases {
    pub fn new(factory: &dyn AliasPolicyFactory, max: u16) -> Self {
        Self { policy: factory.create(max) }
    }

    /// Rewrites an outgoing publish according to the policy.
    pub fn apply(&mut self, publish: &mut Publish) {
        match self.policy.assign(&publish.topic) {
            AliasAction::None => publish.properties.topic_alias = None,
            AliasAction::Bind(alias) => publish.properties.topic_alias = Some(alias),
            AliasAction::Reuse(alias) => {
                publish.properties.topic_alias = Some(alias);
                publish.topic = TopicName::from_static("");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::QoS;

    fn t(s: &'static str) -> TopicName {
        TopicName::from_static(s)
    }

    fn alias(v: u16) -> Option<NonZeroU16> {
        NonZeroU16::new(v)
    }

    #[test]
    fn inbound_bind_and_resolve() {
        let mut aliases = ClientTopicAliases::new(2);
        assert_eq!(aliases.resolve(&t("a/b"), alias(1)), Ok(t("a/b")));
        assert_eq!(aliases.resolve(&t(""), alias(1)), Ok(t("a/b")));
        assert_eq!(aliases.resolve(&t("c"), alias(1)), Ok(t("c")));
        assert_eq!(aliases.resolve(&t(""), alias(1)), Ok(t("c")));
        assert_eq!(aliases.resolve(&t("x"), None), Ok(t("x")));
        assert_eq!(aliases.len(), 1);
    }

    #[test]
    fn inbound_errors() {
        let mut aliases = ClientTopicAliases::new(2);
        assert_eq!(aliases.resolve(&t(""), alias(2)), Err(AliasError::Unbound(2)));
        assert_eq!(aliases.resolve(&t("a"), alias(3)), Err(AliasError::OutOfRange(3, 2)));
        assert_eq!(aliases.resolve(&t(""), None), Err(AliasError::EmptyTopic));

        let mut disabled = ClientTopicAliases::new(0);
        assert_eq!(disabled.resolve(&t("a"), alias(1)), Err(AliasError::OutOfRange(1, 0)));
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut p = LruPolicyFactory.create(2);
        assert_eq!(p.assign(&t("a")), AliasAction::Bind(NonZeroU16::MIN));
        assert!(matches!(p.assign(&t("b")), AliasAction::Bind(a) if a.get() == 2));
        assert!(matches!(p.assign(&t("a")), AliasAction::Reuse(a) if a.get() == 1));
        // "b" is now the least recently used
        assert!(matches!(p.assign(&t("c")), AliasAction::Bind(a) if a.get() == 2));
        assert!(matches!(p.assign(&t("a")), AliasAction::Reuse(a) if a.get() == 1));
        assert!(matches!(p.assign(&t("b")), AliasAction::Bind(a) if a.get() == 2));
    }

    #[test]
    fn fifo_evicts_oldest() {
        let mut p = FifoPolicyFactory.create(2);
        p.assign(&t("a"));
        p.assign(&t("b"));
        assert!(matches!(p.assign(&t("a")), AliasAction::Reuse(_)));
        assert!(matches!(p.assign(&t("c")), AliasAction::Bind(a) if a.get() == 1));
        assert_eq!(p.assign(&t("b")), AliasAction::Reuse(NonZeroU16::new(2).unwrap()));
    }

    #[test]
    fn zero_maximum_disables_outbound_aliases() {
        let mut aliases = ServerTopicAliases::new(&LruPolicyFactory, 0);
        let mut p = Publish::new("a/b", Bytes::new(), QoS::AtMostOnce, false);
        aliases.apply(&mut p);
        assert_eq!(p.properties.topic_alias, None);
        assert_eq!(p.topic, "a/b");
    }

    #[test]
    fn server_aliases_rewrite_publish() {
        let factory = alias_policy_factory(AliasPolicyType::Lru);
        assert_eq!(factory.name(), "lru");
        let mut aliases = ServerTopicAliases::new(factory.as_ref(), 4);
        let mut p1 = Publish::new("a/b", Bytes::new(), QoS::AtMostOnce, false);
        aliases.apply(&mut p1);
        assert_eq!((p1.topic.as_ref(), p1.properties.topic_alias), ("a/b", alias(1)));
        let mut p2 = Publish::new("a/b", Bytes::new(), QoS::AtMostOnce, false);
        aliases.apply(&mut p2);
        assert_eq!((p2.topic.as_ref(), p2.properties.topic_alias), ("", alias(1)));
    }
}
