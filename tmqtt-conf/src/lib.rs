#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use tmqtt_utils::{deserialize_duration, NodeId};

pub use self::logging::{Format, Level, Log, To};

pub mod logging;

pub type Result<T> = anyhow::Result<T>;

/// Immutable, cheaply cloneable broker settings.
#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub persistence: Persistence,
    #[serde(default)]
    pub topic_alias_manager: TopicAliasManager,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    /// Loads settings from `/etc/tmqtt/tmqtt.*`, `./tmqtt.*`, the file named in
    /// `opts` and `TMQTT_*` environment variables, later sources winning.
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/tmqtt/tmqtt").required(false))
            .add_source(File::with_name("tmqtt").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("tmqtt").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        if let Some(id) = opts.node_id {
            inner.node.id = id;
        }
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node_id is {}", self.node.id);
        log::info!("persistence is {:?}", self.persistence.typ);
        log::info!("topic alias manager is {:?}", self.topic_alias_manager.typ);
        log::info!("max_inflight is {}, max_mqueue_len is {}", self.mqtt.max_inflight, self.mqtt.max_mqueue_len);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// Command line overrides applied after the file sources.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub cfg_name: Option<String>,
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: NodeId,
}

/// What the broker does when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqueuePolicy {
    /// The publisher waits until the subscriber drains a slot.
    Block,
    /// The oldest queued message is discarded to make room.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    /// Expiry for sessions whose client did not send a Session Expiry Interval.
    #[serde(default = "Mqtt::session_expiry_default", deserialize_with = "deserialize_duration")]
    pub session_expiry: Duration,
    #[serde(default = "Mqtt::max_session_expiry_default", deserialize_with = "deserialize_duration")]
    pub max_session_expiry: Duration,
    #[serde(
        default = "Mqtt::session_expiry_check_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub session_expiry_check_interval: Duration,
    /// Default message expiry, zero means messages never expire.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub message_expiry: Duration,
    #[serde(
        default = "Mqtt::retain_expiry_check_interval_default",
        deserialize_with = "deserialize_duration"
    )]
    pub retain_expiry_check_interval: Duration,
    #[serde(default = "Mqtt::inflight_retry_interval_default", deserialize_with = "deserialize_duration")]
    pub inflight_retry_interval: Duration,
    #[serde(default = "Mqtt::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    /// Upper bound on the keep-alive a client may ask for, in seconds.
    #[serde(default = "Mqtt::max_keepalive_default")]
    pub max_keepalive: u16,
    /// Receive Maximum advertised to clients.
    #[serde(default = "Mqtt::receive_max_default")]
    pub receive_max: u16,
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: u16,
    #[serde(default = "Mqtt::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
    #[serde(default = "Mqtt::mqueue_policy_default")]
    pub mqueue_policy: MqueuePolicy,
    #[serde(default)]
    pub queue_qos0_messages: bool,
    #[serde(default = "Mqtt::maximum_qos_default")]
    pub maximum_qos: u8,
    #[serde(default = "Mqtt::topic_alias_max_default")]
    pub topic_alias_max: u16,
    #[serde(default = "Mqtt::enabled_default")]
    pub retain_available: bool,
    #[serde(default = "Mqtt::enabled_default")]
    pub wildcard_subscription_available: bool,
    #[serde(default = "Mqtt::enabled_default")]
    pub subscription_identifier_available: bool,
    #[serde(default = "Mqtt::enabled_default")]
    pub allow_zero_len_client_id: bool,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            session_expiry: Self::session_expiry_default(),
            max_session_expiry: Self::max_session_expiry_default(),
            session_expiry_check_interval: Self::session_expiry_check_interval_default(),
            message_expiry: Duration::ZERO,
            retain_expiry_check_interval: Self::retain_expiry_check_interval_default(),
            inflight_retry_interval: Self::inflight_retry_interval_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            max_keepalive: Self::max_keepalive_default(),
            receive_max: Self::receive_max_default(),
            max_inflight: Self::max_inflight_default(),
            max_mqueue_len: Self::max_mqueue_len_default(),
            mqueue_policy: Self::mqueue_policy_default(),
            queue_qos0_messages: false,
            maximum_qos: Self::maximum_qos_default(),
            topic_alias_max: Self::topic_alias_max_default(),
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifier_available: true,
            allow_zero_len_client_id: true,
        }
    }
}

impl Mqtt {
    fn session_expiry_default() -> Duration {
        Duration::from_secs(2 * 60 * 60)
    }
    fn max_session_expiry_default() -> Duration {
        Duration::from_secs(7 * 24 * 60 * 60)
    }
    fn session_expiry_check_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn retain_expiry_check_interval_default() -> Duration {
        Duration::from_secs(30)
    }
    fn inflight_retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn max_keepalive_default() -> u16 {
        65535
    }
    fn receive_max_default() -> u16 {
        100
    }
    fn max_inflight_default() -> u16 {
        100
    }
    fn max_mqueue_len_default() -> usize {
        1000
    }
    fn mqueue_policy_default() -> MqueuePolicy {
        MqueuePolicy::DropOldest
    }
    fn maximum_qos_default() -> u8 {
        2
    }
    fn topic_alias_max_default() -> u16 {
        10
    }
    fn enabled_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceType {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Persistence {
    #[serde(default = "Persistence::typ_default")]
    pub typ: PersistenceType,
    #[serde(default)]
    pub sled: SledConfig,
}

impl Default for Persistence {
    fn default() -> Self {
        Self { typ: Self::typ_default(), sled: SledConfig::default() }
    }
}

impl Persistence {
    fn typ_default() -> PersistenceType {
        PersistenceType::Memory
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SledConfig {
    #[serde(default = "SledConfig::path_default")]
    pub path: String,
    #[serde(default = "SledConfig::cache_capacity_default")]
    pub cache_capacity: u64,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self { path: Self::path_default(), cache_capacity: Self::cache_capacity_default() }
    }
}

impl SledConfig {
    fn path_default() -> String {
        "/var/lib/tmqtt/sessions".into()
    }
    fn cache_capacity_default() -> u64 {
        64 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasPolicyType {
    Lru,
    Fifo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicAliasManager {
    #[serde(default = "TopicAliasManager::typ_default")]
    pub typ: AliasPolicyType,
}

impl Default for TopicAliasManager {
    fn default() -> Self {
        Self { typ: Self::typ_default() }
    }
}

impl TopicAliasManager {
    fn typ_default() -> AliasPolicyType {
        AliasPolicyType::Lru
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Inner {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_without_sources() {
        let s = Settings::default();
        assert_eq!(s.node.id, 0);
        assert_eq!(s.mqtt.session_expiry, Duration::from_secs(7200));
        assert_eq!(s.mqtt.max_inflight, 100);
        assert_eq!(s.mqtt.mqueue_policy, MqueuePolicy::DropOldest);
        assert_eq!(s.persistence.typ, PersistenceType::Memory);
        assert_eq!(s.topic_alias_manager.typ, AliasPolicyType::Lru);
        assert!(s.mqtt.retain_available);
    }

    #[test]
    fn sections_from_toml() {
        let inner = parse(
            r#"
            [node]
            id = 3

            [mqtt]
            session_expiry = "30m"
            inflight_retry_interval = "500ms"
            max_mqueue_len = 10
            mqueue_policy = "block"
            topic_alias_max = 0
            queue_qos0_messages = true

            [persistence]
            typ = "sled"
            sled = { path = "/tmp/tmqtt-test" }

            [topic_alias_manager]
            typ = "fifo"

            [log]
            level = "debug"
            dump_packet = true
            "#,
        );
        assert_eq!(inner.node.id, 3);
        assert_eq!(inner.mqtt.session_expiry, Duration::from_secs(1800));
        assert_eq!(inner.mqtt.inflight_retry_interval, Duration::from_millis(500));
        assert_eq!(inner.mqtt.max_mqueue_len, 10);
        assert_eq!(inner.mqtt.mqueue_policy, MqueuePolicy::Block);
        assert_eq!(inner.mqtt.topic_alias_max, 0);
        assert!(inner.mqtt.queue_qos0_messages);
        assert_eq!(inner.mqtt.max_inflight, 100);
        assert_eq!(inner.persistence.typ, PersistenceType::Sled);
        assert_eq!(inner.persistence.sled.path, "/tmp/tmqtt-test");
        assert_eq!(inner.topic_alias_manager.typ, AliasPolicyType::Fifo);
        assert_eq!(inner.log.level.inner(), slog::Level::Debug);
        assert!(inner.log.dump_packet);
    }

    #[test]
    fn options_override_node_id() {
        let settings = Settings::new(Options { node_id: Some(7), ..Default::default() }).unwrap();
        assert_eq!(settings.node.id, 7);
    }
}
