use std::fmt;
use std::net::SocketAddr;
use std::num::{NonZeroU16, NonZeroU32};
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::packet::DisconnectReasonCode;
use crate::topic::TopicError;
use crate::utils::timestamp_millis;

pub use crate::utils::{NodeId, TimestampMillis};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type PacketId = u16;
pub type ConnId = u64;
pub type SubscriptionIdentifier = NonZeroU32;
pub type UserProperties = Vec<(ByteString, ByteString)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn less_value(&self, other: QoS) -> QoS {
        if *self < other {
            *self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::Protocol(DisconnectReasonCode::MalformedPacket, format!("invalid qos {}", v))),
        }
    }
}

/// Identity of one client connection.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub node_id: NodeId,
    pub conn_id: ConnId,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub remote_addr: Option<SocketAddr>,
}

impl Id {
    pub fn new(
        node_id: NodeId,
        conn_id: ConnId,
        client_id: ClientId,
        username: Option<UserName>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self { node_id, conn_id, client_id, username, remote_addr }
    }

    /// Identity used for messages that no client published.
    pub fn system(node_id: NodeId) -> Self {
        Self::new(node_id, 0, ClientId::from_static(""), None, None)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}/{}",
            self.node_id,
            self.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            self.client_id,
            self.username.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromType {
    Custom,
    LastWill,
    System,
    Cluster,
}

/// Where a routed message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct From {
    pub typ: FromType,
    pub id: Id,
}

impl From {
    #[inline]
    pub fn from_custom(id: Id) -> Self {
        Self { typ: FromType::Custom, id }
    }

    #[inline]
    pub fn from_last_will(id: Id) -> Self {
        Self { typ: FromType::LastWill, id }
    }

    #[inline]
    pub fn from_system(id: Id) -> Self {
        Self { typ: FromType::System, id }
    }

    #[inline]
    pub fn from_cluster(id: Id) -> Self {
        Self { typ: FromType::Cluster, id }
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.id.client_id
    }

    /// Only a client's own publications are subject to no-local.
    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self.typ, FromType::Custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishProperties {
    pub topic_alias: Option<NonZeroU16>,
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<NonZeroU32>,
    pub response_topic: Option<TopicName>,
    pub correlation_data: Option<Bytes>,
    pub content_type: Option<ByteString>,
    pub subscription_ids: Vec<SubscriptionIdentifier>,
    pub user_properties: UserProperties,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    pub properties: PublishProperties,
    pub create_time: TimestampMillis,
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("topic", &self.topic)
            .field("packet_id", &self.packet_id)
            .field("qos", &self.qos)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("payload", &format_args!("<REDACTED {} bytes>", self.payload.len()))
            .field("properties", &self.properties)
            .finish()
    }
}

impl Publish {
    pub fn new<T: Into<TopicName>>(topic: T, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            dup: false,
            retain,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload,
            properties: PublishProperties::default(),
            create_time: timestamp_millis(),
        }
    }

    /// Absolute expiry time, taking the message's own interval before the broker default.
    pub fn expiry_at(&self, default: Duration) -> Option<TimestampMillis> {
        match self.properties.message_expiry_interval {
            Some(secs) => Some(self.create_time + secs.get() as i64 * 1000),
            None if !default.is_zero() => Some(self.create_time + default.as_millis() as i64),
            None => None,
        }
    }

    #[inline]
    pub fn is_expired(&self, default: Duration, now: TimestampMillis) -> bool {
        self.expiry_at(default).map(|at| at <= now).unwrap_or(false)
    }
}

/// Message captured at CONNECT and published if the client goes away without a clean stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: TopicName,
    pub message: Bytes,
    pub will_delay_interval_sec: Option<u32>,
    pub properties: PublishProperties,
}

impl LastWill {
    pub fn to_publish(&self) -> Publish {
        let mut p = Publish::new(self.topic.clone(), self.message.clone(), self.qos, self.retain);
        p.properties = self.properties.clone();
        p.properties.topic_alias = None;
        p
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetainHandling {
    AtSubscribe,
    AtSubscribeNew,
    NoAtSubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::AtSubscribe,
        }
    }
}

impl SubscriptionOptions {
    pub fn qos(qos: QoS) -> Self {
        Self { qos, ..Default::default() }
    }
}

/// One subscription of one client, as held by both the session and the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub topic_filter: TopicFilter,
    pub opts: SubscriptionOptions,
    pub id: Option<SubscriptionIdentifier>,
}

impl SubscriptionEntry {
    pub fn new(topic_filter: TopicFilter, opts: SubscriptionOptions, id: Option<SubscriptionIdentifier>) -> Self {
        Self { topic_filter, opts, id }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The client sent DISCONNECT.
    ClientDisconnect(DisconnectReasonCode),
    /// Another connection took over the client id.
    SessionTakenOver,
    KeepAliveTimeout,
    HandshakeTimeout,
    /// The transport closed without DISCONNECT.
    RemoteClosed,
    ConnectRefused(crate::packet::ConnectAckReason),
    Protocol(DisconnectReasonCode, String),
    ServerShutdown,
    Error(String),
}

impl Reason {
    /// A clean stop is the only way to end a connection without publishing the will.
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, Reason::ClientDisconnect(DisconnectReasonCode::NormalDisconnection))
    }

    /// Reason code the broker reports in its own DISCONNECT, if it sends one.
    pub fn disconnect_code(&self) -> Option<DisconnectReasonCode> {
        match self {
            Reason::SessionTakenOver => Some(DisconnectReasonCode::SessionTakenOver),
            Reason::KeepAliveTimeout => Some(DisconnectReasonCode::KeepAliveTimeout),
            Reason::Protocol(code, _) => Some(*code),
            Reason::ServerShutdown => Some(DisconnectReasonCode::ServerShuttingDown),
            Reason::Error(_) => Some(DisconnectReasonCode::UnspecifiedError),
            Reason::ClientDisconnect(_)
            | Reason::HandshakeTimeout
            | Reason::RemoteClosed
            | Reason::ConnectRefused(_) => None,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ClientDisconnect(code) => write!(f, "Disconnect({:?})", code),
            Reason::SessionTakenOver => write!(f, "SessionTakenOver"),
            Reason::KeepAliveTimeout => write!(f, "KeepAliveTimeout"),
            Reason::HandshakeTimeout => write!(f, "HandshakeTimeout"),
            Reason::RemoteClosed => write!(f, "RemoteClosed"),
            Reason::ConnectRefused(r) => write!(f, "ConnectRefused({:?})", r),
            Reason::Protocol(code, msg) => write!(f, "ProtocolError({:?}, {})", code, msg),
            Reason::ServerShutdown => write!(f, "ServerShutdown"),
            Reason::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("protocol error: {1}")]
    Protocol(DisconnectReasonCode, String),
    #[error("topic error: {0}")]
    Topic(#[from] TopicError),
    #[error("topic alias error: {0}")]
    TopicAlias(#[from] crate::alias::AliasError),
    #[error("receive maximum exceeded")]
    ReceiveMaximumExceeded,
    #[error("qos {0:?} not supported")]
    QoSNotSupported(QoS),
    #[error("persistence unavailable: {0}")]
    StorageUnavailable(String),
    #[error("send error, {0}")]
    SendError(String),
}

impl MqttError {
    pub fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            MqttError::Protocol(code, _) => *code,
            MqttError::Topic(_) => DisconnectReasonCode::TopicNameInvalid,
            MqttError::TopicAlias(_) => DisconnectReasonCode::TopicAliasInvalid,
            MqttError::ReceiveMaximumExceeded => DisconnectReasonCode::ReceiveMaximumExceeded,
            MqttError::QoSNotSupported(_) => DisconnectReasonCode::QoSNotSupported,
            MqttError::StorageUnavailable(_) => DisconnectReasonCode::ServerBusy,
            MqttError::SendError(_) => DisconnectReasonCode::UnspecifiedError,
        }
    }
}

impl std::convert::From<MqttError> for Reason {
    fn from(e: MqttError) -> Self {
        Reason::Protocol(e.to_reason_code(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_ordering() {
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.less_value(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
    }

    #[test]
    fn publish_expiry() {
        let mut p = Publish::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, false);
        assert_eq!(p.expiry_at(Duration::ZERO), None);
        assert!(!p.is_expired(Duration::ZERO, i64::MAX));

        assert_eq!(p.expiry_at(Duration::from_secs(5)), Some(p.create_time + 5000));

        p.properties.message_expiry_interval = NonZeroU32::new(2);
        assert_eq!(p.expiry_at(Duration::from_secs(5)), Some(p.create_time + 2000));
        assert!(p.is_expired(Duration::ZERO, p.create_time + 2000));
        assert!(!p.is_expired(Duration::ZERO, p.create_time + 1999));
    }

    #[test]
    fn clean_stop_only_on_normal_disconnect() {
        assert!(Reason::ClientDisconnect(DisconnectReasonCode::NormalDisconnection).is_clean_stop());
        assert!(!Reason::ClientDisconnect(DisconnectReasonCode::DisconnectWithWillMessage).is_clean_stop());
        assert!(!Reason::SessionTakenOver.is_clean_stop());
        assert_eq!(Reason::KeepAliveTimeout.disconnect_code(), Some(DisconnectReasonCode::KeepAliveTimeout));
        assert_eq!(Reason::RemoteClosed.disconnect_code(), None);
    }
}
