//! Decoded MQTT control packets.
//!
//! This is the vocabulary shared with the wire codec: the codec turns bytes into
//! [`Packet`] values and back, the broker core only ever sees these types.

use std::num::{NonZeroU16, NonZeroU32};

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{ClientId, LastWill, Publish, QoS, SubscriptionOptions, UserName, UserProperties};

macro_rules! reason_code {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            #[inline]
            pub fn value(&self) -> u8 {
                *self as u8
            }

            #[inline]
            pub fn is_success(&self) -> bool {
                self.value() < 0x80
            }
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(v: u8) -> Result<Self, u8> {
                match v {
                    $($value => Ok($name::$variant),)+
                    _ => Err(v),
                }
            }
        }
    };
}

reason_code!(ConnectAckReason {
    Success = 0x00,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUserNameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    BadAuthenticationMethod = 0x8C,
    TopicNameInvalid = 0x90,
    PacketTooLarge = 0x95,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    ConnectionRateExceeded = 0x9F,
});

reason_code!(DisconnectReasonCode {
    NormalDisconnection = 0x00,
    DisconnectWithWillMessage = 0x04,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    ServerBusy = 0x89,
    ServerShuttingDown = 0x8B,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    ReceiveMaximumExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    SharedSubscriptionsNotSupported = 0x9E,
    ConnectionRateExceeded = 0x9F,
    MaximumConnectTime = 0xA0,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
});

reason_code!(
    /// Reason carried by PUBACK and PUBREC.
    PublishAckReason {
        Success = 0x00,
        NoMatchingSubscribers = 0x10,
        UnspecifiedError = 0x80,
        ImplementationSpecificError = 0x83,
        NotAuthorized = 0x87,
        TopicNameInvalid = 0x90,
        PacketIdentifierInUse = 0x91,
        QuotaExceeded = 0x97,
        PayloadFormatInvalid = 0x99,
    }
);

reason_code!(
    /// Reason carried by PUBREL and PUBCOMP.
    PublishAck2Reason {
        Success = 0x00,
        PacketIdNotFound = 0x92,
    }
);

reason_code!(SubscribeAckReason {
    GrantedQos0 = 0x00,
    GrantedQos1 = 0x01,
    GrantedQos2 = 0x02,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    PacketIdentifierInUse = 0x91,
    QuotaExceeded = 0x97,
    SharedSubscriptionNotSupported = 0x9E,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
});

impl SubscribeAckReason {
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => SubscribeAckReason::GrantedQos0,
            QoS::AtLeastOnce => SubscribeAckReason::GrantedQos1,
            QoS::ExactlyOnce => SubscribeAckReason::GrantedQos2,
        }
    }

    pub fn granted_qos(&self) -> Option<QoS> {
        match self {
            SubscribeAckReason::GrantedQos0 => Some(QoS::AtMostOnce),
            SubscribeAckReason::GrantedQos1 => Some(QoS::AtLeastOnce),
            SubscribeAckReason::GrantedQos2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

reason_code!(UnsubscribeAckReason {
    Success = 0x00,
    NoSubscriptionExisted = 0x11,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    PacketIdentifierInUse = 0x91,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub password: Option<Bytes>,
    pub last_will: Option<LastWill>,
    pub session_expiry_interval_secs: Option<u32>,
    pub receive_max: Option<NonZeroU16>,
    pub max_packet_size: Option<NonZeroU32>,
    pub topic_alias_max: u16,
    pub user_properties: UserProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    pub session_present: bool,
    pub reason_code: ConnectAckReason,
    pub session_expiry_interval_secs: Option<u32>,
    pub receive_max: Option<NonZeroU16>,
    pub max_qos: Option<QoS>,
    pub retain_available: Option<bool>,
    pub assigned_client_id: Option<ClientId>,
    pub topic_alias_max: u16,
    pub reason_string: Option<ByteString>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub server_keepalive_sec: Option<u16>,
}

impl Default for ConnectAck {
    fn default() -> Self {
        Self {
            session_present: false,
            reason_code: ConnectAckReason::Success,
            session_expiry_interval_secs: None,
            receive_max: None,
            max_qos: None,
            retain_available: None,
            assigned_client_id: None,
            topic_alias_max: 0,
            reason_string: None,
            wildcard_subscription_available: None,
            subscription_identifiers_available: None,
            server_keepalive_sec: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAckReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck2 {
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAck2Reason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    pub id: Option<NonZeroU32>,
    pub user_properties: UserProperties,
    pub topic_filters: Vec<(ByteString, SubscriptionOptions)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub packet_id: NonZeroU16,
    pub status: Vec<SubscribeAckReason>,
    pub reason_string: Option<ByteString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: NonZeroU16,
    pub user_properties: UserProperties,
    pub topic_filters: Vec<ByteString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeAck {
    pub packet_id: NonZeroU16,
    pub status: Vec<UnsubscribeAckReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason_code: DisconnectReasonCode,
    pub session_expiry_interval_secs: Option<u32>,
    pub reason_string: Option<ByteString>,
}

impl Disconnect {
    pub fn new(reason_code: DisconnectReasonCode) -> Self {
        Self { reason_code, session_expiry_interval_secs: None, reason_string: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(Box<ConnectAck>),
    Publish(Box<Publish>),
    /// PUBACK
    PublishAck(PublishAck),
    /// PUBREC
    PublishReceived(PublishAck),
    /// PUBREL
    PublishRelease(PublishAck2),
    /// PUBCOMP
    PublishComplete(PublishAck2),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck(UnsubscribeAck),
    PingRequest,
    PingResponse,
    Disconnect(Disconnect),
}

impl Packet {
    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck(_) => "PUBACK",
            Packet::PublishReceived(_) => "PUBREC",
            Packet::PublishRelease(_) => "PUBREL",
            Packet::PublishComplete(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubscribeAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubscribeAck(_) => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
        }
    }
}
