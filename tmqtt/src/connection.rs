//! Per-connection protocol state machine.
//!
//! [`process`] drives one transport through `connecting -> connected -> disconnecting ->
//! closed`. The connection task exclusively owns the QoS flow control state (both
//! in-flight windows) and both topic alias tables; everything it shares with other
//! connections is reached through the [`ServerContext`]. Messages for this client
//! arrive through the session's outbound queue, which the event loop drains only while
//! the in-flight window has credit.

use std::num::{NonZeroU16, NonZeroU32};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::alias::{ClientTopicAliases, ServerTopicAliases};
use crate::conf::Mqtt;
use crate::context::ServerContext;
use crate::hook::SubscribeDecision;
use crate::inflight::{InInflight, MomentStatus, OutInflight, OutInflightMessage};
use crate::packet::*;
use crate::session::{Session, WillAction};
use crate::shared::{Message, Rx};
use crate::topic::Topic;
use crate::transport::Transport;
use crate::types::*;
use crate::utils::timestamp_millis;

/// Runs one client connection to completion and returns why it ended.
pub async fn process<T: Transport>(scx: ServerContext, transport: T) -> Reason {
    scx.stats.handshakings.inc();
    let res = handshake(&scx, transport).await;
    scx.stats.handshakings.dec();

    let conn = match res {
        Ok(conn) => conn,
        Err(reason) => return reason,
    };

    scx.stats.connections.inc();
    let reason = conn.run().await;
    scx.stats.connections.dec();
    reason
}

async fn handshake<T: Transport>(scx: &ServerContext, mut transport: T) -> Result<Connection<T>, Reason> {
    let mqtt = &scx.settings.mqtt;
    let mut c = match tokio::time::timeout(mqtt.handshake_timeout, transport.recv()).await {
        Err(_) => {
            log::debug!("{:?} handshake timeout", transport.remote_addr());
            transport.close().await;
            return Err(Reason::HandshakeTimeout);
        }
        Ok(None) => return Err(Reason::RemoteClosed),
        Ok(Some(Err(e))) => {
            log::warn!("{:?} handshake, malformed packet, {}", transport.remote_addr(), e);
            transport.close().await;
            return Err(e.into());
        }
        Ok(Some(Ok(Packet::Connect(c)))) => c,
        Ok(Some(Ok(p))) => {
            log::warn!("{:?} handshake, first packet is {}", transport.remote_addr(), p.packet_type());
            transport.close().await;
            return Err(Reason::Protocol(
                DisconnectReasonCode::ProtocolError,
                format!("first packet is {}", p.packet_type()),
            ));
        }
    };
    if scx.settings.log.dump_packet {
        log::debug!("{:?} recv {:?}", transport.remote_addr(), c);
    }

    let assigned_client_id = if c.client_id.is_empty() {
        if !mqtt.allow_zero_len_client_id {
            return refuse(transport, ConnectAckReason::ClientIdentifierNotValid).await;
        }
        c.client_id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned().into();
        Some(c.client_id.clone())
    } else {
        None
    };

    let id = Id::new(scx.node_id(), scx.next_conn_id(), c.client_id.clone(), c.username.clone(), transport.remote_addr());

    if let Some(reason) = check_will(mqtt, c.last_will.as_ref()) {
        log::warn!("{:?} Connection Refused, invalid will message, reason: {:?}", id, reason);
        return refuse(transport, reason).await;
    }

    let reason = scx.hooks.client_connect(&id, &c).await;
    if !reason.is_success() {
        log::warn!("{:?} Connection Refused, reason: {:?}", id, reason);
        return refuse(transport, reason).await;
    }

    let _guard = scx.sessions.connect_lock(&id.client_id).await;
    if scx.peers.kick(&id.client_id, Reason::SessionTakenOver).await {
        log::info!("{:?} session taken over", id);
    }

    let session_expiry = session_expiry_interval(mqtt, &c);
    let (session, session_present) =
        match scx.sessions.create_or_resume(&id, c.clean_start, session_expiry, c.last_will.clone()).await {
            Ok(res) => res,
            Err(e) => {
                log::warn!("{:?} Connection Refused, {}", id, e);
                return refuse(transport, ConnectAckReason::ServerUnavailable).await;
            }
        };
    if !session_present {
        scx.hooks.session_created(&id).await;
    }

    let keep_alive = if c.keep_alive == 0 { 0 } else { c.keep_alive.min(mqtt.max_keepalive) };
    let receive_max = c.receive_max.map(|r| r.get()).unwrap_or(u16::MAX);
    let mut out_inflight =
        OutInflight::new(receive_max.min(mqtt.max_inflight).max(1) as usize, mqtt.inflight_retry_interval);
    let mut in_inflight = InInflight::new(mqtt.receive_max);
    let (inflight, awaiting_rel) = session.take_inflight();
    scx.stats.out_inflights.incs(inflight.len() as isize);
    for m in inflight {
        out_inflight.push_back(m);
    }
    in_inflight.restore(awaiting_rel);

    let ack = ConnectAck {
        session_present,
        reason_code: ConnectAckReason::Success,
        session_expiry_interval_secs: if c.session_expiry_interval_secs != Some(session_expiry) {
            Some(session_expiry)
        } else {
            None
        },
        receive_max: NonZeroU16::new(mqtt.receive_max),
        max_qos: if mqtt.maximum_qos < 2 { QoS::try_from(mqtt.maximum_qos).ok() } else { None },
        retain_available: Some(mqtt.retain_available),
        assigned_client_id,
        topic_alias_max: mqtt.topic_alias_max,
        reason_string: None,
        wildcard_subscription_available: Some(mqtt.wildcard_subscription_available),
        subscription_identifiers_available: Some(mqtt.subscription_identifier_available),
        server_keepalive_sec: Some(keep_alive),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    scx.peers.add(id.client_id.clone(), id.conn_id, tx);

    let mut conn = Connection {
        scx: scx.clone(),
        transport,
        session,
        rx,
        keep_alive,
        out_inflight,
        in_inflight,
        client_aliases: ClientTopicAliases::new(mqtt.topic_alias_max),
        server_aliases: ServerTopicAliases::new(scx.alias_policy.as_ref(), c.topic_alias_max),
        kick_ack: None,
        dirty: false,
        dump_packet: scx.settings.log.dump_packet,
        id,
    };

    if let Err(reason) = conn.send(Packet::ConnectAck(Box::new(ack))).await {
        return Err(conn.close(reason).await);
    }
    log::debug!("{:?} connected, session_present: {}, keep_alive: {}", conn.id, session_present, keep_alive);
    Ok(conn)
}

async fn refuse<T: Transport>(mut transport: T, reason: ConnectAckReason) -> Result<Connection<T>, Reason> {
    let ack = ConnectAck { reason_code: reason, ..Default::default() };
    if let Err(e) = transport.send(Packet::ConnectAck(Box::new(ack))).await {
        log::debug!("{:?} send refused CONNACK error, {}", transport.remote_addr(), e);
    }
    transport.close().await;
    Err(Reason::ConnectRefused(reason))
}

fn check_will(mqtt: &Mqtt, will: Option<&LastWill>) -> Option<ConnectAckReason> {
    let will = will?;
    if will.qos.value() > mqtt.maximum_qos {
        return Some(ConnectAckReason::QoSNotSupported);
    }
    if will.retain && !mqtt.retain_available {
        return Some(ConnectAckReason::RetainNotSupported);
    }
    if Topic::parse_name(&will.topic).is_err() {
        return Some(ConnectAckReason::TopicNameInvalid);
    }
    None
}

/// The CONNECT property wins; without it a clean start ends with the connection and a
/// resumable session gets the configured default. Always capped by the maximum.
fn session_expiry_interval(mqtt: &Mqtt, c: &Connect) -> u32 {
    let secs = match c.session_expiry_interval_secs {
        Some(secs) => secs,
        None if c.clean_start => 0,
        None => mqtt.session_expiry.as_secs().min(u32::MAX as u64) as u32,
    };
    secs.min(mqtt.max_session_expiry.as_secs().min(u32::MAX as u64) as u32)
}

fn publish_ack_reason(res: Result<usize, PublishAckReason>) -> PublishAckReason {
    match res {
        Ok(0) => PublishAckReason::NoMatchingSubscribers,
        Ok(_) => PublishAckReason::Success,
        Err(reason) => reason,
    }
}

pub struct Connection<T> {
    scx: ServerContext,
    transport: T,
    id: Id,
    session: Arc<Session>,
    rx: Rx,
    keep_alive: u16,
    out_inflight: OutInflight,
    in_inflight: InInflight,
    client_aliases: ClientTopicAliases,
    server_aliases: ServerTopicAliases,
    kick_ack: Option<oneshot::Sender<()>>,
    /// Handshake state or subscriptions changed since the last checkpoint.
    dirty: bool,
    dump_packet: bool,
}

impl<T: Transport> Connection<T> {
    pub async fn run(mut self) -> Reason {
        let reason = match self.run_loop().await {
            Ok(()) => Reason::RemoteClosed,
            Err(reason) => reason,
        };
        self.close(reason).await
    }

    async fn run_loop(&mut self) -> Result<(), Reason> {
        log::debug!("{:?} start online event loop", self.id);
        self.resend_inflight().await?;

        let keep_alive_interval = if self.keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_millis(self.keep_alive as u64 * 1500)
        };
        log::debug!("{:?} keep_alive_interval is {:?}", self.id, keep_alive_interval);
        let keep_alive_delay = tokio::time::sleep(keep_alive_interval);
        let retry_delay = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(keep_alive_delay);
        tokio::pin!(retry_delay);

        loop {
            retry_delay
                .as_mut()
                .reset(Instant::now() + self.out_inflight.get_timeout().unwrap_or(Duration::from_secs(120)));
            let has_credit = self.out_inflight.has_credit();

            tokio::select! {
                _ = &mut keep_alive_delay => {
                    return Err(Reason::KeepAliveTimeout)
                },

                _ = &mut retry_delay => {
                    self.retry_inflight().await?;
                },

                msg = self.rx.recv() => {
                    match msg {
                        Some(Message::Kick(reason, done)) => {
                            log::debug!("{:?} kicked, reason: {}", self.id, reason);
                            self.kick_ack = Some(done);
                            return Err(reason);
                        }
                        None => return Err(Reason::SessionTakenOver),
                    }
                },

                pkt = self.transport.recv() => {
                    keep_alive_delay.as_mut().reset(Instant::now() + keep_alive_interval);
                    match pkt {
                        Some(Ok(p)) => self.handle_packet(p).await?,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(Reason::RemoteClosed),
                    }
                },

                (from, p) = self.session.queue.recv(), if has_credit => {
                    self.deliver(from, p).await?;
                },
            }
            self.checkpoint();
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Reason> {
        if self.dump_packet {
            log::debug!("{:?} recv {:?}", self.id, packet);
        }
        match packet {
            Packet::Publish(p) => self.handle_publish(*p).await,
            Packet::PublishAck(ack) => {
                self.handle_ack(ack.packet_id, MomentStatus::UnAck).await;
                Ok(())
            }
            Packet::PublishReceived(ack) => self.handle_pubrec(ack).await,
            Packet::PublishRelease(rel) => {
                let reason_code = if self.in_inflight.remove(&rel.packet_id) {
                    self.scx.stats.in_inflights.dec();
                    self.dirty = true;
                    PublishAck2Reason::Success
                } else {
                    PublishAck2Reason::PacketIdNotFound
                };
                self.send(Packet::PublishComplete(PublishAck2 { packet_id: rel.packet_id, reason_code })).await
            }
            Packet::PublishComplete(comp) => {
                self.handle_ack(comp.packet_id, MomentStatus::UnComplete).await;
                Ok(())
            }
            Packet::Subscribe(sub) => self.handle_subscribe(sub).await,
            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(unsub).await,
            Packet::PingRequest => self.send(Packet::PingResponse).await,
            Packet::Disconnect(d) => {
                if let Some(secs) = d.session_expiry_interval_secs {
                    let max = self.scx.settings.mqtt.max_session_expiry.as_secs().min(u32::MAX as u64) as u32;
                    let mut data = self.session.data();
                    if data.session_expiry_interval_secs == 0 && secs > 0 {
                        return Err(Reason::Protocol(
                            DisconnectReasonCode::ProtocolError,
                            "session expiry interval set on DISCONNECT after zero at CONNECT".into(),
                        ));
                    }
                    data.session_expiry_interval_secs = secs.min(max);
                }
                Err(Reason::ClientDisconnect(d.reason_code))
            }
            Packet::Connect(_) => {
                Err(Reason::Protocol(DisconnectReasonCode::ProtocolError, "duplicate CONNECT".into()))
            }
            p => Err(Reason::Protocol(
                DisconnectReasonCode::ProtocolError,
                format!("unexpected {} from client", p.packet_type()),
            )),
        }
    }

    async fn handle_publish(&mut self, mut publish: Publish) -> Result<(), Reason> {
        let (maximum_qos, retain_available) =
            (self.scx.settings.mqtt.maximum_qos, self.scx.settings.mqtt.retain_available);
        if publish.qos.value() > maximum_qos {
            return Err(MqttError::QoSNotSupported(publish.qos).into());
        }
        if publish.retain && !retain_available {
            return Err(Reason::Protocol(DisconnectReasonCode::RetainNotSupported, "retain is not available".into()));
        }
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(publish.packet_id.ok_or_else(|| {
                Reason::Protocol(DisconnectReasonCode::ProtocolError, "PUBLISH without packet id".into())
            })?),
        };

        let topic =
            self.client_aliases.resolve(&publish.topic, publish.properties.topic_alias).map_err(MqttError::TopicAlias)?;
        Topic::parse_name(&topic).map_err(MqttError::Topic)?;
        publish.topic = topic;
        publish.properties.topic_alias = None;
        publish.dup = false;
        publish.packet_id = None;
        publish.create_time = timestamp_millis();

        let from = From::from_custom(self.id.clone());
        match (publish.qos, packet_id) {
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let reason_code = if self.in_inflight.add(packet_id)? {
                    self.scx.stats.in_inflights.inc();
                    self.dirty = true;
                    let reason_code = publish_ack_reason(self.scx.publish(from, publish).await);
                    if !reason_code.is_success() && self.in_inflight.remove(&packet_id) {
                        self.scx.stats.in_inflights.dec();
                    }
                    reason_code
                } else {
                    log::debug!("{:?} duplicate QoS 2 message, packet_id: {}", self.id, packet_id);
                    PublishAckReason::Success
                };
                self.send(Packet::PublishReceived(PublishAck { packet_id, reason_code })).await
            }
            (_, Some(packet_id)) => {
                let reason_code = publish_ack_reason(self.scx.publish(from, publish).await);
                self.send(Packet::PublishAck(PublishAck { packet_id, reason_code })).await
            }
            (_, None) => {
                if let Err(reason) = self.scx.publish(from, publish).await {
                    log::debug!("{:?} QoS 0 message refused, {:?}", self.id, reason);
                }
                Ok(())
            }
        }
    }

    async fn handle_ack(&mut self, packet_id: NonZeroU16, expected: MomentStatus) {
        let pid = packet_id.get();
        if self.out_inflight.get(pid).map(|m| m.status) != Some(expected) {
            log::debug!("{:?} unexpected ack, packet_id: {}, expected status: {:?}", self.id, pid, expected);
            return;
        }
        if let Some(m) = self.out_inflight.remove(&pid) {
            self.dirty = true;
            self.scx.stats.out_inflights.dec();
            self.scx.stats.messages_acked.inc();
            self.scx.hooks.message_acked(&self.id, &m.from, &m.publish).await;
        }
    }

    async fn handle_pubrec(&mut self, ack: PublishAck) -> Result<(), Reason> {
        let pid = ack.packet_id.get();
        match self.out_inflight.get(pid).map(|m| m.status) {
            Some(MomentStatus::UnReceived) if !ack.reason_code.is_success() => {
                if let Some(m) = self.out_inflight.remove(&pid) {
                    self.dirty = true;
                    self.scx.stats.out_inflights.dec();
                    self.scx.hooks.message_dropped(Some(&self.id.client_id), &m.from, &m.publish, "refused by receiver").await;
                }
                Ok(())
            }
            Some(MomentStatus::UnReceived) | Some(MomentStatus::UnComplete) => {
                self.out_inflight.update_status(&pid, MomentStatus::UnComplete);
                self.dirty = true;
                self.send(Packet::PublishRelease(PublishAck2 {
                    packet_id: ack.packet_id,
                    reason_code: PublishAck2Reason::Success,
                }))
                .await
            }
            _ => {
                self.send(Packet::PublishRelease(PublishAck2 {
                    packet_id: ack.packet_id,
                    reason_code: PublishAck2Reason::PacketIdNotFound,
                }))
                .await
            }
        }
    }

    async fn handle_subscribe(&mut self, sub: Subscribe) -> Result<(), Reason> {
        let mut status = Vec::with_capacity(sub.topic_filters.len());
        let mut retaineds = Vec::new();
        for (topic_filter, opts) in sub.topic_filters {
            status.push(self.subscribe(topic_filter, opts, sub.id, &mut retaineds).await);
        }
        self.dirty = true;
        self.send(Packet::SubscribeAck(SubscribeAck { packet_id: sub.packet_id, status, reason_string: None }))
            .await?;

        for (from, p) in retaineds {
            self.scx.enqueue(&self.session, from, p).await;
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic_filter: TopicFilter,
        opts: SubscriptionOptions,
        sub_id: Option<NonZeroU32>,
        retaineds: &mut Vec<(From, Publish)>,
    ) -> SubscribeAckReason {
        let mqtt = &self.scx.settings.mqtt;
        if sub_id.is_some() && !mqtt.subscription_identifier_available {
            return SubscribeAckReason::SubscriptionIdentifiersNotSupported;
        }
        if topic_filter.starts_with("$share/") {
            return SubscribeAckReason::SharedSubscriptionNotSupported;
        }
        let topic = match Topic::from_str(&topic_filter) {
            Ok(topic) => topic,
            Err(e) => {
                log::warn!("{:?} subscribe, invalid topic filter {:?}, {}", self.id, topic_filter, e);
                return SubscribeAckReason::TopicFilterInvalid;
            }
        };
        if topic.has_wildcard() && !mqtt.wildcard_subscription_available {
            return SubscribeAckReason::WildcardSubscriptionsNotSupported;
        }
        let maximum_qos = QoS::try_from(mqtt.maximum_qos).unwrap_or(QoS::ExactlyOnce);

        let qos = match self.scx.hooks.client_subscribe(&self.id, &topic_filter, &opts).await {
            SubscribeDecision::Allow(qos) => qos.less_value(maximum_qos),
            SubscribeDecision::Deny(reason) => {
                log::debug!("{:?} subscribe {:?} refused, {:?}", self.id, topic_filter, reason);
                return reason;
            }
        };
        let opts = SubscriptionOptions { qos, ..opts };
        let entry = SubscriptionEntry::new(topic_filter.clone(), opts, sub_id);
        let existed = match self.scx.sessions.subscribe(&self.session, entry).await {
            Ok(old) => old.is_some(),
            Err(e) => {
                log::warn!("{:?} subscribe {:?} error, {:?}", self.id, topic_filter, e);
                return SubscribeAckReason::UnspecifiedError;
            }
        };

        let send_retained = match opts.retain_handling {
            RetainHandling::AtSubscribe => true,
            RetainHandling::AtSubscribeNew => !existed,
            RetainHandling::NoAtSubscribe => false,
        };
        if send_retained && self.scx.retain.enable() {
            match self.scx.retain.get(&topic_filter).await {
                Ok(rs) => {
                    for r in rs {
                        let mut p = r.publish;
                        p.retain = true;
                        p.dup = false;
                        p.packet_id = None;
                        p.qos = p.qos.less_value(qos);
                        p.properties.topic_alias = None;
                        p.properties.subscription_ids = sub_id.into_iter().collect();
                        retaineds.push((r.from, p));
                    }
                }
                Err(e) => log::warn!("{:?} load retained messages for {:?} error, {:?}", self.id, topic_filter, e),
            }
        }
        SubscribeAckReason::granted(qos)
    }

    async fn handle_unsubscribe(&mut self, unsub: Unsubscribe) -> Result<(), Reason> {
        let mut status = Vec::with_capacity(unsub.topic_filters.len());
        for topic_filter in unsub.topic_filters {
            let reason = match self.scx.hooks.client_unsubscribe(&self.id, &topic_filter).await {
                Some(reason) => reason,
                None => match self.scx.sessions.unsubscribe(&self.session, &topic_filter).await {
                    Ok(true) => UnsubscribeAckReason::Success,
                    Ok(false) => UnsubscribeAckReason::NoSubscriptionExisted,
                    Err(e) => {
                        log::warn!("{:?} unsubscribe {:?} error, {:?}", self.id, topic_filter, e);
                        UnsubscribeAckReason::UnspecifiedError
                    }
                },
            };
            status.push(reason);
        }
        self.dirty = true;
        self.send(Packet::UnsubscribeAck(UnsubscribeAck { packet_id: unsub.packet_id, status })).await
    }

    /// Sends one message taken from the session queue.
    async fn deliver(&mut self, from: From, publish: Publish) -> Result<(), Reason> {
        let client_id = &self.session.client_id;
        if publish.is_expired(self.scx.settings.mqtt.message_expiry, timestamp_millis()) {
            self.scx.stats.messages_dropped.inc();
            self.scx.hooks.message_dropped(Some(client_id), &from, &publish, "message expired").await;
            return Ok(());
        }
        let Some(mut publish) = self.scx.hooks.message_delivered(client_id, &from, publish).await else {
            log::debug!("{:?} delivery dropped by hook", self.id);
            return Ok(());
        };
        self.scx.stats.messages_delivered.inc();

        let status = match publish.qos {
            QoS::AtMostOnce => {
                publish.packet_id = None;
                return self.send_publish(&publish).await;
            }
            QoS::AtLeastOnce => MomentStatus::UnAck,
            QoS::ExactlyOnce => MomentStatus::UnReceived,
        };
        let packet_id = self.out_inflight.next_id()?;
        publish.packet_id = Some(packet_id);
        self.out_inflight.push_back(OutInflightMessage::new(status, from, publish.clone()));
        self.scx.stats.out_inflights.inc();
        self.dirty = true;
        self.send_publish(&publish).await
    }

    /// Writes a PUBLISH with the remaining expiry interval and an outbound alias applied.
    async fn send_publish(&mut self, publish: &Publish) -> Result<(), Reason> {
        let mut p = publish.clone();
        if let Some(secs) = p.properties.message_expiry_interval {
            let at = p.create_time + secs.get() as i64 * 1000;
            let remaining = ((at - timestamp_millis()).max(0) as u64).div_ceil(1000).max(1);
            p.properties.message_expiry_interval = NonZeroU32::new(remaining.min(u32::MAX as u64) as u32);
        }
        self.server_aliases.apply(&mut p);
        self.send(Packet::Publish(Box::new(p))).await
    }

    async fn retransmit(&mut self, m: &OutInflightMessage) -> Result<(), Reason> {
        match (m.status, m.publish.packet_id) {
            (MomentStatus::UnComplete, Some(packet_id)) => {
                self.send(Packet::PublishRelease(PublishAck2 { packet_id, reason_code: PublishAck2Reason::Success }))
                    .await
            }
            _ => {
                let mut p = m.publish.clone();
                p.dup = true;
                self.send_publish(&p).await
            }
        }
    }

    /// Resends everything a resumed session still had in flight, oldest first.
    async fn resend_inflight(&mut self) -> Result<(), Reason> {
        if self.out_inflight.is_empty() {
            return Ok(());
        }
        log::debug!("{:?} resend {} inflight messages", self.id, self.out_inflight.len());
        for mut m in self.out_inflight.to_inflight_messages() {
            m.retried();
            self.out_inflight.push_back(m);
        }
        for m in self.out_inflight.clone_inflight_messages() {
            self.retransmit(&m).await?;
        }
        Ok(())
    }

    async fn retry_inflight(&mut self) -> Result<(), Reason> {
        while let Some(mut m) = self.out_inflight.pop_front_timeout() {
            log::debug!("{:?} has timeout message in inflight: {:?}", self.id, m);
            m.retried();
            self.out_inflight.push_back(m.clone());
            self.retransmit(&m).await?;
        }
        Ok(())
    }

    /// Writes the session with the current handshake state if anything changed.
    fn checkpoint(&mut self) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }
        self.scx.sessions.checkpoint(
            &self.session,
            self.id.conn_id,
            self.out_inflight.clone_inflight_messages(),
            self.in_inflight.ids(),
        );
    }

    async fn send(&mut self, packet: Packet) -> Result<(), Reason> {
        if self.dump_packet {
            log::debug!("{:?} send {:?}", self.id, packet);
        }
        self.transport.send(packet).await.map_err(|e| {
            log::debug!("{:?} send error, {}", self.id, e);
            Reason::RemoteClosed
        })
    }

    /// Detaches from the session and publishes or schedules the will.
    async fn close(mut self, reason: Reason) -> Reason {
        log::debug!("{:?} connection closing, reason: {}", self.id, reason);
        if let Some(code) = reason.disconnect_code() {
            if let Err(e) = self.transport.send(Packet::Disconnect(Disconnect::new(code))).await {
                log::debug!("{:?} send DISCONNECT error, {}", self.id, e);
            }
        }
        self.transport.close().await;

        let inflight = self.out_inflight.to_inflight_messages();
        self.scx.stats.out_inflights.decs(inflight.len() as isize);
        self.scx.stats.in_inflights.decs(self.in_inflight.len() as isize);
        let awaiting_rel = self.in_inflight.ids();

        let action = self
            .scx
            .sessions
            .disconnect(&self.session, self.id.conn_id, inflight, awaiting_rel, !reason.is_clean_stop())
            .await;
        match action {
            WillAction::Publish(id, will) => self.scx.publish_will(id, will).await,
            WillAction::Delay(delay) => {
                log::debug!("{:?} will message delayed {:?}", self.id, delay);
                self.scx.schedule_will(self.session.clone(), delay);
            }
            WillAction::None => {}
        }
        //a takeover arriving from here on finds the session already offline
        self.scx.peers.remove(&self.id.client_id, self.id.conn_id);

        let terminated = !self.scx.sessions.get(&self.id.client_id).is_some_and(|s| Arc::ptr_eq(&s, &self.session));
        if terminated {
            self.scx.hooks.session_terminated(&self.id.client_id, &reason.to_string()).await;
        }
        self.scx.hooks.client_disconnected(&self.id, &reason).await;

        if let Some(done) = self.kick_ack.take() {
            let _ = done.send(());
        }
        log::debug!("{:?} connection closed, reason: {}", self.id, reason);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(clean_start: bool, expiry: Option<u32>) -> Connect {
        Connect {
            clean_start,
            client_id: ClientId::from_static("c"),
            session_expiry_interval_secs: expiry,
            ..Default::default()
        }
    }

    #[test]
    fn effective_session_expiry() {
        let mqtt = Mqtt::default();
        assert_eq!(session_expiry_interval(&mqtt, &connect(true, None)), 0);
        assert_eq!(session_expiry_interval(&mqtt, &connect(false, None)), 7200);
        assert_eq!(session_expiry_interval(&mqtt, &connect(true, Some(30))), 30);
        assert_eq!(session_expiry_interval(&mqtt, &connect(false, Some(u32::MAX))), 7 * 24 * 3600);
    }

    #[test]
    fn will_validation() {
        let mut mqtt = Mqtt::default();
        let mut will = LastWill {
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: TopicName::from_static("a/b"),
            message: Default::default(),
            will_delay_interval_sec: None,
            properties: Default::default(),
        };
        assert_eq!(check_will(&mqtt, None), None);
        assert_eq!(check_will(&mqtt, Some(&will)), None);

        mqtt.maximum_qos = 1;
        assert_eq!(check_will(&mqtt, Some(&will)), Some(ConnectAckReason::QoSNotSupported));
        will.qos = QoS::AtLeastOnce;
        mqtt.retain_available = false;
        assert_eq!(check_will(&mqtt, Some(&will)), Some(ConnectAckReason::RetainNotSupported));
        will.retain = false;
        will.topic = TopicName::from_static("a/+");
        assert_eq!(check_will(&mqtt, Some(&will)), Some(ConnectAckReason::TopicNameInvalid));
    }

    #[test]
    fn ack_reason_reflects_routing() {
        assert_eq!(publish_ack_reason(Ok(0)), PublishAckReason::NoMatchingSubscribers);
        assert_eq!(publish_ack_reason(Ok(2)), PublishAckReason::Success);
        assert_eq!(publish_ack_reason(Err(PublishAckReason::NotAuthorized)), PublishAckReason::NotAuthorized);
    }
}
