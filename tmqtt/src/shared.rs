//! Connected peers and the publish dispatcher.
//!
//! [`Peers`] maps each online client id to the control channel of the connection that
//! currently owns it. The dispatcher half lives on [`ServerContext`]: it runs the publish
//! hook, updates the retained store, matches subscribers and enqueues one copy per
//! subscriber into that subscriber's session queue. Delivering to another client is
//! always an enqueue, never a call into its connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::conf::MqueuePolicy;
use crate::context::ServerContext;
use crate::packet::PublishAckReason;
use crate::queue::Policy;
use crate::retain::Retained;
use crate::session::Session;
use crate::topic::Topic;
use crate::types::*;

/// How long a kick waits for the old connection to finish its close path.
const KICK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a publisher waits on a full queue under the blocking policy.
const BLOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Message {
    /// Close the connection for the given reason, acknowledging once the session is detached.
    Kick(Reason, oneshot::Sender<()>),
}

pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

struct Peer {
    conn_id: ConnId,
    tx: Tx,
}

#[derive(Default)]
pub struct Peers {
    peers: DashMap<ClientId, Peer>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, client_id: ClientId, conn_id: ConnId, tx: Tx) {
        if let Some(old) = self.peers.insert(client_id.clone(), Peer { conn_id, tx }) {
            log::warn!("{} peer replaced without kick, old conn_id: {}", client_id, old.conn_id);
        }
    }

    /// Removes the peer only if it is still owned by `conn_id`.
    #[inline]
    pub fn remove(&self, client_id: &ClientId, conn_id: ConnId) -> bool {
        self.peers.remove_if(client_id, |_, p| p.conn_id == conn_id).is_some()
    }

    #[inline]
    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.peers.contains_key(client_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Asks the connection owning `client_id` to close and waits until it has detached
    /// from its session. Returns false when no connection owned the client id.
    pub async fn kick(&self, client_id: &ClientId, reason: Reason) -> bool {
        let Some(tx) = self.peers.get(client_id).map(|p| p.tx.clone()) else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Message::Kick(reason, done_tx)).is_err() {
            log::debug!("{} kick, connection already closed", client_id);
            return false;
        }
        match tokio::time::timeout(KICK_TIMEOUT, done_rx).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!("{} kick, timeout waiting for the old connection", client_id);
                true
            }
        }
    }

    pub async fn kick_all(&self, reason: Reason) {
        let client_ids = self.peers.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        for client_id in client_ids {
            self.kick(&client_id, reason.clone()).await;
        }
    }
}

impl ServerContext {
    /// Routes one message published on this node.
    ///
    /// Returns the number of matched subscribers, or the reason the publish hook refused
    /// the message.
    pub async fn publish(&self, from: From, publish: Publish) -> std::result::Result<usize, PublishAckReason> {
        self.stats.messages_received.inc();
        let publish = match self.hooks.message_publish(&from, &publish).await? {
            Some(rewritten) => rewritten,
            None => publish,
        };
        if let Err(e) = Topic::parse_name(&publish.topic) {
            log::warn!("{:?} publish to invalid topic {:?}, {}", from.id, publish.topic, e);
            return Err(PublishAckReason::TopicNameInvalid);
        }

        if publish.retain {
            self.retain_message(&from, &publish).await;
        }

        if let Some(cluster) = self.cluster.as_ref() {
            self.stats.forwards.inc();
            if let Err(e) = cluster.forward(&from, &publish).await {
                log::warn!("{:?} cluster forward error, topic: {}, {:?}", from.id, publish.topic, e);
            }
        }

        Ok(self.forwards(from, publish).await)
    }

    /// Entry point for messages that were published on another node.
    pub async fn receive_from_cluster(&self, from: From, publish: Publish) -> usize {
        if publish.retain {
            self.retain_message(&from, &publish).await;
        }
        self.forwards(From::from_cluster(from.id), publish).await
    }

    /// Publishes a will message through the normal publish path.
    pub async fn publish_will(&self, id: Id, will: LastWill) {
        let topic = will.topic.clone();
        if let Err(reason) = self.publish(From::from_last_will(id.clone()), will.to_publish()).await {
            log::warn!("{:?} will message to {} refused, {:?}", id, topic, reason);
        }
    }

    /// Publishes the session's pending will after `delay`, unless a resume or the expiry
    /// sweeper took it first.
    pub fn schedule_will(&self, s: Arc<Session>, delay: Duration) {
        let scx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((id, will)) = s.take_pending_will() {
                scx.publish_will(id, will).await;
            }
        });
    }

    async fn retain_message(&self, from: &From, publish: &Publish) {
        if !self.retain.enable() {
            return;
        }
        let retained = Retained::new(from.clone(), publish.clone(), self.settings.mqtt.message_expiry);
        if let Err(e) = self.retain.set(retained).await {
            log::warn!("{:?} store retained message error, topic: {}, {:?}", from.id, publish.topic, e);
        }
    }

    /// Fans a message out to every matching subscriber's queue.
    pub async fn forwards(&self, from: From, publish: Publish) -> usize {
        let matches = match self.router.matches(&from, &publish.topic).await {
            Ok(matches) => matches,
            Err(e) => {
                log::warn!("forwards, from: {:?}, topic: {:?}, error: {:?}", from.id, publish.topic, e);
                return 0;
            }
        };
        if matches.is_empty() {
            log::debug!("{:?} no subscribers for {}", from.id, publish.topic);
            return 0;
        }

        let matched = matches.len();
        for m in matches {
            let Some(s) = self.sessions.get(&m.client_id) else {
                log::debug!("{} matched without a session, topic: {}", m.client_id, publish.topic);
                continue;
            };
            let mut p = publish.clone();
            p.dup = false;
            p.packet_id = None;
            p.properties.topic_alias = None;
            p.qos = p.qos.less_value(m.opts.qos);
            p.retain = p.retain && m.opts.retain_as_published;
            p.properties.subscription_ids = m.sub_ids;
            self.enqueue(&s, from.clone(), p).await;
        }
        matched
    }

    /// Puts one message into a session's outbound queue, applying the queue policy.
    /// Returns false if the message itself was discarded.
    ///
    /// Messages a persistent session must not lose are recorded with the persister as
    /// they enter the queue.
    pub async fn enqueue(&self, s: &Session, from: From, publish: Publish) -> bool {
        let mqtt = &self.settings.mqtt;
        let online = s.is_online();
        if !online && publish.qos == QoS::AtMostOnce && !mqtt.queue_qos0_messages {
            self.dropped(s, &from, &publish, "qos0 message to offline session").await;
            return false;
        }
        let durable = s.session_expiry_interval_secs() > 0 && (!online || publish.qos != QoS::AtMostOnce);
        let record = |msg: &(From, Publish)| {
            if durable {
                self.persister.enqueue_message(s.client_id.clone(), msg.clone());
            }
        };

        let qos = publish.qos;
        let res = match (online, qos, mqtt.mqueue_policy) {
            (false, _, _) => s.queue.push_with((from, publish), Policy::Early, record),
            (true, QoS::AtMostOnce, _) => s.queue.push_with((from, publish), Policy::Current, record),
            (true, _, MqueuePolicy::DropOldest) => s.queue.push_with((from, publish), Policy::Early, record),
            (true, _, MqueuePolicy::Block) => s.queue.push_wait_with((from, publish), BLOCK_WAIT, record).await,
        };
        match res {
            Ok(()) => true,
            Err((from, publish)) => {
                self.dropped(s, &from, &publish, "message queue is full").await;
                !online || qos != QoS::AtMostOnce
            }
        }
    }

    async fn dropped(&self, s: &Session, from: &From, publish: &Publish, reason: &str) {
        self.stats.messages_dropped.inc();
        log::warn!("{} message dropped, topic: {}, reason: {}", s.client_id, publish.topic, reason);
        self.hooks.message_dropped(Some(&s.client_id), from, publish, reason).await;
    }
}
