//! Plugin hook pipeline.
//!
//! Handlers are registered per [`Type`] while the server context is being built and
//! are immutable afterwards. For one hook point they run in registration order; every
//! handler sees the result accumulated so far and returns `(proceed, result)`. The
//! first handler returning `proceed = false` ends the chain with its result.

use async_trait::async_trait;

use crate::packet::{Connect, ConnectAckReason, PublishAckReason, SubscribeAckReason, UnsubscribeAckReason};
use crate::types::*;

pub type Proceed = bool;
pub type ReturnType = (Proceed, Option<HookResult>);

#[async_trait]
pub trait Handler: Sync + Send {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Type {
    SessionCreated,
    SessionTerminated,

    ClientConnect,
    ClientDisconnected,
    ClientSubscribe,
    ClientUnsubscribe,

    MessagePublish,
    MessageDelivered,
    MessageAcked,
    MessageDropped,
}

#[derive(Debug, Clone)]
pub enum Parameter<'a> {
    SessionCreated(&'a Id),
    SessionTerminated(&'a ClientId, &'a str),

    ClientConnect(&'a Id, &'a Connect),
    ClientDisconnected(&'a Id, &'a Reason),
    ClientSubscribe(&'a Id, &'a TopicFilter, &'a SubscriptionOptions),
    ClientUnsubscribe(&'a Id, &'a TopicFilter),

    MessagePublish(&'a From, &'a Publish),
    MessageDelivered(&'a ClientId, &'a From, &'a Publish),
    MessageAcked(&'a Id, &'a From, &'a Publish),
    MessageDropped(Option<&'a ClientId>, &'a From, &'a Publish, &'a str),
}

impl Parameter<'_> {
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::SessionCreated(_) => Type::SessionCreated,
            Parameter::SessionTerminated(_, _) => Type::SessionTerminated,

            Parameter::ClientConnect(_, _) => Type::ClientConnect,
            Parameter::ClientDisconnected(_, _) => Type::ClientDisconnected,
            Parameter::ClientSubscribe(_, _, _) => Type::ClientSubscribe,
            Parameter::ClientUnsubscribe(_, _) => Type::ClientUnsubscribe,

            Parameter::MessagePublish(_, _) => Type::MessagePublish,
            Parameter::MessageDelivered(_, _, _) => Type::MessageDelivered,
            Parameter::MessageAcked(_, _, _) => Type::MessageAcked,
            Parameter::MessageDropped(_, _, _, _) => Type::MessageDropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    ///Connect refused, for ClientConnect
    ConnectAckReason(ConnectAckReason),
    ///Granted QoS cap, for ClientSubscribe
    SubscribeQoS(QoS),
    ///Subscription refused, for ClientSubscribe
    SubscribeDeny(SubscribeAckReason),
    ///Unsubscription refused, for ClientUnsubscribe
    UnsubscribeDeny(UnsubscribeAckReason),
    ///Rewritten message, for MessagePublish/MessageDelivered
    Publish(Box<Publish>),
    ///Message refused, for MessagePublish
    PublishDeny(PublishAckReason),
    ///Message not delivered to this subscriber, for MessageDelivered
    Drop,
}

/// Outcome of the subscribe hook for one topic filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeDecision {
    Allow(QoS),
    Deny(SubscribeAckReason),
}

#[derive(Default)]
pub struct HookManager {
    handlers: HashMap<Type, Vec<Box<dyn Handler>>>,
}

impl HookManager {
    #[inline]
    pub fn new() -> HookManager {
        Self::default()
    }

    /// Appends a handler; handlers of one type run in the order they were added.
    pub fn add(&mut self, typ: Type, handler: Box<dyn Handler>) {
        self.handlers.entry(typ).or_default().push(handler);
    }

    #[inline]
    pub fn len(&self, typ: Type) -> usize {
        self.handlers.get(&typ).map(|h| h.len()).unwrap_or_default()
    }

    async fn exec(&self, p: Parameter<'_>) -> Option<HookResult> {
        let mut acc = None;
        if let Some(handlers) = self.handlers.get(&p.get_type()) {
            for handler in handlers {
                let (proceed, new_acc) = handler.hook(&p, acc).await;
                if !proceed {
                    return new_acc;
                }
                acc = new_acc;
            }
        }
        acc
    }

    ///Session created
    pub async fn session_created(&self, id: &Id) {
        self.exec(Parameter::SessionCreated(id)).await;
    }

    ///Session terminated
    pub async fn session_terminated(&self, client_id: &ClientId, reason: &str) {
        self.exec(Parameter::SessionTerminated(client_id, reason)).await;
    }

    ///CONNECT received; handlers may refuse it with a CONNACK reason
    pub async fn client_connect(&self, id: &Id, connect: &Connect) -> ConnectAckReason {
        match self.exec(Parameter::ClientConnect(id, connect)).await {
            Some(HookResult::ConnectAckReason(reason)) => {
                log::debug!("{:?} client_connect result: {:?}", id, reason);
                reason
            }
            _ => ConnectAckReason::Success,
        }
    }

    ///Connection closed
    pub async fn client_disconnected(&self, id: &Id, reason: &Reason) {
        self.exec(Parameter::ClientDisconnected(id, reason)).await;
    }

    ///One topic filter of a SUBSCRIBE; handlers may refuse it or lower the granted QoS
    pub async fn client_subscribe(
        &self,
        id: &Id,
        topic_filter: &TopicFilter,
        opts: &SubscriptionOptions,
    ) -> SubscribeDecision {
        match self.exec(Parameter::ClientSubscribe(id, topic_filter, opts)).await {
            Some(HookResult::SubscribeDeny(reason)) => SubscribeDecision::Deny(reason),
            Some(HookResult::SubscribeQoS(qos)) => SubscribeDecision::Allow(opts.qos.less_value(qos)),
            _ => SubscribeDecision::Allow(opts.qos),
        }
    }

    ///One topic filter of an UNSUBSCRIBE; handlers may refuse it
    pub async fn client_unsubscribe(&self, id: &Id, topic_filter: &TopicFilter) -> Option<UnsubscribeAckReason> {
        match self.exec(Parameter::ClientUnsubscribe(id, topic_filter)).await {
            Some(HookResult::UnsubscribeDeny(reason)) => Some(reason),
            _ => None,
        }
    }

    ///Message arrived from a client; handlers may rewrite or refuse it
    pub async fn message_publish(&self, from: &From, publish: &Publish) -> Result<Option<Publish>, PublishAckReason> {
        match self.exec(Parameter::MessagePublish(from, publish)).await {
            Some(HookResult::PublishDeny(reason)) => Err(reason),
            Some(HookResult::Publish(p)) => Ok(Some(*p)),
            _ => Ok(None),
        }
    }

    ///Message about to be sent to `to`; handlers may rewrite it or drop it.
    ///Returns None when the message must not be delivered.
    pub async fn message_delivered(&self, to: &ClientId, from: &From, publish: Publish) -> Option<Publish> {
        let result = self.exec(Parameter::MessageDelivered(to, from, &publish)).await;
        match result {
            Some(HookResult::Drop) => None,
            Some(HookResult::Publish(p)) => Some(*p),
            _ => Some(publish),
        }
    }

    ///QoS 1/2 handshake completed
    pub async fn message_acked(&self, id: &Id, from: &From, publish: &Publish) {
        self.exec(Parameter::MessageAcked(id, from, publish)).await;
    }

    ///Message discarded
    pub async fn message_dropped(&self, to: Option<&ClientId>, from: &From, publish: &Publish, reason: &str) {
        log::debug!("message dropped, to: {:?}, topic: {}, reason: {}", to, publish.topic, reason);
        self.exec(Parameter::MessageDropped(to, from, publish, reason)).await;
    }
}
