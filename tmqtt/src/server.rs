//! Broker lifecycle: background sweepers and connection spawning.
//!
//! Listeners are external. Anything that yields a [`Transport`] per accepted client can
//! feed [`MqttServer::accept`] or [`MqttServer::serve`]:
//!
//! ```rust,ignore
//! let scx = ServerContext::new(settings).storage(storage).build().await?;
//! let server = MqttServer::new(scx).start();
//! server.serve(incoming_framed_streams).await;
//! ```

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::connection;
use crate::context::ServerContext;
use crate::transport::Transport;
use crate::types::Reason;

pub struct MqttServer {
    scx: ServerContext,
    sweepers: Vec<JoinHandle<()>>,
}

impl MqttServer {
    pub fn new(scx: ServerContext) -> Self {
        Self { scx, sweepers: Vec::new() }
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.scx
    }

    /// Starts the session expiry and retained expiry sweepers.
    pub fn start(mut self) -> Self {
        self.scx.settings.logs();
        self.sweepers.push(tokio::spawn(session_expiry_sweeper(self.scx.clone())));
        if self.scx.retain.enable() {
            self.sweepers.push(tokio::spawn(retain_expiry_sweeper(self.scx.clone())));
        }
        self
    }

    /// Runs one connection on its own task.
    pub fn accept<T: Transport + 'static>(&self, transport: T) -> JoinHandle<Reason> {
        let scx = self.scx.clone();
        tokio::spawn(async move {
            let reason = connection::process(scx, transport).await;
            log::debug!("connection task finished, reason: {}", reason);
            reason
        })
    }

    /// Accepts transports until the stream ends.
    pub async fn serve<S, T>(&self, incoming: S)
    where
        S: Stream<Item = T> + Unpin,
        T: Transport + 'static,
    {
        let mut incoming = incoming;
        while let Some(transport) = incoming.next().await {
            self.accept(transport);
        }
        log::info!("incoming transports exhausted");
    }

    /// Closes every connection, stops the sweepers and waits for pending persistence writes.
    pub async fn shutdown(self) {
        log::info!("shutting down, {} connections", self.scx.peers.len());
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
        self.scx.peers.kick_all(Reason::ServerShutdown).await;
        self.scx.persister.flush().await;
        if let Err(e) = self.scx.storage.flush().await {
            log::error!("{} storage flush error, {:?}", self.scx.storage.name(), e);
        }
    }
}

async fn session_expiry_sweeper(scx: ServerContext) {
    let mut interval = tokio::time::interval(scx.settings.mqtt.session_expiry_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let removed = scx.sessions.remove_expired().await;
        if removed.is_empty() {
            continue;
        }
        log::debug!("{} sessions expired", removed.len());
        for (client_id, will) in removed {
            if let Some((id, will)) = will {
                scx.publish_will(id, will).await;
            }
            scx.hooks.session_terminated(&client_id, "expired").await;
        }
    }
}

async fn retain_expiry_sweeper(scx: ServerContext) {
    let mut interval = tokio::time::interval(scx.settings.mqtt.retain_expiry_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let removed = scx.retain.remove_expired_messages().await;
        if removed > 0 {
            log::debug!("{} expired retained messages removed", removed);
        }
    }
}
