//! Extension point for multi-node deployments.
//!
//! A single node never needs an implementation. When one is registered, every message
//! published on this node is handed to it after local routing, and messages arriving
//! from peer nodes are fed back in through [`ServerContext::receive_from_cluster`].
//!
//! [`ServerContext::receive_from_cluster`]: crate::context::ServerContext::receive_from_cluster

use async_trait::async_trait;

use crate::types::{From, Publish};
use crate::Result;

#[async_trait]
pub trait ClusterForwarder: Sync + Send {
    /// Hands a locally published message to the other nodes.
    async fn forward(&self, from: &From, publish: &Publish) -> Result<()>;
}
