#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use tmqtt::conf::{Options, Settings};
//! use tmqtt::context::ServerContext;
//! use tmqtt::logger::{config_logger, logger_init};
//! use tmqtt::server::MqttServer;
//! use tmqtt::transport::ChannelTransport;
//!
//! #[tokio::main]
//! async fn main() -> tmqtt::Result<()> {
//!     let settings = Settings::new(Options::default())?;
//!     let logger = config_logger(&settings.log)?;
//!     logger_init(&logger, &settings.log)?;
//!
//!     let scx = ServerContext::new(settings).build().await?;
//!     let server = MqttServer::new(scx).start();
//!
//!     let (transport, client) = ChannelTransport::pair(None);
//!     let conn = server.accept(transport);
//!     drop(client);
//!     println!("connection ended: {}", conn.await?);
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Broker Core
pub mod cluster; // Multi-node forwarding seam
pub mod connection; // Per-connection state machine
pub mod context; // Shared server context
pub mod server; // Server lifecycle and sweepers
pub mod shared; // Peers and publish dispatch
pub mod stats; // Counters and snapshots

/// Sessions and Delivery
pub mod inflight; // QoS 1/2 in-flight windows
pub mod queue; // Per-session outbound queue
pub mod retain; // Retained messages
pub mod session; // Client sessions
pub mod storage; // Persistence seam and memory backend

/// Routing
pub mod alias; // Topic alias tables
pub mod router; // Subscription routing
pub mod topic; // Topic parsing and matching
pub mod trie; // Topic trie structure

/// Extension and Plumbing
pub mod hook; // Plugin hooks
pub mod logger; // slog based logging
pub mod packet; // Decoded control packets
pub mod transport; // Packet streams
pub mod types; // Common data types

/// Re-exports
pub use tmqtt_conf as conf; // Settings
pub use tmqtt_utils as utils; // Common utilities

pub type Result<T> = anyhow::Result<T>;
