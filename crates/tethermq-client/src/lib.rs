//! # tethermq Client
//!
//! Resilient publish/subscribe connection manager for hosts whose main
//! context must never block on the network.
//!
//! ## Features
//!
//! - Reachability probe before every handshake
//! - Exponential-backoff reconnection with an optional attempt cap
//! - Durable subscriptions reinstated after every reconnect
//! - Strict FIFO hand-off of inbound messages to the owner context
//! - Periodic keep-alive with escalation to reconnection
//! - Supersession-safe attempts: a stale handshake never installs a session
//!
//! ## Architecture
//!
//! ```text
//! owner context                       background tokio tasks
//! ─────────────                       ──────────────────────
//! ConnectionManager ──start()──────▶  attempt: probe → handshake → install
//!   publish/subscribe ─────────────▶  writer lane (ordered commands)
//!   drain() ◀── DispatchQueue ◀─────  session reader, controller, liveness
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tethermq_client::ConnectionManager;
//! use tethermq_core::{ClientConfig, ConnectionObserver};
//!
//! struct Status;
//! impl ConnectionObserver for Status {
//!     fn on_connected(&self) {
//!         println!("online");
//!     }
//!     fn on_connection_lost(&self, reason: &str) {
//!         println!("offline: {reason}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::builder(ClientConfig::default())
//!     .with_observer(Arc::new(Status))
//!     .build()?;
//!
//! manager.subscribe("robot/pose", |msg| {
//!     println!("pose: {} bytes", msg.size());
//!     Ok(())
//! });
//! manager.publish("robot/cmd", "home");
//!
//! loop {
//!     manager.wait_for_dispatch().await;
//!     manager.drain();
//! }
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod backoff;
pub mod dispatch;
pub mod error;
pub mod liveness;
mod manager;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod probe;
pub mod registry;

pub use backoff::{Backoff, BackoffDecision};
pub use dispatch::{Dispatch, DispatchQueue, DrainReport};
pub use error::{HandlerError, ManagerError, ManagerResult};
pub use liveness::LivenessMonitor;
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ManagerStats, ObserverId};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnector, MqttSession};
pub use probe::TcpProbe;
pub use registry::{MessageHandler, SubscribeAction, SubscriptionRegistry, topic_matches};
