//! # tethermq Core
//!
//! Foundation types for the tethermq resilient publish/subscribe client.
//! This crate holds everything the connection manager and its collaborators
//! agree on, without performing any I/O itself.
//!
//! ## Overview
//!
//! This crate defines:
//! - **State**: [`ConnectionState`] and the [`QoS`] levels
//! - **Errors**: the failure taxonomy [`ConnectionError`], plus [`SessionError`],
//!   [`ConnectError`] and [`RefusalCode`]
//! - **Config**: [`ClientConfig`], [`ReconnectPolicy`], [`TimeoutConfig`], [`Credentials`]
//! - **Events**: [`Notification`] values and the [`ConnectionObserver`] trait
//! - **Messages**: [`InboundMessage`]
//! - **Traits**: [`ProtocolSession`], [`SessionConnector`], [`Probe`]
//!
//! ## Usage
//!
//! Protocol backends implement [`SessionConnector`] and [`ProtocolSession`]:
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use tethermq_core::{ConnectError, ConnectRequest, ProtocolSession, SessionConnector, SessionSink};
//!
//! #[derive(Debug)]
//! struct MyConnector;
//!
//! #[async_trait]
//! impl SessionConnector for MyConnector {
//!     async fn connect(
//!         &self,
//!         request: ConnectRequest,
//!         sink: SessionSink,
//!     ) -> Result<std::sync::Arc<dyn ProtocolSession>, ConnectError> {
//!         /* handshake, then hand inbound traffic to `sink` */
//!     }
//! }
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

mod config;
mod error;
mod events;
mod message;
mod traits;
mod types;

// Re-export all public items
pub use config::{ClientConfig, ClientConfigBuilder, Credentials, ReconnectPolicy, TimeoutConfig};
pub use error::{
    ConfigError, ConnectError, ConnectionError, RefusalCode, SessionError, SessionResult,
};
pub use events::{ConnectionObserver, Notification};
pub use message::InboundMessage;
pub use traits::{
    ConnectRequest, InboundSink, Probe, ProtocolSession, SessionConnector, SessionSink,
};
pub use types::{ConnectionState, QoS};
