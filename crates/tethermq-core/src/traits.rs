//! Session, connector and probe traits.
//!
//! The wire protocol is an external dependency: the connection manager only
//! sees a [`SessionConnector`] that performs a handshake and yields a
//! [`ProtocolSession`], and a [`Probe`] that checks reachability first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Credentials;
use crate::error::{ConnectError, ConnectionError, SessionResult};
use crate::types::QoS;

/// Everything a connector needs for one handshake attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    /// Broker host name or IP address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier, unique to this attempt
    pub client_id: String,
    /// Optional credentials
    pub credentials: Option<Credentials>,
    /// Protocol-level keep-alive
    pub keep_alive: Duration,
    /// Clean-session flag
    pub clean_session: bool,
}

/// Where a session delivers inbound traffic and reports closure.
///
/// Implementations are called from the session's background task and must
/// not block or run consumer code.
pub trait InboundSink: Send + Sync + fmt::Debug {
    /// A message arrived on `topic`.
    fn message(&self, topic: String, payload: Bytes);

    /// The transport closed; the session is unusable.
    fn closed(&self, reason: String);
}

/// Shared handle to an [`InboundSink`].
pub type SessionSink = Arc<dyn InboundSink>;

/// One logical connection to the broker.
///
/// All operations take `&self`; the manager serializes subscribe, unsubscribe
/// and publish through a single writer task, while keep-alive runs
/// concurrently from the Liveness Monitor.
#[async_trait]
pub trait ProtocolSession: Send + Sync + fmt::Debug {
    /// Client identifier negotiated for this session.
    fn client_id(&self) -> &str;

    /// Subscribe to a batch of topic filters.
    async fn subscribe(&self, topics: &[String], qos: QoS) -> SessionResult<()>;

    /// Remove a topic filter.
    async fn unsubscribe(&self, topic: &str) -> SessionResult<()>;

    /// Publish a payload.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<()>;

    /// Lightweight liveness check. An error means the session is dead.
    async fn keep_alive(&self) -> SessionResult<()>;

    /// Close the session and release the transport.
    async fn close(&self) -> SessionResult<()>;
}

/// Opens [`ProtocolSession`]s.
#[async_trait]
pub trait SessionConnector: Send + Sync + fmt::Debug {
    /// Perform the handshake described by `request`.
    ///
    /// On success, inbound messages for the new session must go to `sink`.
    /// The caller bounds this call with the handshake timeout and may drop
    /// the future at any point, so partially opened transports must be
    /// released on drop.
    async fn connect(
        &self,
        request: ConnectRequest,
        sink: SessionSink,
    ) -> Result<Arc<dyn ProtocolSession>, ConnectError>;
}

/// Cheap reachability check run before each handshake.
#[async_trait]
pub trait Probe: Send + Sync + fmt::Debug {
    /// Returns `Ok(())` when `host:port` looks reachable, otherwise
    /// [`ConnectionError::ProbeUnreachable`]. Must return within `timeout`.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<(), ConnectionError>;
}
