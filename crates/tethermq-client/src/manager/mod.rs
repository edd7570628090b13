//! The communication manager
//!
//! [`ConnectionManager`] is the handle the owner context holds. Every method
//! returns immediately: network work runs on background tokio tasks and
//! comes back through the dispatch queue, which the owner empties with
//! [`ConnectionManager::drain`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tethermq_client::ConnectionManager;
//! use tethermq_core::ClientConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(ClientConfig::default())?;
//! manager.subscribe("lights/+/state", |msg| {
//!     println!("{}: {:?}", msg.topic, msg.payload_str());
//!     Ok(())
//! });
//!
//! let mut frame = tokio::time::interval(Duration::from_millis(16));
//! loop {
//!     frame.tick().await;
//!     manager.drain();
//! }
//! # }
//! ```

mod builder;
mod controller;
mod session;

pub use builder::ConnectionManagerBuilder;

use std::sync::Arc;

use bytes::Bytes;

use tethermq_core::{ClientConfig, ConnectionObserver, ConnectionState, InboundMessage, QoS};

use crate::dispatch::{self, DrainReport};
use crate::error::{HandlerError, ManagerResult};
use controller::Inner;

/// Identifies an observer registered with [`ConnectionManager::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

/// Counters since the manager was built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Connect attempts started
    pub attempts: u64,
    /// Sessions installed
    pub connects: u64,
    /// Installed sessions that were lost
    pub losses: u64,
    /// Messages a handler accepted
    pub delivered: u64,
    /// Messages dropped at drain for lack of a handler
    pub dropped: u64,
    /// Handlers that returned an error or panicked
    pub handler_faults: u64,
    /// Publishes dropped because no session was connected
    pub publishes_dropped: u64,
}

/// Resilient publish/subscribe connection manager
///
/// Keeps one logical connection to the broker alive: probes, connects with a
/// per-attempt client id, reconnects with exponential backoff, reinstates
/// durable subscriptions and watches liveness. Inbound messages and
/// connection notifications are queued and handed out only from
/// [`drain`](Self::drain), so handlers and observers always run on the
/// caller's context.
///
/// Dropping the manager stops it.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("inner", &self.inner)
            .finish()
    }
}

impl ConnectionManager {
    /// Build a manager with the built-in connector and probe on the current
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManagerBuilder::build`].
    pub fn new(config: ClientConfig) -> ManagerResult<Self> {
        Self::builder(config).build()
    }

    /// Start configuring a manager
    pub fn builder(config: ClientConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    // ============================================================================
    // LIFECYCLE
    // ============================================================================

    /// Begin connecting. A no-op while an attempt sequence is already active
    /// (connecting, connected, reconnecting, or waiting to retry).
    pub fn start(&self) {
        self.inner.start();
    }

    /// Cancel timers and in-flight attempts, close the session and go to
    /// `Disconnected`. Nothing reconnects until [`start`](Self::start).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Change the broker. If an attempt sequence is active it is superseded
    /// by a fresh one against the new address; otherwise the address is used
    /// by the next [`start`](Self::start).
    pub fn set_broker_settings(&self, address: impl Into<String>, port: u16) {
        self.inner.set_broker_settings(address.into(), port);
    }

    // ============================================================================
    // PUBLISH / SUBSCRIBE
    // ============================================================================

    /// Publish with the configured default QoS. Dropped with a warning when
    /// not connected.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.inner.publish(topic.into(), payload.into(), None, false);
    }

    /// Publish with an explicit QoS and retain flag.
    pub fn publish_with(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) {
        self.inner
            .publish(topic.into(), payload.into(), Some(qos), retain);
    }

    /// Subscribe `handler` to `topic` (MQTT filters allowed). The subscription
    /// survives reconnects. Subscribing again replaces the handler.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.subscribe(topic.into(), Arc::new(handler), true);
    }

    /// Like [`subscribe`](Self::subscribe), but forgotten when the connection
    /// is lost or stopped instead of being reinstated.
    pub fn subscribe_transient<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.subscribe(topic.into(), Arc::new(handler), false);
    }

    /// Remove the handler for `topic` and unsubscribe if connected.
    pub fn unsubscribe(&self, topic: &str) {
        self.inner.unsubscribe(topic);
    }

    /// Wait until every subscribe, unsubscribe and publish issued so far has
    /// been handed to the session. Returns `false` if there is no session or
    /// it went away first.
    pub async fn flush(&self) -> bool {
        match self.inner.flush_request() {
            Some(done) => done.await.is_ok(),
            None => false,
        }
    }

    // ============================================================================
    // OBSERVERS AND DISPATCH
    // ============================================================================

    /// Register an observer. Safe to call at any time.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
        self.inner.add_observer(observer)
    }

    /// Remove an observer. Returns `false` if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.remove_observer(id)
    }

    /// Deliver everything queued so far, in arrival order, on the calling
    /// context. Call it every cycle of the owner loop.
    pub fn drain(&self) -> DrainReport {
        let batch = self.inner.queue().take_all();
        if batch.is_empty() {
            return DrainReport::default();
        }

        let observers = self.inner.observers();
        let report = dispatch::deliver(batch, &observers, |topic| {
            self.inner.lock().registry.resolve(topic)
        });
        self.inner.record_drain(&report);
        report
    }

    /// Resolve once something is waiting to be drained.
    pub async fn wait_for_dispatch(&self) {
        self.inner.queue().wait_ready().await;
    }

    // ============================================================================
    // INTROSPECTION
    // ============================================================================

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    /// Whether a session is installed and healthy
    pub fn is_connected(&self) -> bool {
        self.inner.lock().state.is_connected()
    }

    /// Client id of the installed session
    pub fn client_id(&self) -> Option<String> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|handle| handle.client_id.clone())
    }

    /// Topics in the active set
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.lock().registry.active_topics()
    }

    /// Topics waiting for the next connect
    pub fn pending_topics(&self) -> Vec<String> {
        self.inner.lock().registry.pending_topics()
    }

    /// Items waiting in the dispatch queue
    pub fn queue_len(&self) -> usize {
        self.inner.queue().len()
    }

    /// Snapshot of the manager's counters
    pub fn stats(&self) -> ManagerStats {
        self.inner.stats()
    }

    /// A copy of the active configuration
    pub fn config(&self) -> ClientConfig {
        self.inner.lock().config.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
