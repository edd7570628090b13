//! Connection controller
//!
//! Owns the state machine, the session slot, the subscription registry and
//! the backoff, all behind one lock. Every background task (attempt, retry
//! timer, writer lane, liveness monitor, session reader) is tagged with the
//! epoch that was current when it was created; a task whose epoch is stale
//! only cleans up after itself.
//!
//! ```text
//!  Disconnected ──start()──▶ Connecting ──ok──▶ Connected
//!        ▲                     │   ▲               │
//!        │ cap reached         │   │ timer         │ closed / keep-alive
//!        │                     ▼   │               ▼
//!        └───────────────── Failed(reason) ◀── Reconnecting
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tethermq_core::{
    ClientConfig, ConnectRequest, ConnectionError, ConnectionObserver, ConnectionState,
    Notification, Probe, ProtocolSession, QoS, SessionConnector,
};

use super::session::{Command, EpochSink, SessionHandle};
use super::{ManagerStats, ObserverId};
use crate::backoff::{Backoff, BackoffDecision};
use crate::dispatch::{DispatchQueue, DrainReport};
use crate::liveness::LivenessMonitor;
use crate::registry::{MessageHandler, SubscribeAction, SubscriptionRegistry};

/// Everything guarded by the single state lock
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: ConnectionState,
    pub(crate) epoch: u64,
    pub(crate) session: Option<SessionHandle>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) backoff: Backoff,
    pub(crate) config: ClientConfig,
    /// The current attempt sequence started with a lost connection
    lost: bool,
    /// Transport close reported by the current attempt before it installed
    early_close: Option<ConnectionError>,
    attempt: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    connects: AtomicU64,
    losses: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_faults: AtomicU64,
    publishes_dropped: AtomicU64,
}

pub(crate) struct Inner {
    runtime: Handle,
    connector: Arc<dyn SessionConnector>,
    probe: Arc<dyn Probe>,
    queue: DispatchQueue,
    observers: Mutex<Vec<(ObserverId, Arc<dyn ConnectionObserver>)>>,
    next_observer: AtomicU64,
    /// Mirror of `Shared::epoch` for the inbound hot path
    current_epoch: AtomicU64,
    counters: Counters,
    shared: Mutex<Shared>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("connector", &self.connector)
            .field("probe", &self.probe)
            .field("queue", &self.queue)
            .field("observers", &self.observers.lock().len())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}

impl Inner {
    pub(crate) fn new(
        runtime: Handle,
        config: ClientConfig,
        connector: Arc<dyn SessionConnector>,
        probe: Arc<dyn Probe>,
        observers: Vec<Arc<dyn ConnectionObserver>>,
    ) -> Self {
        let observers: Vec<_> = observers
            .into_iter()
            .enumerate()
            .map(|(n, observer)| (ObserverId(n as u64), observer))
            .collect();
        let next_observer = AtomicU64::new(observers.len() as u64);

        Self {
            runtime,
            connector,
            probe,
            queue: DispatchQueue::new(config.queue_warn_threshold),
            observers: Mutex::new(observers),
            next_observer,
            current_epoch: AtomicU64::new(0),
            counters: Counters::default(),
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                epoch: 0,
                session: None,
                registry: SubscriptionRegistry::new(),
                backoff: Backoff::new(config.reconnect.clone()),
                config,
                lost: false,
                early_close: None,
                attempt: None,
                timer: None,
                liveness: None,
            }),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    // ----- lifecycle -----

    pub(crate) fn start(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        if shared.state.is_active() {
            debug!(state = %shared.state, "start() ignored, attempt sequence already active");
            return;
        }

        let epoch = self.bump_epoch(&mut shared);
        shared.backoff.reset();
        shared.lost = false;
        self.set_state(&mut shared, ConnectionState::Connecting);
        self.spawn_attempt(&mut shared, epoch);
    }

    pub(crate) fn stop(&self) {
        let mut shared = self.shared.lock();
        self.bump_epoch(&mut shared);
        if let Some(task) = shared.attempt.take() {
            task.abort();
        }
        if let Some(task) = shared.timer.take() {
            task.abort();
        }
        self.teardown_session(&mut shared);
        shared.registry.discard_transient();
        shared.backoff.reset();
        shared.lost = false;
        if shared.state != ConnectionState::Disconnected {
            self.set_state(&mut shared, ConnectionState::Disconnected);
        }
    }

    /// Point at a different broker. An active attempt sequence is superseded:
    /// the in-flight attempt is left to notice its stale epoch and clean up,
    /// and a fresh attempt starts against the new address.
    pub(crate) fn set_broker_settings(self: &Arc<Self>, address: String, port: u16) {
        let mut shared = self.shared.lock();
        info!(address = %address, port, "Broker settings changed");
        shared.config.broker_address = address;
        shared.config.port = port;

        if !shared.state.is_active() {
            return;
        }

        let epoch = self.bump_epoch(&mut shared);
        if let Some(task) = shared.timer.take() {
            task.abort();
        }
        // Detached, not aborted: a superseded handshake finishes and discards itself
        shared.attempt = None;
        self.teardown_session(&mut shared);
        shared.registry.discard_transient();
        shared.backoff.reset();
        shared.lost = false;
        self.set_state(&mut shared, ConnectionState::Connecting);
        self.spawn_attempt(&mut shared, epoch);
    }

    // ----- attempts -----

    fn spawn_attempt(self: &Arc<Self>, shared: &mut Shared, epoch: u64) {
        let inner = Arc::clone(self);
        shared.attempt = Some(self.runtime.spawn(inner.run_attempt(epoch)));
    }

    async fn run_attempt(self: Arc<Self>, epoch: u64) {
        let (request, probe_timeout, handshake_timeout) = {
            let shared = self.shared.lock();
            if shared.epoch != epoch {
                return;
            }
            let config = &shared.config;
            let request = ConnectRequest {
                host: config.broker_address.clone(),
                port: config.port,
                client_id: format!("{}{}", config.client_id_prefix, uuid::Uuid::new_v4().simple()),
                credentials: config.credentials.clone(),
                keep_alive: config.keep_alive_interval(),
                clean_session: config.clean_session,
            };
            (request, config.timeouts.probe(), config.timeouts.handshake())
        };

        let attempt = self.counters.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            epoch,
            attempt,
            host = %request.host,
            port = request.port,
            client_id = %request.client_id,
            "Connecting"
        );

        if let Err(err) = self
            .probe
            .probe(&request.host, request.port, probe_timeout)
            .await
        {
            // Probes outside this crate may report anything; it is still a connect failure
            let err = if err.is_connect_failure() {
                err
            } else {
                ConnectionError::ProbeUnreachable(err.to_string())
            };
            self.attempt_failed(epoch, err);
            return;
        }

        let sink = EpochSink::new(&self, epoch);
        let outcome =
            tokio::time::timeout(handshake_timeout, self.connector.connect(request, sink)).await;

        match outcome {
            Ok(Ok(session)) => self.install(epoch, session),
            Ok(Err(err)) => self.attempt_failed(epoch, err.into()),
            Err(_) => self.attempt_failed(epoch, ConnectionError::HandshakeTimeout(handshake_timeout)),
        }
    }

    fn install(self: &Arc<Self>, epoch: u64, session: Arc<dyn ProtocolSession>) {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch || shared.state.is_connected() {
            drop(shared);
            debug!(
                epoch,
                client_id = session.client_id(),
                "Attempt superseded, discarding its session"
            );
            self.close_in_background(session);
            return;
        }
        if let Some(closed) = shared.early_close.take() {
            drop(shared);
            debug!(epoch, error = %closed, "Transport closed during handshake");
            self.close_in_background(session);
            let reason = match closed {
                ConnectionError::TransportClosed(reason) => reason,
                other => other.to_string(),
            };
            self.attempt_failed(
                epoch,
                ConnectionError::HandshakeFailed(format!(
                    "transport closed during handshake: {reason}"
                )),
            );
            return;
        }

        // Snapshot-and-clear happens under the same lock that makes the session visible
        let batch = shared.registry.take_resubscribe_batch();
        let first = (!batch.is_empty())
            .then(|| Command::Resubscribe(batch, shared.config.default_qos));
        let handle = SessionHandle::open(self, epoch, Arc::clone(&session), first);
        let client_id = handle.client_id.clone();
        shared.session = Some(handle);

        shared.attempt = None;
        shared.backoff.reset();
        shared.lost = false;
        self.set_state(&mut shared, ConnectionState::Connected);
        self.spawn_liveness(&mut shared, epoch, session);

        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        info!(epoch, client_id = %client_id, "Connected");
        self.queue.notify(Notification::Connected { client_id });
    }

    fn attempt_failed(self: &Arc<Self>, epoch: u64, err: ConnectionError) {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch {
            debug!(epoch, error = %err, "Superseded attempt failed");
            return;
        }
        shared.attempt = None;

        debug_assert!(err.is_connect_failure(), "not a connect failure: {err}");
        warn!(epoch, error = %err, "Connect attempt failed");
        self.queue.notify(Notification::ConnectionFailed { error: err.clone() });

        match shared.backoff.on_failure() {
            BackoffDecision::Retry { delay, attempt } => {
                self.set_state(
                    &mut shared,
                    ConnectionState::Failed {
                        reason: err.to_string(),
                    },
                );
                debug!(
                    epoch,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.schedule_retry(&mut shared, delay);
            }
            BackoffDecision::Exhausted { attempts } => {
                self.bump_epoch(&mut shared);
                self.set_state(&mut shared, ConnectionState::Disconnected);
                error!(attempts, "Reconnect attempts exhausted, giving up until start()");
                self.queue
                    .notify(Notification::ReconnectExhausted { attempts });
            }
        }
    }

    /// The installed session died. Only the session of the current epoch can
    /// report this, and only once. A report that beats `install` is kept for
    /// it, so the attempt fails instead of installing a dead session.
    pub(crate) fn connection_lost(self: &Arc<Self>, epoch: u64, err: ConnectionError) {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch {
            return;
        }
        if !shared.state.is_connected() {
            if shared.early_close.is_none() {
                shared.early_close = Some(err);
            }
            return;
        }

        debug_assert!(err.is_connection_loss(), "not a connection loss: {err}");
        warn!(epoch, error = %err, "Connection lost");
        self.bump_epoch(&mut shared);
        self.teardown_session(&mut shared);
        let dropped = shared.registry.discard_transient();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropped transient subscriptions");
        }

        shared.lost = true;
        self.set_state(&mut shared, ConnectionState::Reconnecting);
        self.counters.losses.fetch_add(1, Ordering::Relaxed);
        self.queue.notify(Notification::ConnectionLost { error: err });

        let delay = shared.backoff.on_loss();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect after loss");
        self.schedule_retry(&mut shared, delay);
    }

    fn schedule_retry(self: &Arc<Self>, shared: &mut Shared, delay: Duration) {
        let epoch = shared.epoch;
        let inner = Arc::clone(self);
        shared.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry(epoch);
        }));
    }

    fn retry(self: &Arc<Self>, epoch: u64) {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch {
            return;
        }
        shared.timer = None;

        // A fresh epoch per attempt keeps a dead session's late reports inert
        let epoch = self.bump_epoch(&mut shared);
        let next = if shared.lost {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.set_state(&mut shared, next);
        self.spawn_attempt(&mut shared, epoch);
    }

    // ----- session slot -----

    fn spawn_liveness(
        self: &Arc<Self>,
        shared: &mut Shared,
        epoch: u64,
        session: Arc<dyn ProtocolSession>,
    ) {
        let monitor = LivenessMonitor::new(
            shared.config.keep_alive_interval(),
            shared.config.timeouts.keep_alive(),
        );
        let current = Arc::downgrade(self);
        let report = Arc::downgrade(self);
        shared.liveness = Some(self.runtime.spawn(monitor.run(
            session,
            move || current.upgrade().is_some_and(|inner| inner.is_current(epoch)),
            move |err| {
                if let Some(inner) = report.upgrade() {
                    inner.connection_lost(epoch, err);
                }
            },
        )));
    }

    fn is_current(&self, epoch: u64) -> bool {
        let shared = self.shared.lock();
        shared.epoch == epoch && shared.state.is_connected()
    }

    fn teardown_session(&self, shared: &mut Shared) {
        if let Some(task) = shared.liveness.take() {
            task.abort();
        }
        if let Some(handle) = shared.session.take() {
            debug!(client_id = %handle.client_id, "Tearing down session");
            self.close_in_background(handle.shutdown());
        }
    }

    fn close_in_background(&self, session: Arc<dyn ProtocolSession>) {
        self.runtime.spawn(async move {
            if let Err(e) = session.close().await {
                debug!(client_id = session.client_id(), error = %e, "Session close failed");
            }
        });
    }

    /// Once this returns, no sink of an older epoch can add to the queue.
    fn bump_epoch(&self, shared: &mut Shared) -> u64 {
        shared.epoch += 1;
        shared.early_close = None;
        self.current_epoch.store(shared.epoch, Ordering::Release);
        self.queue.fence();
        shared.epoch
    }

    fn set_state(&self, shared: &mut Shared, next: ConnectionState) {
        info!(from = %shared.state, to = %next, epoch = shared.epoch, "State transition");
        shared.state = next;
    }

    // ----- subscriptions and publish -----

    pub(crate) fn subscribe(&self, topic: String, handler: MessageHandler, durable: bool) {
        let mut shared = self.shared.lock();
        let connected = shared.state.is_connected() && shared.session.is_some();
        let qos = shared.config.default_qos;

        match shared.registry.upsert(&topic, handler, durable, connected) {
            SubscribeAction::Send => {
                if let Some(handle) = &shared.session {
                    handle.send(Command::Subscribe(topic, qos));
                }
            }
            SubscribeAction::Replaced => debug!(topic = %topic, "Handler replaced"),
            SubscribeAction::Deferred => debug!(topic = %topic, "Subscription pending until connected"),
        }
    }

    pub(crate) fn unsubscribe(&self, topic: &str) {
        let mut shared = self.shared.lock();
        let connected = shared.state.is_connected() && shared.session.is_some();
        if shared.registry.remove(topic, connected)
            && let Some(handle) = &shared.session
        {
            handle.send(Command::Unsubscribe(topic.to_string()));
        }
    }

    pub(crate) fn publish(&self, topic: String, payload: Bytes, qos: Option<QoS>, retain: bool) {
        let shared = self.shared.lock();
        let qos = qos.unwrap_or(shared.config.default_qos);

        let sent = match (&shared.session, shared.state.is_connected()) {
            (Some(handle), true) => handle.send(Command::Publish {
                topic: topic.clone(),
                payload,
                qos,
                retain,
            }),
            _ => false,
        };

        if !sent {
            self.counters.publishes_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %topic, state = %shared.state, "Not connected, publish dropped");
        }
    }

    /// Resolves once every command queued before this call has run.
    pub(crate) fn flush_request(&self) -> Option<oneshot::Receiver<()>> {
        let shared = self.shared.lock();
        let handle = shared.session.as_ref()?;
        let (tx, rx) = oneshot::channel();
        handle.send(Command::Flush(tx)).then_some(rx)
    }

    // ----- observers and dispatch -----

    pub(crate) fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub(crate) fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn record_drain(&self, report: &DrainReport) {
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(report.unmatched as u64, Ordering::Relaxed);
        self.counters
            .handler_faults
            .fetch_add(report.handler_faults as u64, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ManagerStats {
        let c = &self.counters;
        ManagerStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            losses: c.losses.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            handler_faults: c.handler_faults.load(Ordering::Relaxed),
            publishes_dropped: c.publishes_dropped.load(Ordering::Relaxed),
        }
    }
}
