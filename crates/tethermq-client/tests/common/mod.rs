//! Scripted fakes shared by the manager integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use tethermq_client::{ConnectionManager, HandlerError};
use tethermq_core::{
    ClientConfig, ConnectError, ConnectRequest, ConnectionError, ConnectionObserver,
    InboundMessage, Probe, ProtocolSession, QoS, RefusalCode, ReconnectPolicy, SessionError,
    SessionConnector, SessionResult, SessionSink,
};

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeProbe {
    reachable: AtomicBool,
    calls: Mutex<Vec<Instant>>,
}

impl FakeProbe {
    pub fn reachable() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        let probe = Self::reachable();
        probe.set_reachable(false);
        probe
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Seconds between consecutive probes
    pub fn gaps(&self) -> Vec<f64> {
        self.calls
            .lock()
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs_f64())
            .collect()
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, host: &str, port: u16, _timeout: Duration) -> Result<(), ConnectionError> {
        self.calls.lock().push(Instant::now());
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::ProbeUnreachable(format!(
                "No route to {host}:{port}"
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// How the next handshake behaves
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    AcceptAfter(Duration),
    Refuse(RefusalCode),
    Fail(String),
    /// The transport dies after the handshake, before `connect` returns
    AcceptThenClose(String),
    Hang,
}

#[derive(Debug, Default)]
pub struct FakeConnector {
    script: Mutex<VecDeque<Handshake>>,
    requests: Mutex<Vec<ConnectRequest>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(script: impl IntoIterator<Item = Handshake>) -> Arc<Self> {
        let connector = Self::new();
        connector.script.lock().extend(script);
        connector
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn session(&self, n: usize) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock()[n])
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        let sessions = self.sessions.lock();
        Arc::clone(sessions.last().expect("no session opened"))
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        sink: SessionSink,
    ) -> Result<Arc<dyn ProtocolSession>, ConnectError> {
        self.requests.lock().push(request.clone());
        let step = self.script.lock().pop_front().unwrap_or(Handshake::Accept);

        let mut close_with = None;
        match step {
            Handshake::Accept => {}
            Handshake::AcceptThenClose(reason) => close_with = Some(reason),
            Handshake::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            Handshake::Refuse(code) => return Err(ConnectError::Refused(code)),
            Handshake::Fail(reason) => return Err(ConnectError::Io(reason)),
            Handshake::Hang => std::future::pending::<()>().await,
        }

        let session = Arc::new(FakeSession::new(request.client_id, sink));
        self.sessions.lock().push(Arc::clone(&session));
        if let Some(reason) = close_with {
            session.drop_transport(&reason);
        }
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeSession {
    client_id: String,
    sink: SessionSink,
    pub subscribes: Mutex<Vec<Vec<String>>>,
    pub unsubscribes: Mutex<Vec<String>>,
    pub publishes: Mutex<Vec<(String, Bytes)>>,
    pub keep_alives: AtomicUsize,
    keep_alive_ok: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    fn new(client_id: String, sink: SessionSink) -> Self {
        Self {
            client_id,
            sink,
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            keep_alives: AtomicUsize::new(0),
            keep_alive_ok: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.client_id
    }

    /// Simulate the broker publishing to this session
    pub fn deliver(&self, topic: &str, payload: &'static str) {
        self.sink.message(topic.to_string(), Bytes::from_static(payload.as_bytes()));
    }

    /// Simulate the transport dying under the session
    pub fn drop_transport(&self, reason: &str) {
        self.sink.closed(reason.to_string());
    }

    pub fn fail_keep_alive(&self) {
        self.keep_alive_ok.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every topic sent in a subscribe request, flattened
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribes.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ProtocolSession for FakeSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, topics: &[String], _qos: QoS) -> SessionResult<()> {
        self.subscribes.lock().push(topics.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        self.unsubscribes.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> SessionResult<()> {
        self.publishes.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn keep_alive(&self) -> SessionResult<()> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        if self.keep_alive_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Io("connection reset by peer".into()))
        }
    }

    async fn close(&self) -> SessionResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl ConnectionObserver for Recorder {
    fn on_connected(&self) {
        self.events.lock().push("connected".into());
    }

    fn on_connection_failed(&self, reason: &str) {
        self.events.lock().push(format!("failed:{reason}"));
    }

    fn on_connection_lost(&self, reason: &str) {
        self.events.lock().push(format!("lost:{reason}"));
    }

    fn on_reconnect_exhausted(&self, attempts: u32) {
        self.events.lock().push(format!("exhausted:{attempts}"));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Manual-start config with a bounded 1s/60s/x1.5 policy
pub fn config() -> ClientConfig {
    ClientConfig::builder()
        .broker("broker.test", 1883)
        .auto_connect(false)
        .reconnect(ReconnectPolicy::new(1.0, 60.0, 1.5, 5))
        .build()
        .unwrap()
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub connector: Arc<FakeConnector>,
    pub probe: Arc<FakeProbe>,
    pub recorder: Arc<Recorder>,
}

/// Log to the test writer; `RUST_LOG=tethermq_client=debug` to see it
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn harness(config: ClientConfig, connector: Arc<FakeConnector>, probe: Arc<FakeProbe>) -> Harness {
    init_tracing();
    let recorder = Recorder::new();
    let manager = ConnectionManager::builder(config)
        .with_connector(connector.clone())
        .with_probe(probe.clone())
        .with_observer(recorder.clone())
        .build()
        .unwrap();

    Harness {
        manager,
        connector,
        probe,
        recorder,
    }
}

/// Let spawned tasks run without moving the clock meaningfully
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

pub fn counting_handler(
    counter: &Arc<AtomicUsize>,
) -> impl Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_msg: &InboundMessage| -> Result<(), HandlerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn recording_handler(
    seen: &Arc<Mutex<Vec<String>>>,
) -> impl Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |msg: &InboundMessage| -> Result<(), HandlerError> {
        seen.lock()
            .push(msg.payload_str().unwrap_or_default().to_string());
        Ok(())
    }
}

/// Connect a manual-start harness and wait until it is connected
pub async fn connected(config: ClientConfig) -> Harness {
    let h = harness(config, FakeConnector::new(), FakeProbe::reachable());
    h.manager.start();
    settle().await;
    assert!(h.manager.is_connected(), "state: {}", h.manager.state());
    h
}
