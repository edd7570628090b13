//! MQTT 3.1.1 session backed by `rumqttc`
//!
//! [`MqttConnector`] drives a fresh `rumqttc` event loop until the broker's
//! CONNACK, then hands the loop to a reader task that forwards PUBLISH
//! packets to the session sink. `rumqttc`'s own reconnect is never used: the
//! reader exits on the first transport error and reports it, and the
//! connection manager decides what happens next.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, SubscribeFilter,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use tethermq_core::{
    ConnectError, ConnectRequest, ProtocolSession, QoS, RefusalCode, SessionConnector,
    SessionError, SessionResult, SessionSink,
};

/// Capacity of the request channel between `AsyncClient` and its event loop
const REQUEST_CAPACITY: usize = 64;

/// Slack on top of two keep-alive periods before a silent broker counts as dead
const SILENCE_GRACE: Duration = Duration::from_secs(5);

/// Opens MQTT sessions over plain TCP
#[derive(Debug, Clone)]
pub struct MqttConnector {
    request_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttConnector {
    /// Create a connector with the default request capacity
    pub fn new() -> Self {
        Self {
            request_capacity: REQUEST_CAPACITY,
        }
    }

    /// Capacity of the queue between callers and the network task
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    fn options(request: &ConnectRequest) -> MqttOptions {
        let mut options = MqttOptions::new(&request.client_id, &request.host, request.port);
        options.set_keep_alive(protocol_keep_alive(request.keep_alive));
        options.set_clean_session(request.clean_session);
        if let Some(credentials) = &request.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        options
    }
}

#[async_trait]
impl SessionConnector for MqttConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
        sink: SessionSink,
    ) -> Result<Arc<dyn ProtocolSession>, ConnectError> {
        let (client, mut eventloop) =
            AsyncClient::new(Self::options(&request), self.request_capacity);

        wait_for_connack(&mut eventloop).await?;
        debug!(client_id = %request.client_id, "CONNACK accepted");

        let state = Arc::new(LinkState {
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        let reader = tokio::spawn(read_loop(eventloop, sink, Arc::clone(&state)));

        Ok(Arc::new(MqttSession {
            client,
            client_id: request.client_id,
            keep_alive: protocol_keep_alive(request.keep_alive),
            state,
            reader,
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ConnectError::Refused(refusal_code(code))),
                };
            }
            Ok(event) => trace!(?event, "Event before CONNACK"),
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(refusal_code(code)));
            }
            Err(e) => return Err(ConnectError::Io(e.to_string())),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    alive: AtomicBool,
    closing: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl LinkState {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

async fn read_loop(mut eventloop: EventLoop, sink: SessionSink, state: Arc<LinkState>) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                state.touch();
                sink.message(publish.topic, publish.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                break "broker sent DISCONNECT".to_string();
            }
            Ok(Event::Incoming(_)) => state.touch(),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break "closed locally".to_string();
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => break e.to_string(),
        }
    };

    state.alive.store(false, Ordering::Release);
    if state.closing.load(Ordering::Acquire) {
        debug!("MQTT reader stopped after local close");
    } else {
        sink.closed(reason);
    }
}

/// One MQTT connection
#[derive(Debug)]
pub struct MqttSession {
    client: AsyncClient,
    client_id: String,
    keep_alive: Duration,
    state: Arc<LinkState>,
    reader: JoinHandle<()>,
}

impl MqttSession {
    fn ensure_alive(&self) -> SessionResult<()> {
        if self.state.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SessionError::Closed("connection is down".into()))
        }
    }
}

#[async_trait]
impl ProtocolSession for MqttSession {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> SessionResult<()> {
        self.ensure_alive()?;
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), to_mqtt_qos(qos)));
        self.client
            .subscribe_many(filters)
            .await
            .map_err(client_error)
    }

    async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        self.ensure_alive()?;
        self.client.unsubscribe(topic).await.map_err(client_error)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<()> {
        self.ensure_alive()?;
        self.client
            .publish_bytes(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(client_error)
    }

    async fn keep_alive(&self) -> SessionResult<()> {
        self.ensure_alive()?;
        // The event loop sends PINGREQ on its own; anything inbound proves the link
        let silent_for = self.state.last_activity.lock().elapsed();
        let limit = self.keep_alive * 2 + SILENCE_GRACE;
        if silent_for > limit {
            return Err(SessionError::Closed(format!(
                "no traffic from broker for {silent_for:?}"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.state.closing.store(true, Ordering::Release);
        if self.state.alive.load(Ordering::Acquire) {
            self.client.disconnect().await.map_err(client_error)?;
        }
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // After close() the reader exits on its own once DISCONNECT is written
        if !self.state.closing.swap(true, Ordering::AcqRel) {
            self.reader.abort();
        }
    }
}

/// `rumqttc` rejects sub-second keep-alives other than zero.
fn protocol_keep_alive(requested: Duration) -> Duration {
    requested.max(Duration::from_secs(1))
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn refusal_code(code: ConnectReturnCode) -> RefusalCode {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => RefusalCode::UnacceptableProtocolVersion,
        ConnectReturnCode::BadClientId => RefusalCode::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => RefusalCode::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => RefusalCode::BadCredentials,
        ConnectReturnCode::NotAuthorized => RefusalCode::NotAuthorized,
        ConnectReturnCode::Success => RefusalCode::Other(0),
    }
}

fn client_error(err: ClientError) -> SessionError {
    SessionError::Closed(err.to_string())
}
