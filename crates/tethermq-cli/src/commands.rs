//! Subcommand implementations
//!
//! Each command owns a [`ConnectionManager`] and runs the owner loop on the
//! current task: tick, drain, inspect state. Handlers and observers therefore
//! run here, never on the manager's background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use tethermq_client::{ConnectionManager, HandlerError, TcpProbe};
use tethermq_core::{ClientConfig, ConnectionError, ConnectionObserver, InboundMessage, Probe};

use crate::cli::{ListenArgs, PublishArgs};
use crate::error::{CliError, CliResult};

/// Owner loop period while waiting for a connection
const CONNECT_FRAME: Duration = Duration::from_millis(20);

/// Logs connection events and remembers how the last attempt ended
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    last_failure: Mutex<Option<String>>,
    exhausted: Mutex<Option<u32>>,
}

impl ConsoleObserver {
    /// Reason the most recent connect attempt failed
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }

    /// Attempt count once the reconnect cap was hit
    pub fn exhausted(&self) -> Option<u32> {
        *self.exhausted.lock()
    }

    fn exhausted_error(&self, attempts: u32) -> CliError {
        CliError::Exhausted {
            attempts,
            reason: self.last_failure().unwrap_or_else(|| "unknown".into()),
        }
    }
}

impl ConnectionObserver for ConsoleObserver {
    fn on_connected(&self) {
        info!("Connected");
    }

    fn on_connection_failed(&self, reason: &str) {
        warn!(reason, "Connect attempt failed");
        *self.last_failure.lock() = Some(reason.to_string());
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!(reason, "Connection lost, reconnecting");
    }

    fn on_reconnect_exhausted(&self, attempts: u32) {
        error!(attempts, "Giving up on the broker");
        *self.exhausted.lock() = Some(attempts);
    }
}

fn build_manager(config: ClientConfig, status: &Arc<ConsoleObserver>) -> CliResult<ConnectionManager> {
    info!(broker = %config.endpoint(), "Using broker");
    let manager = ConnectionManager::builder(config)
        .with_observer(status.clone())
        .build()?;
    Ok(manager)
}

/// Drive the owner loop until the manager connects, the cap is hit or
/// `limit` elapses.
async fn wait_connected(
    manager: &ConnectionManager,
    status: &ConsoleObserver,
    limit: Duration,
) -> CliResult<()> {
    let deadline = Instant::now() + limit;
    let mut frame = interval(CONNECT_FRAME);
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        frame.tick().await;
        manager.drain();

        if manager.is_connected() {
            return Ok(());
        }
        if let Some(attempts) = status.exhausted() {
            return Err(status.exhausted_error(attempts));
        }
        if Instant::now() >= deadline {
            return Err(CliError::Timeout {
                operation: "connect",
                elapsed: limit,
            });
        }
    }
}

/// Render one delivery for stdout
pub fn format_delivery(msg: &InboundMessage, as_json: bool) -> Result<String, serde_json::Error> {
    let text = String::from_utf8_lossy(&msg.payload);
    if as_json {
        serde_json::to_string(&json!({
            "sequence": msg.sequence,
            "topic": msg.topic,
            "size": msg.size(),
            "payload": text,
        }))
    } else {
        Ok(format!("{} {}", msg.topic, text))
    }
}

/// `tethermq listen`
pub async fn listen(config: ClientConfig, args: ListenArgs) -> CliResult<()> {
    let status = Arc::new(ConsoleObserver::default());
    let manager = build_manager(config, &status)?;
    let received = Arc::new(AtomicUsize::new(0));

    for topic in &args.topics {
        let received = Arc::clone(&received);
        let limit = args.count;
        let as_json = args.json;
        manager.subscribe(topic.as_str(), move |msg: &InboundMessage| -> Result<(), HandlerError> {
            let seen = received.fetch_add(1, Ordering::Relaxed);
            if limit.is_some_and(|limit| seen >= limit) {
                return Ok(());
            }
            let line = format_delivery(msg, as_json)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            println!("{line}");
            Ok(())
        });
    }
    manager.start();

    let mut frame = interval(args.frame());
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Interrupted");
                break Ok(());
            }
            _ = frame.tick() => {
                manager.drain();
                if args.count.is_some_and(|limit| received.load(Ordering::Relaxed) >= limit) {
                    break Ok(());
                }
                if let Some(attempts) = status.exhausted() {
                    break Err(status.exhausted_error(attempts));
                }
            }
        }
    };

    manager.stop();
    debug!(stats = ?manager.stats(), "Listener finished");
    outcome
}

/// `tethermq publish`
pub async fn publish(config: ClientConfig, args: PublishArgs) -> CliResult<()> {
    let wait = args.wait()?;
    let qos = args.qos.map_or(config.default_qos, Into::into);
    let status = Arc::new(ConsoleObserver::default());
    let manager = build_manager(config, &status)?;

    manager.start();
    let outcome = send_one(&manager, &status, &args, qos, wait).await;
    manager.stop();
    manager.drain();
    outcome
}

async fn send_one(
    manager: &ConnectionManager,
    status: &ConsoleObserver,
    args: &PublishArgs,
    qos: tethermq_core::QoS,
    wait: Duration,
) -> CliResult<()> {
    wait_connected(manager, status, wait).await?;

    manager.publish_with(args.topic.as_str(), args.message.clone(), qos, args.retain);
    if !manager.flush().await {
        return Err(ConnectionError::TransportClosed(
            "session closed before the message was sent".into(),
        )
        .into());
    }

    info!(topic = %args.topic, bytes = args.message.len(), "Published");
    Ok(())
}

/// `tethermq probe`
pub async fn probe(config: &ClientConfig) -> CliResult<()> {
    let started = Instant::now();
    TcpProbe::new()
        .probe(&config.broker_address, config.port, config.timeouts.probe())
        .await?;
    println!(
        "{} is reachable ({} ms)",
        config.endpoint(),
        started.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_delivery_plain() {
        let msg = InboundMessage::new("home/temp", "21.5", 7);
        assert_eq!(format_delivery(&msg, false).unwrap(), "home/temp 21.5");
    }

    #[test]
    fn test_format_delivery_json() {
        let msg = InboundMessage::new("home/temp", "21.5", 7);
        let line = format_delivery(&msg, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["topic"], "home/temp");
        assert_eq!(value["payload"], "21.5");
    }

    #[test]
    fn test_console_observer_records_outcome() {
        let status = ConsoleObserver::default();
        status.on_connection_failed("Connection refused: not authorized");
        status.on_reconnect_exhausted(5);

        assert_eq!(status.exhausted(), Some(5));
        let err = status.exhausted_error(5);
        assert_eq!(
            err.to_string(),
            "Gave up after 5 attempts: Connection refused: not authorized"
        );
    }

    #[tokio::test]
    async fn test_probe_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            broker_address: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            ..ClientConfig::default()
        };
        probe(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_closed_port_fails() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            broker_address: "127.0.0.1".into(),
            port,
            ..ClientConfig::default()
        };
        let err = probe(&config).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::Connection(ConnectionError::ProbeUnreachable(_))
        ));
    }
}
