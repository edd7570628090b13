//! Per-session plumbing: the ordered outbound lane and the inbound sink.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use tethermq_core::{ConnectionError, InboundSink, ProtocolSession, QoS, SessionError};

use super::controller::Inner;

const RESUBSCRIBE_TRIES: u32 = 3;
const RESUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Outbound work for the installed session, executed in send order
#[derive(Debug)]
pub(crate) enum Command {
    Resubscribe(Vec<String>, QoS),
    Subscribe(String, QoS),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Flush(oneshot::Sender<()>),
}

/// The single installed session and its writer lane
pub(crate) struct SessionHandle {
    pub(crate) session: Arc<dyn ProtocolSession>,
    pub(crate) client_id: String,
    commands: mpsc::UnboundedSender<Command>,
    writer: JoinHandle<()>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Spawn the writer lane for `session`; `first` is queued before anything else.
    pub(crate) fn open(
        inner: &Arc<Inner>,
        epoch: u64,
        session: Arc<dyn ProtocolSession>,
        first: Option<Command>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        if let Some(command) = first {
            // Receiver is alive; it was just created
            let _ = commands.send(command);
        }

        let writer = inner.runtime().spawn(run_writer(
            Arc::downgrade(inner),
            epoch,
            Arc::clone(&session),
            rx,
        ));

        Self {
            client_id: session.client_id().to_string(),
            session,
            commands,
            writer,
        }
    }

    /// Queue a command. Returns `false` when the lane is already gone.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Stop the lane and hand the session back for closing.
    pub(crate) fn shutdown(self) -> Arc<dyn ProtocolSession> {
        self.writer.abort();
        self.session
    }
}

async fn run_writer(
    inner: Weak<Inner>,
    epoch: u64,
    session: Arc<dyn ProtocolSession>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Resubscribe(topics, qos) => resubscribe(session.as_ref(), &topics, qos).await,
            Command::Subscribe(topic, qos) => {
                trace!(topic = %topic, "Subscribing");
                session.subscribe(std::slice::from_ref(&topic), qos).await
            }
            Command::Unsubscribe(topic) => {
                trace!(topic = %topic, "Unsubscribing");
                session.unsubscribe(&topic).await
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                trace!(topic = %topic, bytes = payload.len(), "Publishing");
                session.publish(&topic, payload, qos, retain).await
            }
            Command::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                if let Some(inner) = inner.upgrade() {
                    inner.connection_lost(epoch, ConnectionError::TransportClosed(e.to_string()));
                }
                return;
            }
            warn!(client_id = session.client_id(), error = %e, "Session command failed");
        }
    }
    debug!(client_id = session.client_id(), "Writer lane closed");
}

/// Resend every known topic after a (re)connect.
///
/// Retries only ever resend the same batch, so a broker that saw a failed
/// try still ends up with one subscription per topic. A fatal error or the
/// last failed try is reported as fatal so the session is treated as lost.
async fn resubscribe(
    session: &dyn ProtocolSession,
    topics: &[String],
    qos: QoS,
) -> Result<(), SessionError> {
    let mut tries = 0;
    loop {
        tries += 1;
        match session.subscribe(topics, qos).await {
            Ok(()) => {
                debug!(count = topics.len(), tries, "Resubscribed");
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if tries >= RESUBSCRIBE_TRIES => {
                return Err(SessionError::Closed(format!(
                    "resubscribe failed after {tries} tries: {e}"
                )));
            }
            Err(e) => {
                warn!(tries, error = %e, "Resubscribe failed, retrying");
                tokio::time::sleep(RESUBSCRIBE_RETRY_DELAY).await;
            }
        }
    }
}

/// Inbound sink bound to the attempt that created the session.
///
/// Traffic from a session whose attempt is no longer current is dropped.
pub(crate) struct EpochSink {
    inner: Weak<Inner>,
    epoch: u64,
}

impl EpochSink {
    pub(crate) fn new(inner: &Arc<Inner>, epoch: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::downgrade(inner),
            epoch,
        })
    }
}

impl fmt::Debug for EpochSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochSink")
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl InboundSink for EpochSink {
    fn message(&self, topic: String, payload: Bytes) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // Checked under the queue lock; a bump fences the queue before returning
        let accepted = inner
            .queue()
            .enqueue_if(topic, payload, || inner.epoch() == self.epoch);
        if accepted.is_none() {
            trace!(epoch = self.epoch, "Dropped message from stale session");
        }
    }

    fn closed(&self, reason: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connection_lost(self.epoch, ConnectionError::TransportClosed(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tethermq_core::SessionResult;

    #[derive(Debug, Default)]
    struct Scripted {
        failures: Mutex<Vec<SessionError>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ProtocolSession for Scripted {
        fn client_id(&self) -> &str {
            "scripted"
        }
        async fn subscribe(&self, topics: &[String], _qos: QoS) -> SessionResult<()> {
            self.calls.lock().push(topics.to_vec());
            match self.failures.lock().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        async fn unsubscribe(&self, _topic: &str) -> SessionResult<()> {
            Ok(())
        }
        async fn publish(&self, _: &str, _: Bytes, _: QoS, _: bool) -> SessionResult<()> {
            Ok(())
        }
        async fn keep_alive(&self) -> SessionResult<()> {
            Ok(())
        }
        async fn close(&self) -> SessionResult<()> {
            Ok(())
        }
    }

    fn topics() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_retries_transient_errors() {
        let session = Scripted::default();
        session.failures.lock().push(SessionError::Timeout);

        resubscribe(&session, &topics(), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(session.calls.lock().len(), 2);
        assert!(session.calls.lock().iter().all(|batch| *batch == topics()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_gives_up_as_fatal() {
        let session = Scripted::default();
        for _ in 0..RESUBSCRIBE_TRIES {
            session
                .failures
                .lock()
                .push(SessionError::Rejected("quota".into()));
        }

        let err = resubscribe(&session, &topics(), QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.calls.lock().len(), RESUBSCRIBE_TRIES as usize);
    }

    #[tokio::test]
    async fn test_resubscribe_stops_on_fatal_error() {
        let session = Scripted::default();
        session
            .failures
            .lock()
            .push(SessionError::Closed("eof".into()));

        assert!(resubscribe(&session, &topics(), QoS::AtMostOnce).await.is_err());
        assert_eq!(session.calls.lock().len(), 1);
    }
}
