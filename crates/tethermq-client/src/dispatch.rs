//! Inbound dispatch queue
//!
//! Background tasks (session readers, the connection controller) push
//! messages and notifications here; the owner context pulls them out with
//! [`deliver`] on its own cadence. Producers never run consumer code.
//!
//! ```text
//!  session reader ──┐
//!  controller ──────┼──▶ DispatchQueue (FIFO, one lock) ──▶ drain() on owner
//!  liveness ────────┘                                        ├─ observers
//!                                                            └─ handlers
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use tethermq_core::{ConnectionError, ConnectionObserver, InboundMessage, Notification};

use crate::registry::MessageHandler;

/// One queued item
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A message from the broker
    Message(InboundMessage),
    /// A connection notification
    Notification(Notification),
}

/// What one drain did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages handed to a handler that returned normally
    pub delivered: usize,
    /// Messages with no matching handler, dropped
    pub unmatched: usize,
    /// Handlers that returned an error or panicked
    pub handler_faults: usize,
    /// Notifications handed to observers
    pub notifications: usize,
}

impl DrainReport {
    /// Total items taken off the queue
    pub const fn total(&self) -> usize {
        self.delivered + self.unmatched + self.handler_faults + self.notifications
    }
}

/// FIFO hand-off from background producers to the owner context
pub struct DispatchQueue {
    items: Mutex<VecDeque<Dispatch>>,
    next_sequence: AtomicU64,
    ready: Notify,
    warn_threshold: usize,
    over_threshold: AtomicBool,
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("len", &self.len())
            .field("warn_threshold", &self.warn_threshold)
            .finish()
    }
}

impl DispatchQueue {
    /// Create a queue that warns once its length passes `warn_threshold`
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(0),
            ready: Notify::new(),
            warn_threshold,
            over_threshold: AtomicBool::new(false),
        }
    }

    /// Queue an inbound message and return its arrival sequence.
    pub fn enqueue(&self, topic: String, payload: Bytes) -> u64 {
        let mut items = self.items.lock();
        self.push_message(&mut items, topic, payload)
    }

    /// Queue an inbound message only if `accept` holds while the queue is
    /// locked. Pair with [`fence`](Self::fence) to retire a producer.
    pub fn enqueue_if(
        &self,
        topic: String,
        payload: Bytes,
        accept: impl FnOnce() -> bool,
    ) -> Option<u64> {
        let mut items = self.items.lock();
        if !accept() {
            return None;
        }
        Some(self.push_message(&mut items, topic, payload))
    }

    /// Wait out any `enqueue_if` that is mid-push. Checks made after this
    /// returns see whatever state the caller changed before calling it.
    pub fn fence(&self) {
        drop(self.items.lock());
    }

    fn push_message(&self, items: &mut VecDeque<Dispatch>, topic: String, payload: Bytes) -> u64 {
        // Assigned under the lock so sequence order equals queue order
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        trace!(topic = %topic, sequence, "Queued inbound message");
        items.push_back(Dispatch::Message(InboundMessage {
            topic,
            payload,
            sequence,
        }));
        self.after_push(items.len());
        sequence
    }

    /// Queue a connection notification.
    pub fn notify(&self, notification: Notification) {
        let mut items = self.items.lock();
        debug!(kind = notification.kind(), "Queued notification");
        items.push_back(Dispatch::Notification(notification));
        self.after_push(items.len());
    }

    /// Take everything queued so far, in arrival order.
    pub fn take_all(&self) -> VecDeque<Dispatch> {
        let taken = std::mem::take(&mut *self.items.lock());
        self.over_threshold.store(false, Ordering::Relaxed);
        taken
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Resolve once the queue is non-empty.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn after_push(&self, len: usize) {
        self.ready.notify_one();
        if len > self.warn_threshold && !self.over_threshold.swap(true, Ordering::Relaxed) {
            warn!(
                len,
                threshold = self.warn_threshold,
                "Dispatch queue is growing; drain it every cycle"
            );
        }
    }
}

/// Deliver a batch taken from the queue.
///
/// Notifications go to every observer. Messages go to every observer's
/// `on_message_received`, then to the handler `resolve` returns for their
/// topic. A failing or panicking handler is reported and the batch carries on.
pub fn deliver<R>(
    batch: VecDeque<Dispatch>,
    observers: &[Arc<dyn ConnectionObserver>],
    resolve: R,
) -> DrainReport
where
    R: Fn(&str) -> Option<MessageHandler>,
{
    let mut report = DrainReport::default();

    for item in batch {
        match item {
            Dispatch::Notification(notification) => {
                for observer in observers {
                    guard_observer(notification.kind(), || observer.notify(&notification));
                }
                report.notifications += 1;
            }
            Dispatch::Message(message) => {
                for observer in observers {
                    guard_observer("message_received", || {
                        observer.on_message_received(&message.topic, &message.payload);
                    });
                }

                // Looked up per message: a topic unsubscribed after arrival is dropped
                let Some(handler) = resolve(&message.topic) else {
                    trace!(topic = %message.topic, "No handler for topic, dropping");
                    report.unmatched += 1;
                    continue;
                };

                match run_handler(&handler, &message) {
                    Ok(()) => report.delivered += 1,
                    Err(fault) => {
                        error!(
                            topic = %message.topic,
                            sequence = message.sequence,
                            error = %fault,
                            "Handler fault"
                        );
                        report.handler_faults += 1;
                    }
                }
            }
        }
    }

    report
}

fn run_handler(handler: &MessageHandler, message: &InboundMessage) -> Result<(), ConnectionError> {
    let fault = |reason: String| ConnectionError::HandlerFault {
        topic: message.topic.clone(),
        message: reason,
    };

    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(fault(err.to_string())),
        Err(panic) => Err(fault(panic_message(panic.as_ref()))),
    }
}

fn guard_observer(callback: &str, call: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        warn!(
            callback,
            panic = %panic_message(panic.as_ref()),
            "Observer panicked"
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;

    fn recording_handler(seen: &Arc<Mutex<Vec<String>>>) -> MessageHandler {
        let seen = Arc::clone(seen);
        Arc::new(move |msg: &InboundMessage| -> Result<(), HandlerError> {
            seen.lock()
                .push(msg.payload_str().unwrap_or_default().to_string());
            Ok(())
        })
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = DispatchQueue::new(100);
        for n in 1..=3 {
            queue.enqueue("t".into(), Bytes::from(n.to_string()));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = recording_handler(&seen);
        let report = deliver(queue.take_all(), &[], |_| Some(Arc::clone(&handler)));

        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequences_follow_queue_order_across_threads() {
        let queue = Arc::new(DispatchQueue::new(10_000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.enqueue(format!("p{p}"), Bytes::from(i.to_string()));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let batch = queue.take_all();
        assert_eq!(batch.len(), 1000);

        let sequences: Vec<u64> = batch
            .iter()
            .map(|item| match item {
                Dispatch::Message(m) => m.sequence,
                Dispatch::Notification(_) => panic!("unexpected notification"),
            })
            .collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        // Per-producer order survives the hand-off
        for p in 0..4 {
            let payloads: Vec<u32> = batch
                .iter()
                .filter_map(|item| match item {
                    Dispatch::Message(m) if m.topic == format!("p{p}") => {
                        m.payload_str().and_then(|s| s.parse().ok())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(payloads, (0..250).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_handler_fault_does_not_stop_drain() {
        let queue = DispatchQueue::new(100);
        queue.enqueue("bad".into(), Bytes::from_static(b"x"));
        queue.enqueue("panics".into(), Bytes::from_static(b"y"));
        queue.enqueue("good".into(), Bytes::from_static(b"z"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let good = recording_handler(&seen);
        let bad: MessageHandler = Arc::new(|_msg: &InboundMessage| -> Result<(), HandlerError> {
            Err(HandlerError::from("cannot parse"))
        });
        let panics: MessageHandler =
            Arc::new(|_msg: &InboundMessage| -> Result<(), HandlerError> { panic!("boom") });

        let report = deliver(queue.take_all(), &[], |topic| match topic {
            "bad" => Some(Arc::clone(&bad)),
            "panics" => Some(Arc::clone(&panics)),
            "good" => Some(Arc::clone(&good)),
            _ => None,
        });

        assert_eq!(report.handler_faults, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(*seen.lock(), vec!["z"]);
    }

    #[test]
    fn test_enqueue_if_checks_under_lock() {
        let queue = DispatchQueue::new(100);
        assert_eq!(queue.enqueue_if("t".into(), Bytes::new(), || true), Some(0));
        assert_eq!(queue.enqueue_if("t".into(), Bytes::new(), || false), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fence_retires_producer() {
        let queue = Arc::new(DispatchQueue::new(10_000));
        let live = Arc::new(AtomicBool::new(true));
        let producer = {
            let queue = Arc::clone(&queue);
            let live = Arc::clone(&live);
            std::thread::spawn(move || {
                let mut pushed = 0;
                while queue
                    .enqueue_if("t".into(), Bytes::new(), || live.load(Ordering::Acquire))
                    .is_some()
                {
                    pushed += 1;
                }
                pushed
            })
        };

        while queue.is_empty() {
            std::thread::yield_now();
        }
        live.store(false, Ordering::Release);
        queue.fence();
        let fenced = queue.len();

        let pushed = producer.join().unwrap();
        assert_eq!(queue.len(), fenced);
        assert_eq!(pushed, fenced);
    }

    #[test]
    fn test_unmatched_messages_dropped() {
        let queue = DispatchQueue::new(100);
        queue.enqueue("gone".into(), Bytes::from_static(b"x"));

        let report = deliver(queue.take_all(), &[], |_| None);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.total(), 1);
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connected(&self) {
            self.events.lock().push("connected".into());
        }

        fn on_message_received(&self, topic: &str, _payload: &Bytes) {
            self.events.lock().push(format!("message:{topic}"));
        }
    }

    #[test]
    fn test_notifications_and_messages_interleave_in_order() {
        let queue = DispatchQueue::new(100);
        queue.enqueue("before".into(), Bytes::new());
        queue.notify(Notification::Connected {
            client_id: "c".into(),
        });
        queue.enqueue("after".into(), Bytes::new());

        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn ConnectionObserver> = recorder.clone();
        let report = deliver(queue.take_all(), &[observer], |_| None);

        assert_eq!(report.notifications, 1);
        assert_eq!(
            *recorder.events.lock(),
            vec!["message:before", "connected", "message:after"]
        );
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_enqueue() {
        let queue = Arc::new(DispatchQueue::new(100));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_ready().await })
        };

        tokio::task::yield_now().await;
        queue.enqueue("t".into(), Bytes::new());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
