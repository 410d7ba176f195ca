//! Log stream broker: fan-out of one run's output to live observers.
//!
//! Built on a tokio broadcast channel. Each observer that attaches receives
//! only the events emitted after its attachment; this is a live feed, not a
//! durable log, and events produced with no observer attached are dropped.
//! Per-observer buffering is bounded: an observer that falls more than the
//! channel capacity behind loses the oldest events (drop-oldest), so a slow
//! observer never blocks the producer.

use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::LogEvent;

/// Per-observer buffer capacity before drop-oldest kicks in
pub const DEFAULT_CAPACITY: usize = 256;

/// Fan-out hub for one run's live event sequence.
///
/// The broker observes the child process; it never owns its lifetime.
/// After the terminal `status` event is published, `close` drops the sender
/// so attached observers drain what remains and then see end-of-stream.
pub struct LogBroker {
    tx: RwLock<Option<broadcast::Sender<LogEvent>>>,
}

impl LogBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Attach an observer, receiving events from this moment forward.
    ///
    /// Attaching after `close` yields a stream that ends immediately.
    pub fn subscribe(&self) -> LogStream {
        let guard = self.tx.read().expect("broker lock poisoned");
        LogStream {
            rx: guard.as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Publish an event to all currently attached observers.
    ///
    /// With zero observers the event is dropped; only the run's bounded
    /// tail survives for non-streaming preview.
    pub fn publish(&self, event: LogEvent) {
        let guard = self.tx.read().expect("broker lock poisoned");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End the stream. Call only after the terminal `status` event.
    pub fn close(&self) {
        self.tx.write().expect("broker lock poisoned").take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().expect("broker lock poisoned").is_none()
    }
}

/// One observer's view of a run's event sequence.
///
/// Dropping the stream deregisters the observer without affecting the
/// child process or other observers.
pub struct LogStream {
    rx: Option<broadcast::Receiver<LogEvent>>,
}

impl LogStream {
    /// Next event, or `None` once the stream has ended.
    ///
    /// A lagged observer silently skips the overwritten oldest events and
    /// continues with what is still buffered.
    pub async fn next(&mut self) -> Option<LogEvent> {
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow_in_order() {
        let broker = LogBroker::new(DEFAULT_CAPACITY);
        let mut stream = broker.subscribe();

        broker.publish(LogEvent::info("starting"));
        broker.publish(LogEvent::data("line one"));
        broker.publish(LogEvent::status_done());
        broker.close();

        assert_eq!(stream.next().await, Some(LogEvent::info("starting")));
        assert_eq!(stream.next().await, Some(LogEvent::data("line one")));
        assert_eq!(stream.next().await, Some(LogEvent::status_done()));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_observers() {
        let broker = LogBroker::new(DEFAULT_CAPACITY);

        broker.publish(LogEvent::data("before attach"));

        let mut stream = broker.subscribe();
        broker.publish(LogEvent::data("after attach"));
        broker.close();

        assert_eq!(stream.next().await, Some(LogEvent::data("after attach")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_fan_out_is_independent() {
        let broker = LogBroker::new(DEFAULT_CAPACITY);

        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish(LogEvent::data("shared"));

        assert_eq!(a.next().await, Some(LogEvent::data("shared")));

        // Dropping one observer must not affect the other
        drop(a);

        broker.publish(LogEvent::status_done());
        broker.close();

        assert_eq!(b.next().await, Some(LogEvent::data("shared")));
        assert_eq!(b.next().await, Some(LogEvent::status_done()));
        assert_eq!(b.next().await, None);
    }

    #[tokio::test]
    async fn test_slow_observer_drops_oldest() {
        let broker = LogBroker::new(2);
        let mut stream = broker.subscribe();

        for i in 1..=5 {
            broker.publish(LogEvent::data(format!("line {}", i)));
        }
        broker.close();

        // Only the newest two events fit the observer's buffer
        assert_eq!(stream.next().await, Some(LogEvent::data("line 4")));
        assert_eq!(stream.next().await, Some(LogEvent::data("line 5")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_attach_after_close_ends_immediately() {
        let broker = LogBroker::new(DEFAULT_CAPACITY);

        broker.publish(LogEvent::status_done());
        broker.close();
        assert!(broker.is_closed());

        let mut stream = broker.subscribe();
        assert_eq!(stream.next().await, None);
    }
}
