use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::Value;
use tracing::warn;

/// Something the bridge client observed that no caller asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A notification with no registered handler.
    Notification { method: String, params: Value },
    /// A reply whose request already timed out or never existed.
    UnmatchedReply { id: u64, body: Value },
    /// A message that could not be understood.
    ParseError { error: String },
    /// A registered handler reported a failure.
    HandlerError { method: String, error: String },
    /// Connecting failed; the next attempt follows after `retry_in`.
    ConnectionError { error: String, retry_in: Duration },
    /// An established connection ended.
    Disconnected { reason: String, retry_in: Duration },
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notification { method, params } => write!(f, "{method}: {params}"),
            Self::UnmatchedReply { id, body } => write!(f, "unmatched reply {id}: {body}"),
            Self::ParseError { error } => write!(f, "unreadable message: {error}"),
            Self::HandlerError { method, error } => write!(f, "handler for {method} failed: {error}"),
            Self::ConnectionError { error, retry_in } => {
                write!(f, "connect failed: {error} (retry in {retry_in:?})")
            }
            Self::Disconnected { reason, retry_in } => {
                write!(f, "disconnected: {reason} (retry in {retry_in:?})")
            }
        }
    }
}

/// Bounded FIFO of events; the oldest entry is dropped when full.
pub(crate) struct EventQueue {
    capacity: usize,
    tx: Sender<BridgeEvent>,
    rx: Receiver<BridgeEvent>,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { capacity, tx, rx }
    }

    pub(crate) fn push(&self, event: BridgeEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if let Ok(dropped) = self.rx.try_recv() {
                        warn!(
                            capacity = self.capacity,
                            dropped = %dropped,
                            "event queue full, dropping oldest"
                        );
                    }
                    event = back;
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub(crate) fn drain(&self) -> Vec<BridgeEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    pub(crate) fn next(&self, timeout: Duration) -> Option<BridgeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn parse_error(n: usize) -> BridgeEvent {
        BridgeEvent::ParseError {
            error: format!("bad {n}"),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let queue = EventQueue::new(2);
        queue.push(parse_error(1));
        queue.push(parse_error(2));
        queue.push(parse_error(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), vec![parse_error(2), parse_error(3)]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn next_times_out_when_empty() {
        let queue = EventQueue::new(4);
        let start = Instant::now();
        assert!(queue.next(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn next_wakes_on_push() {
        let queue = std::sync::Arc::new(EventQueue::new(4));
        let producer = std::sync::Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(parse_error(1));
        });
        assert_eq!(queue.next(Duration::from_secs(5)), Some(parse_error(1)));
        handle.join().expect("producer thread should finish");
    }
}
