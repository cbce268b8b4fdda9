use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TransportError};

type Waiter = SyncSender<Result<Value>>;

/// Outstanding requests keyed by id.
///
/// Entries are removed when resolved, timed out or failed, so an id is never
/// answered twice.
#[derive(Default)]
pub(crate) struct PendingTable {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id` and return its receiving end.
    pub(crate) fn register(&self, id: u64) -> Receiver<Result<Value>> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.lock().insert(id, tx);
        rx
    }

    /// Deliver an outcome. Returns false when nobody waits for `id`.
    pub(crate) fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let waiter = self.lock().remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have given up between lookup and send.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every outstanding request with an error built by `make`.
    pub(crate) fn fail_all(&self, make: impl Fn() -> TransportError) -> usize {
        let drained: Vec<Waiter> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(make()));
        }
        if count > 0 {
            debug!(count, "failed outstanding requests");
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolve_delivers_once() {
        let table = PendingTable::default();
        let rx = table.register(1);
        assert!(table.resolve(1, Ok(json!(true))));
        assert!(!table.resolve(1, Ok(json!(false))));
        assert_eq!(rx.recv().unwrap().unwrap(), json!(true));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fail_all_reaches_every_waiter() {
        let table = PendingTable::default();
        let a = table.register(1);
        let b = table.register(2);
        assert_eq!(table.fail_all(|| TransportError::Disconnected), 2);
        assert!(matches!(a.recv().unwrap(), Err(TransportError::Disconnected)));
        assert!(matches!(b.recv().unwrap(), Err(TransportError::Disconnected)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn remove_forgets_waiter() {
        let table = PendingTable::default();
        let _rx = table.register(9);
        assert!(table.remove(9));
        assert!(!table.resolve(9, Ok(Value::Null)));
    }
}
