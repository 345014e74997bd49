/// Correlation Broker: matches asynchronous engine replies to the request
/// that produced them.
///
/// Every request registers a single-shot completion under a fresh
/// `CorrelationId`. The reply dispatcher hands each incoming payload to the
/// matching completion exactly once; replies nobody is waiting for are
/// dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, TetherError};
use crate::protocol::ReplyPayload;

/// Opaque, unguessable token for one request/reply pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The single callback awaiting a reply.
pub type Completion = oneshot::Sender<ReplyPayload>;

/// Pending request table, one per adapter instance.
///
/// Guarded by a mutex because request registration and reply dispatch run
/// on different tokio tasks. `None` once the reply stream has closed.
pub struct CorrelationBroker {
    pending: Mutex<Option<HashMap<CorrelationId, Completion>>>,
}

impl Default for CorrelationBroker {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Some(HashMap::new())),
        }
    }
}

impl CorrelationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the completion for `id`. Overwriting is forbidden.
    pub fn register(&self, id: CorrelationId, completion: Completion) -> Result<()> {
        let mut guard = self.pending.lock();
        let Some(pending) = guard.as_mut() else {
            return Err(TetherError::EngineDisconnected);
        };
        if pending.contains_key(&id) {
            error!("Broker: correlation id {} registered twice", id);
            return Err(TetherError::DuplicateCorrelationId { id: id.to_string() });
        }
        pending.insert(id, completion);
        Ok(())
    }

    /// Remove the entry for `id` and hand it `payload`.
    ///
    /// Returns false when nothing was registered under `id` (duplicate,
    /// late or foreign reply); the payload is dropped.
    pub fn dispatch(&self, id: CorrelationId, payload: ReplyPayload) -> bool {
        // Release the lock before completing so the waiter can re-enter.
        let completion = self
            .pending
            .lock()
            .as_mut()
            .and_then(|pending| pending.remove(&id));
        match completion {
            Some(completion) => {
                if completion.send(payload).is_err() {
                    debug!("Broker: requester for {} no longer waiting", id);
                }
                true
            }
            None => {
                debug!("Broker: dropping reply for unknown id {}", id);
                false
            }
        }
    }

    /// Remove a registration without completing it.
    pub fn forget(&self, id: &CorrelationId) -> bool {
        self.pending
            .lock()
            .as_mut()
            .map_or(false, |pending| pending.remove(id).is_some())
    }

    /// Stop accepting requests and drop every pending completion; their
    /// waiters observe a closed channel.
    pub fn close(&self) -> usize {
        let drained = self.pending.lock().take().unwrap_or_default();
        if !drained.is_empty() {
            debug!("Broker: abandoning {} pending requests", drained.len());
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_unknown_id_is_noop() {
        let broker = CorrelationBroker::new();
        assert!(!broker.dispatch(CorrelationId::new(), ReplyPayload::Ack));
        assert!(broker.is_empty());
    }

    #[test]
    fn test_dispatch_completes_once() {
        let broker = CorrelationBroker::new();
        let id = CorrelationId::new();
        let (tx, mut rx) = oneshot::channel();
        broker.register(id, tx).unwrap();

        assert!(broker.dispatch(id, ReplyPayload::Ack));
        assert!(matches!(rx.try_recv(), Ok(ReplyPayload::Ack)));

        // Second reply for the same id finds nothing.
        assert!(!broker.dispatch(id, ReplyPayload::Ack));
        assert!(broker.is_empty());
    }

    #[test]
    fn test_register_twice_fails() {
        let broker = CorrelationBroker::new();
        let id = CorrelationId::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        broker.register(id, tx1).unwrap();
        assert!(matches!(
            broker.register(id, tx2),
            Err(TetherError::DuplicateCorrelationId { .. })
        ));
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_close_drops_waiters() {
        let broker = CorrelationBroker::new();
        let (tx, rx) = oneshot::channel();
        broker.register(CorrelationId::new(), tx).unwrap();
        assert_eq!(broker.close(), 1);
        assert!(tokio_test::block_on(rx).is_err());

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            broker.register(CorrelationId::new(), tx),
            Err(TetherError::EngineDisconnected)
        ));
        assert!(broker.is_closed());
    }

    #[test]
    fn test_forget() {
        let broker = CorrelationBroker::new();
        let id = CorrelationId::new();
        let (tx, _rx) = oneshot::channel();
        broker.register(id, tx).unwrap();
        assert!(broker.forget(&id));
        assert!(!broker.forget(&id));
    }
}
