use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Message ID → in-flight worker handle. All mutation happens under the
/// internal lock; cancellation removes the entry and fires the token in the
/// same critical section so no handle can leak.
#[derive(Default)]
pub struct ActiveRequests {
    inner: Mutex<HashMap<i32, CancellationToken>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and get its cancellation token. An existing entry
    /// under the same Message ID is silently replaced; overlapping IDs are
    /// undefined behavior per RFC 4511 §4.4 and the old slot is simply
    /// discarded, uncancelled.
    pub fn insert(&self, message_id: i32) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .expect("active request table poisoned")
            .insert(message_id, token.clone());
        token
    }

    /// Unregister on completion. Idempotent: a worker that was already
    /// cancelled (and therefore removed) is a no-op.
    pub fn remove(&self, message_id: i32) -> bool {
        self.inner
            .lock()
            .expect("active request table poisoned")
            .remove(&message_id)
            .is_some()
    }

    /// Abandon one request: unregister and signal its worker. Returns false
    /// when the ID was not in flight (already completed, never existed).
    pub fn cancel(&self, message_id: i32) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("active request table poisoned")
            .remove(&message_id);
        match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight worker and empty the table. Bind and Unbind
    /// use this as their barrier.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .inner
            .lock()
            .expect("active request table poisoned")
            .drain()
            .collect();
        for (_, token) in drained {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("active request table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
