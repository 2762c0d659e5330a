//! Operator decision broker
//!
//! Pending prompts wait on their own reply channel; only the queue of
//! pending prompts is locked, and only long enough to push or pop an entry.
//! The rule list is never held while a packet waits here.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use hostwall_common::{Action, FiveTuple};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// "Decision needed" notification for an operator front end
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecisionRequest {
    /// Prompt id, usable with [`PromptBroker::submit_for`]
    pub id: u64,
    /// Packet identity awaiting a decision
    pub tuple: FiveTuple,
    /// When the prompt was raised
    pub requested_at: DateTime<Utc>,
}

struct PendingPrompt {
    id: u64,
    reply: Sender<Action>,
}

/// Hands out decision requests and routes replies back to waiting packets
pub struct PromptBroker {
    next_id: AtomicU64,
    pending: Mutex<VecDeque<PendingPrompt>>,
    notify_tx: Sender<DecisionRequest>,
    notify_rx: Receiver<DecisionRequest>,
}

impl PromptBroker {
    /// Create broker; at most `capacity` notifications are buffered for
    /// a front end that is not reading
    pub fn new(capacity: usize) -> Self {
        let (notify_tx, notify_rx) = bounded(capacity.max(1));
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            notify_tx,
            notify_rx,
        }
    }

    /// Subscribe to decision requests
    pub fn requests(&self) -> Receiver<DecisionRequest> {
        self.notify_rx.clone()
    }

    /// Number of packets currently waiting
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether prompt `id` still waits for an answer
    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().iter().any(|p| p.id == id)
    }

    /// Raise a prompt and wait up to `timeout` for the answer.
    ///
    /// Returns `None` on timeout. Blocks the calling thread.
    pub fn ask(&self, tuple: &FiveTuple, timeout: Duration) -> Option<Action> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = bounded(1);

        self.pending.lock().push_back(PendingPrompt { id, reply });

        let request = DecisionRequest {
            id,
            tuple: *tuple,
            requested_at: Utc::now(),
        };
        match self.notify_tx.try_send(request) {
            Ok(()) => debug!(id, tuple = %tuple, "Decision requested"),
            Err(TrySendError::Full(_)) => {
                warn!(id, tuple = %tuple, "Decision request queue full, prompt still pending")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }

        match answer.recv_timeout(timeout) {
            Ok(action) => Some(action),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let mut pending = self.pending.lock();
                match pending.iter().position(|p| p.id == id) {
                    Some(index) => {
                        pending.remove(index);
                        None
                    }
                    // Popped by a submitter; its reply was sent under this lock
                    None => answer.try_recv().ok(),
                }
            }
        }
    }

    /// Answer the oldest pending prompt
    pub fn submit(&self, action: Action) -> Option<u64> {
        let mut pending = self.pending.lock();
        while let Some(prompt) = pending.pop_front() {
            if prompt.reply.try_send(action).is_ok() {
                return Some(prompt.id);
            }
        }
        None
    }

    /// Answer a specific prompt
    pub fn submit_for(&self, id: u64, action: Action) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p.id == id) {
            Some(index) => pending
                .remove(index)
                .map(|prompt| prompt.reply.try_send(action).is_ok())
                .unwrap_or(false),
            None => false,
        }
    }
}

impl Default for PromptBroker {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_common::Protocol;
    use std::sync::Arc;
    use std::thread;

    fn tuple() -> FiveTuple {
        FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            40000,
            "198.51.100.7".parse().unwrap(),
            443,
            Protocol::Tcp,
        )
    }

    #[test]
    fn test_timeout_clears_pending() {
        let broker = PromptBroker::default();
        let answer = broker.ask(&tuple(), Duration::from_millis(20));
        assert_eq!(answer, None);
        assert_eq!(broker.pending(), 0);
        assert_eq!(broker.submit(Action::Allow), None);
    }

    #[test]
    fn test_fifo_submission() {
        let broker = Arc::new(PromptBroker::default());
        let requests = broker.requests();

        let waiter = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.ask(&tuple(), Duration::from_secs(5)))
        };

        let request = requests.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request.tuple, tuple());
        assert_eq!(broker.submit(Action::Allow), Some(request.id));
        assert_eq!(waiter.join().unwrap(), Some(Action::Allow));
    }

    #[test]
    fn test_timed_out_request_is_stale() {
        let broker = PromptBroker::default();
        let requests = broker.requests();

        assert_eq!(broker.ask(&tuple(), Duration::from_millis(20)), None);

        // Notification outlives the prompt it announced
        let request = requests.try_recv().unwrap();
        assert!(!broker.is_pending(request.id));
        assert!(!broker.submit_for(request.id, Action::Allow));
    }

    #[test]
    fn test_pending_until_answered() {
        let broker = Arc::new(PromptBroker::default());
        let requests = broker.requests();

        let waiter = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.ask(&tuple(), Duration::from_secs(5)))
        };

        let request = requests.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(broker.is_pending(request.id));
        assert!(broker.submit_for(request.id, Action::Block));
        assert!(!broker.is_pending(request.id));
        assert_eq!(waiter.join().unwrap(), Some(Action::Block));
    }

    #[test]
    fn test_submit_for_unknown_id() {
        let broker = PromptBroker::default();
        assert!(!broker.submit_for(42, Action::Block));
    }
}
