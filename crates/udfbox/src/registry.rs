//! Callback registry: execution token to one-shot completion state.
//!
//! Exactly-once delivery hangs on one rule: the response watcher is the
//! only taker, and [`CallbackRegistry::take`] removes the entry under the
//! lock. Cancellation never removes the entry; it flips the flag and
//! kills the assigned pid, and the watcher folds that into its terminal
//! transition. A cancel arriving after `take` finds nothing and is a
//! no-op, so it can never signal a pid the pool may already have reaped
//! and reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::service::{LogsFn, ResponseFn};
use crate::token::ExecutionToken;

pub(crate) struct Entry {
    pub on_response: ResponseFn,
    pub on_logs: Option<LogsFn>,
    pub metadata: HashMap<String, String>,
    pub cancelled: Arc<AtomicBool>,
    pub pid: libc::pid_t,
}

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Mutex<HashMap<ExecutionToken, Entry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: ExecutionToken, entry: Entry) {
        let previous = self
            .entries
            .lock()
            .expect("registry lock")
            .insert(token, entry);
        debug_assert!(previous.is_none(), "execution tokens never collide");
    }

    /// Claim the entry for terminal delivery. Returns `None` if another
    /// path already delivered.
    pub fn take(&self, token: &ExecutionToken) -> Option<Entry> {
        self.entries.lock().expect("registry lock").remove(token)
    }

    /// Request cancellation: flag the invocation and kill its worker.
    /// Returns whether the invocation was still live.
    pub fn cancel(&self, token: &ExecutionToken) -> bool {
        let entries = self.entries.lock().expect("registry lock");
        let Some(entry) = entries.get(token) else {
            return false;
        };
        entry.cancelled.store(true, Ordering::SeqCst);
        // Killing the worker closes its socket, which is what wakes the
        // response watcher out of its poll. The guard keeps a bogus pid
        // from fanning out: kill(-1) targets everything we may signal.
        if entry.pid > 0 {
            unsafe { libc::kill(entry.pid, libc::SIGKILL) };
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("registry lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cancelled: &Arc<AtomicBool>) -> Entry {
        Entry {
            on_response: Box::new(|_| {}),
            on_logs: None,
            metadata: HashMap::new(),
            cancelled: Arc::clone(cancelled),
            // Non-positive pids are never signalled.
            pid: -1,
        }
    }

    #[test]
    fn take_is_exactly_once() {
        let registry = CallbackRegistry::new();
        let token = ExecutionToken::mint();
        let flag = Arc::new(AtomicBool::new(false));
        registry.insert(token.clone(), entry(&flag));

        assert!(registry.take(&token).is_some());
        assert!(registry.take(&token).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_flags_live_invocations() {
        let registry = CallbackRegistry::new();
        let token = ExecutionToken::mint();
        let flag = Arc::new(AtomicBool::new(false));
        registry.insert(token.clone(), entry(&flag));

        assert!(registry.cancel(&token));
        assert!(flag.load(Ordering::SeqCst));
        // The entry is still there for the watcher to take.
        assert!(registry.take(&token).is_some());
    }

    #[test]
    fn cancel_after_terminal_is_noop() {
        let registry = CallbackRegistry::new();
        let token = ExecutionToken::mint();
        let flag = Arc::new(AtomicBool::new(false));
        registry.insert(token.clone(), entry(&flag));
        registry.take(&token);

        assert!(!registry.cancel(&token));
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_of_unknown_token_is_noop() {
        let registry = CallbackRegistry::new();
        assert!(!registry.cancel(&ExecutionToken::mint()));
    }
}
