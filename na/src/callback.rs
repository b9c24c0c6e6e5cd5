//! The completion-callback boundary consumed by the upper RPC framework
//! (§6): "a framework callback-queue add function" plus "a
//! framework-supplied callback-info record". This crate only needs to
//! *produce* that record and hand it to something implementing
//! [`CompletionSink`]; [`CallbackQueue`] is a minimal reference sink used
//! by tests and available to any host that doesn't bring its own.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::addr::Address;
use crate::error::NaError;

/// The op-kind-specific data delivered alongside a successful completion.
#[derive(Debug, Clone)]
pub enum CompletionPayload {
    Lookup(Address),
    SendUnexpected,
    SendExpected,
    /// `source` carries its own `Arc` clone, independent of the op's own
    /// reference — the "extra reference" an unexpected-recv address gets
    /// beyond the normal convention (§3).
    RecvUnexpected { tag: u64, actual_size: usize, source: Address },
    RecvExpected { tag: u64, actual_size: usize },
    Put,
    Get,
}

/// What a completion callback is ultimately invoked with: the op's
/// outcome, including `Err(NaError::Canceled)` for a canceled op and
/// `Err(NaError::Size { .. })` for an expected recv whose message
/// overflowed its buffer (§4.9).
pub type CompletionResult = Result<CompletionPayload, NaError>;

/// A user-supplied completion handler, invoked exactly once when its op's
/// entry is drained from the queue.
pub type Callback = Box<dyn FnOnce(CompletionResult) + Send>;

/// One drained unit of work: the user callback, its result, and the
/// plugin-internal release hook that decrements the originating op's
/// refcount (§5, "released... by the release hook fired from the
/// framework's trigger").
pub struct CompletionEntry {
    pub callback: Callback,
    pub result: CompletionResult,
    pub release: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for CompletionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEntry").field("result", &self.result).finish()
    }
}

/// The "framework callback-queue add function" from an external
/// collaborator's point of view: anything that can accept a completion
/// entry for later draining.
pub trait CompletionSink: fmt::Debug + Send + Sync {
    fn push(&self, entry: CompletionEntry);
}

/// A minimal FIFO completion queue: `push` from any progress-calling
/// thread, `trigger` drains and runs callbacks on the caller's thread.
#[derive(Debug, Default)]
pub struct CallbackQueue {
    entries: Mutex<VecDeque<CompletionEntry>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        CallbackQueue { entries: Mutex::new(VecDeque::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain up to `max` entries, running each callback then its release
    /// hook. Returns the number actually drained.
    pub fn trigger(&self, max: usize) -> usize {
        let mut drained = 0;
        while drained < max {
            let entry = self.entries.lock().pop_front();
            match entry {
                Some(entry) => {
                    (entry.callback)(entry.result);
                    (entry.release)();
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }
}

impl CompletionSink for CallbackQueue {
    fn push(&self, entry: CompletionEntry) {
        self.entries.lock().push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn trigger_invokes_callback_then_release_in_order() {
        let queue = CallbackQueue::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let seen_release = seen.clone();
        queue.push(CompletionEntry {
            callback: Box::new(move |res| {
                assert!(res.is_ok());
                seen_cb.store(1, Ordering::SeqCst);
            }),
            result: Ok(CompletionPayload::Put),
            release: Box::new(move || {
                assert_eq!(seen_release.load(Ordering::SeqCst), 1);
                seen_release.store(2, Ordering::SeqCst);
            }),
        });
        assert_eq!(queue.trigger(8), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn trigger_respects_max() {
        let queue = CallbackQueue::new();
        for _ in 0..5 {
            queue.push(CompletionEntry {
                callback: Box::new(|_| {}),
                result: Ok(CompletionPayload::SendExpected),
                release: Box::new(|| {}),
            });
        }
        assert_eq!(queue.trigger(2), 2);
        assert_eq!(queue.len(), 3);
    }
}
