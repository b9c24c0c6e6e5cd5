//! The operation record (§3, §4.4): the descriptor every in-flight
//! lookup/send/recv/put/get is tracked by, from the moment it's posted to
//! the fabric until its completion callback fires.
//!
//! Every record is heap-allocated once and referenced thereafter by raw
//! pointer, never moved — the fabric provider is handed the address of its
//! `provider_context` field at post time and echoes that same address back
//! unchanged in the matching completion event. [`op_from_provider_context`]
//! recovers the enclosing record from that address using the struct's
//! known field offset, computed once and cached, the idiomatic stand-in
//! for a systems language's "parent of field" pointer arithmetic (§9).

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::addr::Address;
use crate::callback::Callback;

const MAGIC_START: u64 = 0x4E41_4F50_5354_4152;
const MAGIC_END: u64 = 0x4E41_4F50_454E_4421;
const MAGIC_DEAD: u64 = 0;

/// Which of the five request shapes a record was posted as (§3). Dispatch
/// in the progress engine switches on this tag rather than using a
/// function-pointer vtable per op (§9, "polymorphism over op kinds").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Lookup,
    SendUnexpected,
    SendExpected,
    RecvUnexpected,
    RecvExpected,
    Put,
    Get,
}

/// The op-kind-specific state named in §3. Populated at post time and,
/// for the two recv variants, updated in place by the progress engine once
/// the matching completion event arrives.
#[derive(Debug, Clone)]
pub enum OpPayload {
    Lookup { addr: Option<Address> },
    SendUnexpected,
    SendExpected,
    RecvUnexpected { buf: usize, capacity: usize, actual_size: usize, tag: u64 },
    RecvExpected { buf: usize, capacity: usize, actual_size: usize, expected_tag: u64 },
    Put,
    Get,
}

/// Zero-sized marker whose *address*, not value, is what gets handed to
/// the fabric provider as the opaque completion context.
#[derive(Debug, Default)]
pub struct ProviderContextMarker;

/// The op record itself. Bounded by two magic words (§3, §8) so a
/// corrupted or stale provider-context pointer is detected rather than
/// dereferenced.
#[derive(Debug)]
pub struct OpRecord {
    magic_start: AtomicU64,
    pub refcount: AtomicUsize,
    pub completed: AtomicBool,
    pub canceled: AtomicBool,
    pub kind: OpKind,
    pub addr: Option<Address>,
    pub callback: Mutex<Option<Callback>>,
    pub payload: Mutex<OpPayload>,
    provider_context: ProviderContextMarker,
    magic_end: AtomicU64,
}

/// A handle to a heap-allocated [`OpRecord`]. Thin wrapper around the raw
/// pointer so it can cross the provider FFI boundary as a plain address;
/// soundness relies on every field of `OpRecord` being internally
/// synchronized (atomics and `parking_lot::Mutex`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpId(pub(crate) *mut OpRecord);

unsafe impl Send for OpId {}
unsafe impl Sync for OpId {}

impl OpId {
    /// # Safety
    /// `self` must still be a live, un-destroyed op record.
    pub unsafe fn as_ref(&self) -> &OpRecord {
        &*self.0
    }

    /// The address to hand to the fabric provider as this op's completion
    /// context.
    pub fn provider_context(&self) -> usize {
        unsafe { std::ptr::addr_of!((*self.0).provider_context) as usize }
    }
}

impl OpRecord {
    /// Allocate a new record. Starts `completed = true` (not in flight,
    /// §4.4) with refcount 1; [`post`] transitions it into flight.
    pub fn create(kind: OpKind, addr: Option<Address>, callback: Callback) -> OpId {
        let payload = default_payload(kind);
        let record = Box::new(OpRecord {
            magic_start: AtomicU64::new(MAGIC_START),
            refcount: AtomicUsize::new(1),
            completed: AtomicBool::new(true),
            canceled: AtomicBool::new(false),
            kind,
            addr,
            callback: Mutex::new(Some(callback)),
            payload: Mutex::new(payload),
            provider_context: ProviderContextMarker,
            magic_end: AtomicU64::new(MAGIC_END),
        });
        OpId(Box::into_raw(record))
    }

    /// Clear `completed`/`canceled` just before a provider post, marking
    /// the op in flight (§4.7).
    pub fn post(&self) {
        self.completed.store(false, Ordering::SeqCst);
        self.canceled.store(false, Ordering::SeqCst);
    }

    /// CAS-once transition of `completed` 0 → 1 (§4.9). Returns `true` only
    /// for the caller that won the race.
    pub fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// CAS-once transition of `canceled` 0 → 1 (§4.10). Returns `true` only
    /// for the caller that won the race; a redundant cancel returns `false`.
    pub fn try_cancel(&self) -> bool {
        self.canceled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn addref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn valid(&self) -> bool {
        self.magic_start.load(Ordering::SeqCst) == MAGIC_START
            && self.magic_end.load(Ordering::SeqCst) == MAGIC_END
    }
}

fn default_payload(kind: OpKind) -> OpPayload {
    match kind {
        OpKind::Lookup => OpPayload::Lookup { addr: None },
        OpKind::SendUnexpected => OpPayload::SendUnexpected,
        OpKind::SendExpected => OpPayload::SendExpected,
        OpKind::RecvUnexpected => {
            OpPayload::RecvUnexpected { buf: 0, capacity: 0, actual_size: 0, tag: 0 }
        }
        OpKind::RecvExpected => {
            OpPayload::RecvExpected { buf: 0, capacity: 0, actual_size: 0, expected_tag: 0 }
        }
        OpKind::Put => OpPayload::Put,
        OpKind::Get => OpPayload::Get,
    }
}

/// Decrement an op's refcount; on reaching zero, zero its magic words and
/// free it. Matches `destroy()` in §4.4.
///
/// # Safety
/// `op` must not be used again by the caller after this returns, unless
/// another live reference (from a concurrent `addref`) kept it alive.
pub unsafe fn destroy(op: OpId) {
    let record = &*op.0;
    if record.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
        return;
    }
    record.magic_start.store(MAGIC_DEAD, Ordering::SeqCst);
    record.magic_end.store(MAGIC_DEAD, Ordering::SeqCst);
    drop(Box::from_raw(op.0));
}

fn provider_context_offset() -> usize {
    static OFFSET: OnceLock<usize> = OnceLock::new();
    *OFFSET.get_or_init(|| {
        let probe: MaybeUninit<OpRecord> = MaybeUninit::uninit();
        let base = probe.as_ptr() as usize;
        // `addr_of!` never reads through the pointer, so this is sound even
        // though `probe` is uninitialized.
        let field = unsafe { std::ptr::addr_of!((*probe.as_ptr()).provider_context) as usize };
        field - base
    })
}

/// Recover the op record whose `provider_context` address was handed to
/// the fabric provider at post time. Returns `None` (the caller should log
/// and drop the event, §4.4) if the recovered record fails its magic-word
/// check.
///
/// # Safety
/// `context` must be a value previously returned by
/// [`OpId::provider_context`] for an op that may or may not still be live;
/// this function only dereferences it after recomputing the record's base
/// address and must not be called with an arbitrary integer.
pub unsafe fn op_from_provider_context(context: usize) -> Option<OpId> {
    let base = context - provider_context_offset();
    let ptr = base as *mut OpRecord;
    if (*ptr).valid() {
        Some(OpId(ptr))
    } else {
        log::warn!("dropping completion event: op record at {base:#x} failed magic check");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> Callback {
        Box::new(|_| {})
    }

    #[test]
    fn create_starts_completed_until_posted() {
        let op = OpRecord::create(OpKind::Lookup, None, noop_callback());
        unsafe {
            assert!(op.as_ref().is_completed());
            op.as_ref().post();
            assert!(!op.as_ref().is_completed());
            destroy(op);
        }
    }

    #[test]
    fn provider_context_round_trips_to_the_same_record() {
        let op = OpRecord::create(OpKind::SendExpected, None, noop_callback());
        let ctx = op.provider_context();
        unsafe {
            let recovered = op_from_provider_context(ctx).expect("valid record");
            assert_eq!(recovered.0, op.0);
            destroy(op);
        }
    }

    #[test]
    fn destroy_frees_only_at_zero_refcount() {
        let op = OpRecord::create(OpKind::Put, None, noop_callback());
        unsafe {
            op.as_ref().addref();
            destroy(op);
            // still alive: magics intact
            assert!(op.as_ref().valid());
            destroy(op);
        }
    }

    #[test]
    fn complete_is_cas_once() {
        let op = OpRecord::create(OpKind::Get, None, noop_callback());
        unsafe {
            op.as_ref().post();
            assert!(op.as_ref().try_complete());
            assert!(!op.as_ref().try_complete());
            destroy(op);
        }
    }

    #[test]
    fn cancel_is_cas_once() {
        let op = OpRecord::create(OpKind::RecvUnexpected, None, noop_callback());
        unsafe {
            op.as_ref().post();
            assert!(op.as_ref().try_cancel());
            assert!(!op.as_ref().try_cancel());
            destroy(op);
        }
    }
}
