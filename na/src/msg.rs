//! Tagged two-sided messaging (§3, §4.7): unexpected sends/receives used to
//! bootstrap contact with a peer, and expected sends/receives used once a
//! `(peer, tag)` pair is already agreed on.
//!
//! Tag layout: 30 bits of user tag, plus [`EXPECTED_TAG_FLAG`] at bit 32
//! distinguishing expected traffic from unexpected. An unexpected recv
//! matches any tag with that bit clear; an expected recv matches only its
//! own `peer`+tag exactly.

use crate::addr::Address;
use crate::callback::{Callback, CompletionSink};
use crate::context::Context;
use crate::domain::Domain;
use crate::endpoint::Endpoint;
use crate::error::{NaError, NaResult};
use crate::op::{self, OpId, OpKind, OpPayload, OpRecord};
use crate::progress;
use crate::provider::{rx_addr, EpHandle, FabricProvider, LocalDesc, FI_ADDR_UNSPEC};

/// Bit 32, set on every expected-message tag to separate it from the
/// unexpected tag space (§3, §4.7).
pub const EXPECTED_TAG_FLAG: u64 = 1 << 32;

/// The largest tag a caller may supply; the remaining bit is reserved for
/// [`EXPECTED_TAG_FLAG`] (§4.7).
pub const MAX_USER_TAG: u64 = (1 << 30) - 1;

const UNEXPECTED_MATCH_TAG: u64 = 1;
const UNEXPECTED_IGNORE_MASK: u64 = 0xFFFF_FFFF;

/// `fi_getinfo`/`fi_tsend`'s conventional EAGAIN status; providers signal a
/// transient "can't post right now, drain some completions first" this way.
const EAGAIN_CODE: i32 = -11;

fn is_try_again(err: &NaError) -> bool {
    matches!(err, NaError::Protocol { code, .. } if *code == EAGAIN_CODE)
}

fn validate_tag(tag: u64) -> NaResult<()> {
    if tag > MAX_USER_TAG {
        Err(NaError::InvalidParameter("tag exceeds the 30-bit user tag space"))
    } else {
        Ok(())
    }
}

fn target_addr(endpoint: &Endpoint, peer: u64, target_id: u32) -> u64 {
    if endpoint.with_sep {
        rx_addr(peer, target_id)
    } else {
        peer
    }
}

fn remove_from_unexpected(context: &Context, op: OpId) {
    let mut queue = context.unexpected.lock();
    if let Some(pos) = queue.iter().position(|candidate| *candidate == op) {
        queue.remove(pos);
    }
}

/// Shared retry-once-then-give-up logic for the four posting calls (§4.7):
/// on a transient try-again, drain the context's completion queue once via
/// a non-blocking `progress(0)` and re-issue exactly one more time.
fn post_tsend(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    op: OpId,
    ep: EpHandle,
    buf: &[u8],
    desc: Option<LocalDesc>,
    target: u64,
    tag: u64,
    sink: &dyn CompletionSink,
) -> NaResult<OpId> {
    let provider = domain.provider.as_ref();
    let ctx_addr = op.provider_context();
    match provider.tsend(ep, buf, desc, target, tag, ctx_addr) {
        Ok(()) => Ok(op),
        Err(e) if is_try_again(&e) => {
            let _ = progress::progress(domain, endpoint, context, 0, sink);
            match provider.tsend(ep, buf, desc, target, tag, ctx_addr) {
                Ok(()) => Ok(op),
                Err(e2) => {
                    unsafe { op::destroy(op) };
                    Err(e2)
                }
            }
        }
        Err(e) => {
            unsafe { op::destroy(op) };
            Err(e)
        }
    }
}

/// Post a tagged send carrying an arbitrary tag to a peer that hasn't yet
/// agreed on one (§4.7). `buf`'s leading bytes must already hold the
/// request header when `endpoint.header_template` is `Some` (built by
/// [`crate::class::NaClass::msg_init_unexpected`]).
#[allow(clippy::too_many_arguments)]
pub fn send_unexpected(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    dest: Address,
    target_id: u32,
    buf: &[u8],
    desc: Option<LocalDesc>,
    tag: u64,
    callback: Callback,
    sink: &dyn CompletionSink,
) -> NaResult<OpId> {
    validate_tag(tag)?;
    let target = target_addr(endpoint, dest.fi_addr, target_id);
    let op = OpRecord::create(OpKind::SendUnexpected, Some(dest), callback);
    unsafe { op.as_ref().post() };
    post_tsend(domain, endpoint, context, op, context.tx, buf, desc, target, tag, sink)
}

/// Post a receive matching any incoming tag with [`EXPECTED_TAG_FLAG`]
/// clear, enqueued on `context`'s unexpected queue before the provider call
/// (§4.7, §8: "the op is on exactly one context's unexpected-op queue
/// between post and completion").
pub fn recv_unexpected(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    buf: *mut u8,
    capacity: usize,
    desc: Option<LocalDesc>,
    callback: Callback,
    sink: &dyn CompletionSink,
) -> NaResult<OpId> {
    let op = OpRecord::create(OpKind::RecvUnexpected, None, callback);
    *unsafe { op.as_ref() }.payload.lock() =
        OpPayload::RecvUnexpected { buf: buf as usize, capacity, actual_size: 0, tag: 0 };
    unsafe { op.as_ref().post() };
    context.unexpected.lock().push_back(op);

    let provider = domain.provider.as_ref();
    let ctx_addr = op.provider_context();
    let attempt = |p: &dyn FabricProvider| {
        p.trecv(
            context.rx,
            buf,
            capacity,
            desc,
            FI_ADDR_UNSPEC,
            UNEXPECTED_MATCH_TAG,
            UNEXPECTED_IGNORE_MASK,
            ctx_addr,
        )
    };
    match attempt(provider) {
        Ok(()) => Ok(op),
        Err(e) if is_try_again(&e) => {
            let _ = progress::progress(domain, endpoint, context, 0, sink);
            match attempt(provider) {
                Ok(()) => Ok(op),
                Err(e2) => {
                    remove_from_unexpected(context, op);
                    unsafe { op::destroy(op) };
                    Err(e2)
                }
            }
        }
        Err(e) => {
            remove_from_unexpected(context, op);
            unsafe { op::destroy(op) };
            Err(e)
        }
    }
}

/// Post a tagged send to a peer and tag already agreed on out of band
/// (§4.7); the wire tag carries [`EXPECTED_TAG_FLAG`] so it can never match
/// an unexpected recv.
#[allow(clippy::too_many_arguments)]
pub fn send_expected(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    dest: Address,
    target_id: u32,
    buf: &[u8],
    desc: Option<LocalDesc>,
    tag: u64,
    callback: Callback,
    sink: &dyn CompletionSink,
) -> NaResult<OpId> {
    validate_tag(tag)?;
    let wire_tag = EXPECTED_TAG_FLAG | tag;
    let target = target_addr(endpoint, dest.fi_addr, target_id);
    let op = OpRecord::create(OpKind::SendExpected, Some(dest), callback);
    unsafe { op.as_ref().post() };
    post_tsend(domain, endpoint, context, op, context.tx, buf, desc, target, wire_tag, sink)
}

/// Post a receive matching exactly `(src, tag)` (§4.7).
#[allow(clippy::too_many_arguments)]
pub fn recv_expected(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    src: Address,
    target_id: u32,
    buf: *mut u8,
    capacity: usize,
    desc: Option<LocalDesc>,
    tag: u64,
    callback: Callback,
    sink: &dyn CompletionSink,
) -> NaResult<OpId> {
    validate_tag(tag)?;
    let wire_tag = EXPECTED_TAG_FLAG | tag;
    let target = target_addr(endpoint, src.fi_addr, target_id);
    let op = OpRecord::create(OpKind::RecvExpected, Some(src), callback);
    *unsafe { op.as_ref() }.payload.lock() =
        OpPayload::RecvExpected { buf: buf as usize, capacity, actual_size: 0, expected_tag: tag };
    unsafe { op.as_ref().post() };

    let provider = domain.provider.as_ref();
    let ctx_addr = op.provider_context();
    let attempt = |p: &dyn FabricProvider| {
        p.trecv(context.rx, buf, capacity, desc, target, wire_tag, 0, ctx_addr)
    };
    match attempt(provider) {
        Ok(()) => Ok(op),
        Err(e) if is_try_again(&e) => {
            let _ = progress::progress(domain, endpoint, context, 0, sink);
            match attempt(provider) {
                Ok(()) => Ok(op),
                Err(e2) => {
                    unsafe { op::destroy(op) };
                    Err(e2)
                }
            }
        }
        Err(e) => {
            unsafe { op::destroy(op) };
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_above_the_30_bit_space_are_rejected() {
        assert!(validate_tag(MAX_USER_TAG).is_ok());
        assert!(validate_tag(MAX_USER_TAG + 1).is_err());
    }

    #[test]
    fn expected_tag_flag_is_bit_32() {
        assert_eq!(EXPECTED_TAG_FLAG, 1u64 << 32);
        assert_eq!(EXPECTED_TAG_FLAG & MAX_USER_TAG, 0);
    }
}
