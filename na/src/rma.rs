//! One-sided RMA (§3, §4.8): bulk put/get against a peer's registered
//! memory, addressed by the serialized [`crate::memh::MemHandle`] the
//! upper framework exchanged out of band.

use crate::addr::Address;
use crate::callback::Callback;
use crate::context::Context;
use crate::domain::Domain;
use crate::endpoint::Endpoint;
use crate::error::{NaError, NaResult};
use crate::memh::MemHandle;
use crate::op::{self, OpId, OpKind, OpRecord};
use crate::provider::rx_addr;

fn check_bounds(offset: usize, len: usize, handle: &MemHandle) -> NaResult<()> {
    let end = offset.checked_add(len).ok_or(NaError::InvalidParameter("put/get: length overflow"))?;
    if end > handle.size {
        return Err(NaError::InvalidParameter("put/get: offset + length exceeds memory handle size"));
    }
    Ok(())
}

fn target_addr(endpoint: &Endpoint, peer: u64, target_id: u32) -> u64 {
    if endpoint.with_sep {
        rx_addr(peer, target_id)
    } else {
        peer
    }
}

/// Write `len` bytes from `local[local_offset..]` into `remote[remote_offset..]`
/// on `dest` (§4.8). Posted with `FI_COMPLETION | FI_DELIVERY_COMPLETE`
/// semantics: the provider fires this op's completion only once the remote
/// side has observed the data, not merely once it left the wire.
#[allow(clippy::too_many_arguments)]
pub fn put(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    dest: Address,
    target_id: u32,
    local: &MemHandle,
    local_offset: usize,
    remote: &MemHandle,
    remote_offset: usize,
    len: usize,
    callback: Callback,
) -> NaResult<OpId> {
    check_bounds(local_offset, len, local)?;
    check_bounds(remote_offset, len, remote)?;

    let provider = domain.provider.as_ref();
    let buf = unsafe { std::slice::from_raw_parts((local.base + local_offset) as *const u8, len) };
    let desc = local.local_desc(provider);
    let target = target_addr(endpoint, dest.fi_addr, target_id);
    let remote_addr = (remote.base + remote_offset) as u64;

    let op = OpRecord::create(OpKind::Put, Some(dest), callback);
    unsafe { op.as_ref().post() };
    let ctx_addr = op.provider_context();
    match provider.write(context.tx, buf, desc, target, remote_addr, remote.key, ctx_addr) {
        Ok(()) => Ok(op),
        Err(e) => {
            unsafe { op::destroy(op) };
            Err(e)
        }
    }
}

/// Read `len` bytes from `remote[remote_offset..]` on `src` into
/// `local[local_offset..]` (§4.8). The completion is always tagged
/// [`OpKind::Get`] (§9: the source's `get` handler mistakenly tags these as
/// `put`; this crate does not propagate that bug).
#[allow(clippy::too_many_arguments)]
pub fn get(
    domain: &Domain,
    endpoint: &Endpoint,
    context: &Context,
    src: Address,
    target_id: u32,
    local: &MemHandle,
    local_offset: usize,
    remote: &MemHandle,
    remote_offset: usize,
    len: usize,
    callback: Callback,
) -> NaResult<OpId> {
    check_bounds(local_offset, len, local)?;
    check_bounds(remote_offset, len, remote)?;

    let provider = domain.provider.as_ref();
    let buf = (local.base + local_offset) as *mut u8;
    let desc = local.local_desc(provider);
    let target = target_addr(endpoint, src.fi_addr, target_id);
    let remote_addr = (remote.base + remote_offset) as u64;

    let op = OpRecord::create(OpKind::Get, Some(src), callback);
    unsafe { op.as_ref().post() };
    let ctx_addr = op.provider_context();
    match provider.read(context.tx, buf, len, desc, target, remote_addr, remote.key, ctx_addr) {
        Ok(()) => Ok(op),
        Err(e) => {
            unsafe { op::destroy(op) };
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddressInner;
    use crate::provider::{AccessFlags, MrMode};

    #[test]
    fn put_rejects_a_request_that_overruns_the_local_handle() {
        let handle = MemHandle::register(
            &crate::provider::fake::FakeProvider::new(),
            crate::provider::DomainHandle(1),
            MrMode::Scalable,
            std::ptr::null(),
            16,
            AccessFlags::READ,
        )
        .unwrap();
        assert!(check_bounds(8, 16, &handle).is_err());
        assert!(check_bounds(0, 16, &handle).is_ok());
        let _ = AddressInner::new(0, "fake://0".to_string(), false, false);
    }
}
