//! Raw bindings to libfabric (OFI), pinned at fabric-interface version 1.5.
//!
//! This crate is a replacement for linking against `libfabric` directly: it
//! declares the subset of the C API that the `na` crate's `OfiProvider`
//! drives (`fi_getinfo`, endpoint/domain/address-vector/completion-queue
//! lifecycle, tagged messaging, RMA, memory registration) using the same
//! names and calling convention as the real library, so a production build
//! only needs a working `libfabric.so` on the link path.
#![no_std]
#![allow(non_camel_case_types)]

use core::ffi::{c_char, c_int, c_void};

use bitflags::bitflags;

pub const FI_MAJOR_VERSION: u32 = 1;
pub const FI_MINOR_VERSION: u32 = 5;

/// Encodes a `(major, minor)` pair the way `FI_VERSION` does in `rdma/fabric.h`.
pub const fn fi_version(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

pub type fi_addr_t = u64;
/// No address has been resolved yet / "don't care" wildcard source.
pub const FI_ADDR_UNSPEC: fi_addr_t = u64::MAX;

bitflags! {
    /// Subset of `fi_info::caps` / `fi_tx_attr::caps` bits this crate relies on.
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct fi_caps: u64 {
        const FI_TAGGED          = 1 << 4;
        const FI_RMA             = 1 << 3;
        const FI_DIRECTED_RECV   = 1 << 20;
        const FI_SOURCE          = 1 << 14;
        const FI_SOURCE_ERR      = 1 << 29;
        const FI_LOCAL_COMM      = 1 << 21;
        const FI_REMOTE_COMM     = 1 << 22;
    }

    /// Subset of `fi_info::mode` bits.
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct fi_mode: u64 {
        const FI_CONTEXT = 1 << 2;
    }

    /// Completion / operation flags used on `fi_tsend`, `fi_trecv`, `fi_writemsg`.
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct fi_op_flags: u64 {
        const FI_COMPLETION          = 1 << 1;
        const FI_DELIVERY_COMPLETE   = 1 << 4;
        const FI_INJECT_COMPLETE     = 1 << 6;
        const FI_MULTI_RECV          = 1 << 5;
    }

    /// `fi_cq_entry.flags` on a returned completion.
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct fi_cq_flags: u64 {
        const FI_SEND    = 1 << 8;
        const FI_RECV    = 1 << 9;
        const FI_RMA     = 1 << 3;
        const FI_READ    = 1 << 13;
        const FI_WRITE   = 1 << 12;
        const FI_TAGGED  = 1 << 4;
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_ep_type {
    FI_EP_UNSPEC = 0,
    FI_EP_MSG,
    FI_EP_DGRAM,
    FI_EP_RDM,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_mr_mode {
    FI_MR_BASIC = 1,
    FI_MR_SCALABLE = 2,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_av_type {
    FI_AV_MAP = 1,
    FI_AV_TABLE = 2,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_threading {
    FI_THREAD_UNSPEC = 0,
    FI_THREAD_SAFE,
    FI_THREAD_DOMAIN,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_progress {
    FI_PROGRESS_UNSPEC = 0,
    FI_PROGRESS_AUTO,
    FI_PROGRESS_MANUAL,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_order {
    FI_ORDER_NONE = 0,
    FI_ORDER_SAS = 1 << 0,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_resource_mgmt {
    FI_RM_DISABLED = 0,
    FI_RM_ENABLED,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_wait_obj {
    FI_WAIT_NONE = 0,
    FI_WAIT_FD,
    FI_WAIT_SET,
    FI_WAIT_UNSPEC,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum fi_cq_format {
    FI_CQ_FORMAT_UNSPEC = 0,
    FI_CQ_FORMAT_TAGGED,
}

/// Opaque fabric object IDs. The real library defines these as the first
/// field of every `fid_*` struct; here they stand in for the pointer types
/// returned by `fi_fabric`/`fi_domain`/... and passed back into `fi_close`.
#[repr(C)]
pub struct fid_fabric {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_domain {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_ep {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_cq {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_av {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_mr {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_wait {
    _private: [u8; 0],
}
/// Generic fabric identifier `fi_ep_bind`'s second argument is declared
/// against in the real API; every `fid_*` struct above is binary-compatible
/// with this one since it is always the first member in the real headers.
#[repr(C)]
pub struct fid {
    _private: [u8; 0],
}

/// `FI_TRANSMIT`/`FI_RECV`, passed to `fi_ep_bind` to select which side of
/// the endpoint a CQ or wait-object binds to.
pub const FI_TRANSMIT: u64 = 1 << 1;
pub const FI_RECV: u64 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_domain_attr {
    pub mr_mode: fi_mr_mode,
    pub threading: fi_threading,
    pub control_progress: fi_progress,
    pub data_progress: fi_progress,
    pub resource_mgmt: fi_resource_mgmt,
    pub av_type: fi_av_type,
    pub rx_ctx_cnt: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_tx_attr {
    pub msg_order: fi_order,
    pub op_flags: fi_op_flags,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_ep_attr {
    pub type_: fi_ep_type,
    pub auth_key: *const u8,
    pub auth_key_size: usize,
}

/// `struct fi_info`, trimmed to the fields the `na` crate's OFI provider
/// actually reads or sets.
#[repr(C)]
pub struct fi_info {
    pub next: *mut fi_info,
    pub caps: fi_caps,
    pub mode: fi_mode,
    pub addr_format: c_int,
    pub src_addr: *mut c_void,
    pub src_addrlen: usize,
    pub dest_addr: *mut c_void,
    pub dest_addrlen: usize,
    pub domain_attr: *mut fi_domain_attr,
    pub tx_attr: *mut fi_tx_attr,
    pub ep_attr: *mut fi_ep_attr,
    pub fabric_attr: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_cq_attr {
    pub size: usize,
    pub format: fi_cq_format,
    pub wait_obj: fi_wait_obj,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_av_attr {
    pub type_: fi_av_type,
    pub rx_ctx_bits: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct fi_cq_tagged_entry {
    pub op_context: *mut c_void,
    pub flags: u64,
    pub len: usize,
    pub tag: u64,
}

impl Default for fi_cq_flags {
    fn default() -> Self {
        fi_cq_flags::empty()
    }
}

#[repr(C)]
pub struct fi_cq_err_entry {
    pub op_context: *mut c_void,
    pub flags: u64,
    pub len: usize,
    pub buf: *mut c_void,
    pub data: u64,
    pub tag: u64,
    pub olen: usize,
    pub err: c_int,
    pub prov_errno: c_int,
    pub err_data: *mut c_void,
    pub err_data_size: usize,
}

#[repr(C)]
pub struct fi_msg_tagged {
    pub msg_iov: *const c_void,
    pub desc: *mut c_void,
    pub iov_count: usize,
    pub addr: fi_addr_t,
    pub tag: u64,
    pub ignore: u64,
    pub context: *mut c_void,
}

#[repr(C)]
pub struct fi_rma_iov {
    pub addr: u64,
    pub len: usize,
    pub key: u64,
}

#[repr(C)]
pub struct fi_msg_rma {
    pub msg_iov: *const c_void,
    pub desc: *mut c_void,
    pub iov_count: usize,
    pub addr: fi_addr_t,
    pub rma_iov: *const fi_rma_iov,
    pub rma_iov_count: usize,
    pub context: *mut c_void,
}

/// Common error codes surfaced by `fi_*` calls (negated `errno`-style on the
/// real wire; this crate keeps them as positive discriminants and lets
/// callers negate as needed, matching how `ibverbs-sys` represents status).
pub const FI_SUCCESS: c_int = 0;
pub const FI_EAGAIN: c_int = 11;
pub const FI_ECANCELED: c_int = 125;
pub const FI_EADDRNOTAVAIL: c_int = 99;
pub const FI_ETIMEDOUT: c_int = 110;
pub const FI_EIO: c_int = 5;
/// Returned by `fi_cq_read`/`fi_cq_readfrom` when an error entry is waiting
/// and must be drained with `fi_cq_readerr` instead.
pub const FI_EAVAIL: c_int = 61;
/// Returned by calls a provider doesn't implement, e.g. `fi_av_insertsvc`
/// on every provider but sockets.
pub const FI_ENOSYS: c_int = 38;

extern "C" {
    pub fn fi_getinfo(
        version: u32,
        node: *const c_char,
        service: *const c_char,
        flags: u64,
        hints: *const fi_info,
        info: *mut *mut fi_info,
    ) -> c_int;
    pub fn fi_freeinfo(info: *mut fi_info);
    pub fn fi_dupinfo(info: *const fi_info) -> *mut fi_info;
    pub fn fi_allocinfo() -> *mut fi_info;

    pub fn fi_fabric(
        attr: *const c_void,
        fabric: *mut *mut fid_fabric,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_domain(
        fabric: *mut fid_fabric,
        info: *const fi_info,
        domain: *mut *mut fid_domain,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_endpoint(
        domain: *mut fid_domain,
        info: *const fi_info,
        ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_scalable_ep(
        domain: *mut fid_domain,
        info: *const fi_info,
        ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_tx_context(
        sep: *mut fid_ep,
        index: c_int,
        attr: *const fi_tx_attr,
        tx_ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_rx_context(
        sep: *mut fid_ep,
        index: c_int,
        attr: *const c_void,
        rx_ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_enable(ep: *mut fid_ep) -> c_int;
    pub fn fi_ep_bind(ep: *mut fid_ep, bfid: *mut fid, flags: u64) -> c_int;

    pub fn fi_cq_open(
        domain: *mut fid_domain,
        attr: *const fi_cq_attr,
        cq: *mut *mut fid_cq,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_cq_read(cq: *mut fid_cq, buf: *mut fi_cq_tagged_entry, count: usize) -> isize;
    pub fn fi_cq_readfrom(
        cq: *mut fid_cq,
        buf: *mut fi_cq_tagged_entry,
        count: usize,
        src_addr: *mut fi_addr_t,
    ) -> isize;
    pub fn fi_cq_readerr(cq: *mut fid_cq, buf: *mut fi_cq_err_entry, flags: u64) -> isize;
    pub fn fi_cq_signal(cq: *mut fid_cq) -> c_int;

    pub fn fi_wait_open(
        fabric: *mut fid_fabric,
        attr: *const c_void,
        wait_set: *mut *mut fid_wait,
    ) -> c_int;
    pub fn fi_wait(wait_set: *mut fid_wait, timeout: c_int) -> c_int;

    pub fn fi_av_open(
        domain: *mut fid_domain,
        attr: *const fi_av_attr,
        av: *mut *mut fid_av,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_av_insert(
        av: *mut fid_av,
        addr: *const c_void,
        count: usize,
        fi_addr: *mut fi_addr_t,
        flags: u64,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_av_insertsvc(
        av: *mut fid_av,
        node: *const c_char,
        service: *const c_char,
        fi_addr: *mut fi_addr_t,
        flags: u64,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_av_remove(
        av: *mut fid_av,
        fi_addr: *mut fi_addr_t,
        count: usize,
        flags: u64,
    ) -> c_int;
    pub fn fi_av_lookup(
        av: *mut fid_av,
        fi_addr: fi_addr_t,
        addr: *mut c_void,
        addrlen: *mut usize,
    ) -> c_int;
    pub fn fi_av_straddr(
        av: *mut fid_av,
        addr: *const c_void,
        buf: *mut c_char,
        len: *mut usize,
    ) -> *const c_char;

    pub fn fi_mr_reg(
        domain: *mut fid_domain,
        buf: *const c_void,
        len: usize,
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        mr: *mut *mut fid_mr,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_mr_key(mr: *mut fid_mr) -> u64;
    pub fn fi_mr_desc(mr: *mut fid_mr) -> *mut c_void;

    pub fn fi_tsend(
        ep: *mut fid_ep,
        buf: *const c_void,
        len: usize,
        desc: *mut c_void,
        dest_addr: fi_addr_t,
        tag: u64,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_trecvmsg(ep: *mut fid_ep, msg: *const fi_msg_tagged, flags: u64) -> c_int;
    pub fn fi_writemsg(ep: *mut fid_ep, msg: *const fi_msg_rma, flags: u64) -> c_int;
    pub fn fi_readv(
        ep: *mut fid_ep,
        iov: *const c_void,
        desc: *mut *mut c_void,
        count: usize,
        src_addr: fi_addr_t,
        addr: u64,
        key: u64,
        context: *mut c_void,
    ) -> isize;

    pub fn fi_cancel(fid: *mut c_void, context: *mut c_void) -> c_int;
    pub fn fi_close(fid: *mut c_void) -> c_int;
    pub fn fi_control(fid: *mut c_void, command: c_int, arg: *mut c_void) -> c_int;
    pub fn fi_getname(fid: *mut c_void, addr: *mut c_void, addrlen: *mut usize) -> c_int;
    pub fn fi_strerror(errnum: c_int) -> *const c_char;
}
