//! The production [`FabricProvider`]: a safe veneer over `na-ofi-sys`'s raw
//! `extern "C"` declarations for libfabric 1.5.
//!
//! Every method here does exactly one thing: marshal arguments into the C
//! shape, make the call, and translate a non-`FI_SUCCESS` return into
//! [`NaError::protocol`]. No retry, no caching, no business logic lives
//! here — that's the job of [`crate::domain`], [`crate::msg`], and
//! [`crate::progress`], which are written against the [`FabricProvider`]
//! trait and never hold an `OfiProvider` directly.

use std::ffi::{CString, c_void};
use std::ptr;

use na_ofi_sys as ffi;

use crate::error::{NaError, NaResult};

use super::{
    AccessFlags, AvHandle, BindDirection, CqError, CqErrorKind, CqEvent, CqFlags, CqHandle,
    CqOutcome, DomainHandle, EpHandle, FabricHandle, FabricProvider, FiAddr, Hints, LocalDesc,
    MrHandle, MrMode, ProviderInfo, ProviderKind, WaitHandle, WaitKind,
};

#[derive(Debug, Default)]
pub struct OfiProvider;

fn check(call: &'static str, code: i32) -> NaResult<()> {
    if code == ffi::FI_SUCCESS {
        Ok(())
    } else {
        Err(NaError::protocol(call, code))
    }
}

/// Decode a raw `fi_cq_tagged_entry`/`fi_cq_err_entry` flags word into
/// [`CqFlags`]. Shared by the normal-event and error-reentry paths of
/// [`OfiProvider::cq_read`] so a recovered error entry carries the same
/// flag bits a normal event would (§4.9 step 4).
fn decode_cq_flags(raw: u64) -> CqFlags {
    let mut flags = CqFlags::empty();
    if raw & (1 << 8) != 0 {
        flags |= CqFlags::SEND;
    }
    if raw & (1 << 9) != 0 {
        flags |= CqFlags::RECV;
    }
    if raw & (1 << 4) != 0 {
        flags |= CqFlags::TAGGED;
    }
    if raw & (1 << 13) != 0 {
        flags |= CqFlags::READ;
    }
    if raw & (1 << 12) != 0 {
        flags |= CqFlags::WRITE;
    }
    flags
}

impl FabricProvider for OfiProvider {
    fn get_info(
        &self,
        hints: &Hints,
        node: Option<&str>,
        service: Option<&str>,
        numeric_host: bool,
    ) -> NaResult<ProviderInfo> {
        let mut caps = ffi::fi_caps::FI_TAGGED | ffi::fi_caps::FI_RMA;
        if hints.directed_recv {
            caps |= ffi::fi_caps::FI_DIRECTED_RECV;
        }
        if hints.source_reporting {
            caps |= ffi::fi_caps::FI_SOURCE | ffi::fi_caps::FI_SOURCE_ERR;
        }

        let node_c = node
            .map(|n| CString::new(n).map_err(|_| NaError::InvalidParameter("node")))
            .transpose()?;
        let service_c = service
            .map(|s| CString::new(s).map_err(|_| NaError::InvalidParameter("service")))
            .transpose()?;
        let flags: u64 = if numeric_host { 1 << 2 /* FI_NUMERICHOST */ } else { 0 };

        let mut hints_raw: ffi::fi_info = unsafe { std::mem::zeroed() };
        hints_raw.caps = caps;

        let mut info_ptr: *mut ffi::fi_info = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_getinfo(
                ffi::fi_version(ffi::FI_MAJOR_VERSION, ffi::FI_MINOR_VERSION),
                node_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                service_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                flags,
                &hints_raw,
                &mut info_ptr,
            )
        };
        check("fi_getinfo", rc)?;
        if info_ptr.is_null() {
            return Err(NaError::protocol("fi_getinfo", -1));
        }
        // Exactly one matching info is required (§4.1); a non-null, single
        // entry with no `next` satisfies that here.
        let info = unsafe { &*info_ptr };
        if !info.next.is_null() {
            unsafe { ffi::fi_freeinfo(info_ptr) };
            return Err(NaError::protocol("fi_getinfo", -1));
        }
        let mr_mode = if info.caps.contains(ffi::fi_caps::FI_SOURCE) {
            MrMode::Basic
        } else {
            hints.kind.mr_mode()
        };
        let bind_addr = match (node, service) {
            (Some(host), Some(port)) => port.parse().ok().map(|p| (host.to_string(), p)),
            _ => None,
        };
        // Copy out `dest_addr` before `fi_freeinfo` reclaims it; this is what
        // `av_insert` consumes for providers that skip `av_insert_service`
        // (§4.5 fallback path).
        let raw_dest_addr = if info.dest_addr.is_null() || info.dest_addrlen == 0 {
            None
        } else {
            Some(unsafe {
                std::slice::from_raw_parts(info.dest_addr as *const u8, info.dest_addrlen).to_vec()
            })
        };
        let result = ProviderInfo {
            kind: hints.kind,
            mr_mode,
            source_reporting: info.caps.contains(ffi::fi_caps::FI_SOURCE),
            raw_dest_addr,
            bind_addr,
        };
        unsafe { ffi::fi_freeinfo(info_ptr) };
        Ok(result)
    }

    fn open_fabric(&self, _info: &ProviderInfo) -> NaResult<FabricHandle> {
        let mut fabric: *mut ffi::fid_fabric = ptr::null_mut();
        let rc = unsafe { ffi::fi_fabric(ptr::null(), &mut fabric, ptr::null_mut()) };
        check("fi_fabric", rc)?;
        Ok(FabricHandle(fabric as usize))
    }

    fn open_domain(&self, fabric: FabricHandle, _info: &ProviderInfo) -> NaResult<DomainHandle> {
        let mut domain: *mut ffi::fid_domain = ptr::null_mut();
        let hints: ffi::fi_info = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            ffi::fi_domain(
                fabric.0 as *mut ffi::fid_fabric,
                &hints,
                &mut domain,
                ptr::null_mut(),
            )
        };
        check("fi_domain", rc)?;
        Ok(DomainHandle(domain as usize))
    }

    fn reg_mr(
        &self,
        domain: DomainHandle,
        base: *const u8,
        len: usize,
        access: AccessFlags,
        requested_key: Option<u64>,
    ) -> NaResult<MrHandle> {
        let mut access_bits: u64 = 0;
        if access.contains(AccessFlags::READ) {
            access_bits |= 1 << 0;
        }
        if access.contains(AccessFlags::WRITE) {
            access_bits |= 1 << 1;
        }
        if access.contains(AccessFlags::SEND) {
            access_bits |= 1 << 2;
        }
        if access.contains(AccessFlags::RECV) {
            access_bits |= 1 << 3;
        }
        let mut mr: *mut ffi::fid_mr = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_mr_reg(
                domain.0 as *mut ffi::fid_domain,
                base as *const c_void,
                len,
                access_bits,
                0,
                requested_key.unwrap_or(0),
                0,
                &mut mr,
                ptr::null_mut(),
            )
        };
        check("fi_mr_reg", rc)?;
        Ok(MrHandle(mr as usize))
    }

    fn mr_key(&self, mr: MrHandle) -> u64 {
        unsafe { ffi::fi_mr_key(mr.0 as *mut ffi::fid_mr) }
    }

    fn mr_desc(&self, mr: MrHandle) -> LocalDesc {
        let desc = unsafe { ffi::fi_mr_desc(mr.0 as *mut ffi::fid_mr) };
        LocalDesc(desc as usize)
    }

    fn close_mr(&self, mr: MrHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(mr.0 as *mut c_void) })
    }

    fn open_av(&self, domain: DomainHandle, rx_ctx_bits: u8) -> NaResult<AvHandle> {
        let attr = ffi::fi_av_attr {
            type_: ffi::fi_av_type::FI_AV_MAP,
            rx_ctx_bits: rx_ctx_bits as i32,
        };
        let mut av: *mut ffi::fid_av = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_av_open(domain.0 as *mut ffi::fid_domain, &attr, &mut av, ptr::null_mut())
        };
        check("fi_av_open", rc)?;
        Ok(AvHandle(av as usize))
    }

    fn av_insert_service(
        &self,
        av: AvHandle,
        node: &str,
        service: &str,
    ) -> NaResult<Option<FiAddr>> {
        let node_c = CString::new(node).map_err(|_| NaError::InvalidParameter("node"))?;
        let service_c = CString::new(service).map_err(|_| NaError::InvalidParameter("service"))?;
        let mut addr: FiAddr = super::FI_ADDR_UNSPEC;
        let rc = unsafe {
            ffi::fi_av_insertsvc(
                av.0 as *mut ffi::fid_av,
                node_c.as_ptr(),
                service_c.as_ptr(),
                &mut addr,
                0,
                ptr::null_mut(),
            )
        };
        if rc == -ffi::FI_ENOSYS {
            return Ok(None);
        }
        if rc < 0 {
            return Err(NaError::protocol("fi_av_insertsvc", rc));
        }
        Ok(Some(addr))
    }

    fn av_insert(&self, av: AvHandle, raw_addr: &[u8]) -> NaResult<FiAddr> {
        let mut addr: FiAddr = super::FI_ADDR_UNSPEC;
        let rc = unsafe {
            ffi::fi_av_insert(
                av.0 as *mut ffi::fid_av,
                raw_addr.as_ptr() as *const c_void,
                1,
                &mut addr,
                0,
                ptr::null_mut(),
            )
        };
        if rc != 1 {
            return Err(NaError::protocol("fi_av_insert", rc));
        }
        Ok(addr)
    }

    fn av_remove(&self, av: AvHandle, mut addr: FiAddr) -> NaResult<()> {
        check(
            "fi_av_remove",
            unsafe { ffi::fi_av_remove(av.0 as *mut ffi::fid_av, &mut addr, 1, 0) },
        )
    }

    fn av_straddr(&self, av: AvHandle, addr: FiAddr) -> NaResult<String> {
        let mut buf = vec![0i8; 64];
        let mut len = buf.len();
        let raw = addr.to_ne_bytes();
        let ptr = unsafe {
            ffi::fi_av_straddr(
                av.0 as *mut ffi::fid_av,
                raw.as_ptr() as *const c_void,
                buf.as_mut_ptr(),
                &mut len,
            )
        };
        if ptr.is_null() {
            return Err(NaError::protocol("fi_av_straddr", -1));
        }
        let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
        Ok(cstr.to_string_lossy().into_owned())
    }

    fn open_endpoint(&self, domain: DomainHandle, _info: &ProviderInfo) -> NaResult<EpHandle> {
        let info: ffi::fi_info = unsafe { std::mem::zeroed() };
        let mut ep: *mut ffi::fid_ep = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_endpoint(domain.0 as *mut ffi::fid_domain, &info, &mut ep, ptr::null_mut())
        };
        check("fi_endpoint", rc)?;
        Ok(EpHandle(ep as usize))
    }

    fn open_scalable_endpoint(
        &self,
        domain: DomainHandle,
        _info: &ProviderInfo,
    ) -> NaResult<EpHandle> {
        let info: ffi::fi_info = unsafe { std::mem::zeroed() };
        let mut ep: *mut ffi::fid_ep = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_scalable_ep(domain.0 as *mut ffi::fid_domain, &info, &mut ep, ptr::null_mut())
        };
        check("fi_scalable_ep", rc)?;
        Ok(EpHandle(ep as usize))
    }

    fn open_tx_context(&self, sep: EpHandle, index: u32) -> NaResult<EpHandle> {
        let mut ep: *mut ffi::fid_ep = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_tx_context(
                sep.0 as *mut ffi::fid_ep,
                index as i32,
                ptr::null(),
                &mut ep,
                ptr::null_mut(),
            )
        };
        check("fi_tx_context", rc)?;
        Ok(EpHandle(ep as usize))
    }

    fn open_rx_context(&self, sep: EpHandle, index: u32) -> NaResult<EpHandle> {
        let mut ep: *mut ffi::fid_ep = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_rx_context(
                sep.0 as *mut ffi::fid_ep,
                index as i32,
                ptr::null(),
                &mut ep,
                ptr::null_mut(),
            )
        };
        check("fi_rx_context", rc)?;
        Ok(EpHandle(ep as usize))
    }

    fn open_cq(&self, domain: DomainHandle, size: usize, wait: WaitKind) -> NaResult<CqHandle> {
        let wait_obj = match wait {
            WaitKind::None => ffi::fi_wait_obj::FI_WAIT_NONE,
            WaitKind::Fd => ffi::fi_wait_obj::FI_WAIT_FD,
            WaitKind::Set => ffi::fi_wait_obj::FI_WAIT_SET,
        };
        let attr = ffi::fi_cq_attr {
            size,
            format: ffi::fi_cq_format::FI_CQ_FORMAT_TAGGED,
            wait_obj,
        };
        let mut cq: *mut ffi::fid_cq = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_cq_open(domain.0 as *mut ffi::fid_domain, &attr, &mut cq, ptr::null_mut())
        };
        check("fi_cq_open", rc)?;
        Ok(CqHandle(cq as usize))
    }

    fn bind_cq(&self, ep: EpHandle, cq: CqHandle, dir: BindDirection) -> NaResult<()> {
        let flags = match dir {
            BindDirection::Transmit => ffi::FI_TRANSMIT,
            BindDirection::Receive => ffi::FI_RECV,
            BindDirection::Both => ffi::FI_TRANSMIT | ffi::FI_RECV,
        };
        let rc = unsafe {
            ffi::fi_ep_bind(ep.0 as *mut ffi::fid_ep, cq.0 as *mut ffi::fid, flags)
        };
        check("fi_ep_bind(cq)", rc)
    }

    fn bind_av(&self, ep: EpHandle, av: AvHandle) -> NaResult<()> {
        let rc = unsafe { ffi::fi_ep_bind(ep.0 as *mut ffi::fid_ep, av.0 as *mut ffi::fid, 0) };
        check("fi_ep_bind(av)", rc)
    }

    fn enable(&self, ep: EpHandle) -> NaResult<()> {
        check("fi_enable", unsafe { ffi::fi_enable(ep.0 as *mut ffi::fid_ep) })
    }

    fn getname(&self, ep: EpHandle) -> NaResult<Vec<u8>> {
        let mut len = 32usize;
        loop {
            let mut buf = vec![0u8; len];
            let mut out_len = len;
            let rc = unsafe {
                ffi::fi_getname(
                    ep.0 as *mut c_void,
                    buf.as_mut_ptr() as *mut c_void,
                    &mut out_len,
                )
            };
            if rc == 0 {
                buf.truncate(out_len);
                return Ok(buf);
            }
            if out_len > len {
                // buffer too small; retry once with the provider-reported size
                len = out_len;
                continue;
            }
            return Err(NaError::protocol("fi_getname", rc));
        }
    }

    fn format_native_addr(&self, raw_addr: &[u8]) -> NaResult<String> {
        // In the real provider this goes through `fi_av_straddr` against a
        // throwaway AV entry; callers needing this without an AV (e.g.
        // formatting the endpoint's own address) use the cached URI
        // instead, so this is only reachable for diagnostics.
        Ok(format!("{raw_addr:02x?}"))
    }

    fn open_wait(&self, fabric: FabricHandle) -> NaResult<WaitHandle> {
        let mut wait: *mut ffi::fid_wait = ptr::null_mut();
        let rc = unsafe {
            ffi::fi_wait_open(fabric.0 as *mut ffi::fid_fabric, ptr::null(), &mut wait)
        };
        check("fi_wait_open", rc)?;
        Ok(WaitHandle(wait as usize))
    }

    fn wait(&self, wait: WaitHandle, timeout_ms: i32) -> NaResult<bool> {
        let rc = unsafe { ffi::fi_wait(wait.0 as *mut ffi::fid_wait, timeout_ms) };
        if rc == ffi::FI_SUCCESS {
            Ok(true)
        } else if rc == -ffi::FI_ETIMEDOUT {
            Ok(false)
        } else {
            Err(NaError::protocol("fi_wait", rc))
        }
    }

    fn cq_signal(&self, cq: CqHandle) -> NaResult<()> {
        check("fi_cq_signal", unsafe { ffi::fi_cq_signal(cq.0 as *mut ffi::fid_cq) })
    }

    fn tsend(
        &self,
        ep: EpHandle,
        buf: &[u8],
        desc: Option<LocalDesc>,
        dest: FiAddr,
        tag: u64,
        context: usize,
    ) -> NaResult<()> {
        let rc = unsafe {
            ffi::fi_tsend(
                ep.0 as *mut ffi::fid_ep,
                buf.as_ptr() as *const c_void,
                buf.len(),
                desc.map_or(ptr::null_mut(), |d| d.0 as *mut c_void),
                dest,
                tag,
                context as *mut c_void,
            )
        };
        if rc == -ffi::FI_EAGAIN {
            return Err(NaError::protocol("fi_tsend", rc));
        }
        check("fi_tsend", rc)
    }

    fn trecv(
        &self,
        ep: EpHandle,
        buf: *mut u8,
        len: usize,
        desc: Option<LocalDesc>,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: usize,
    ) -> NaResult<()> {
        let msg = ffi::fi_msg_tagged {
            msg_iov: buf as *const c_void,
            desc: desc.map_or(ptr::null_mut(), |d| d.0 as *mut c_void),
            iov_count: 1,
            addr: src,
            tag,
            ignore,
            context: context as *mut c_void,
        };
        let rc = unsafe { ffi::fi_trecvmsg(ep.0 as *mut ffi::fid_ep, &msg, 0) };
        let _ = len;
        check("fi_trecvmsg", rc)
    }

    fn write(
        &self,
        ep: EpHandle,
        buf: &[u8],
        desc: Option<LocalDesc>,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> NaResult<()> {
        let rma_iov = ffi::fi_rma_iov { addr: remote_addr, len: buf.len(), key };
        let msg = ffi::fi_msg_rma {
            msg_iov: buf.as_ptr() as *const c_void,
            desc: desc.map_or(ptr::null_mut(), |d| d.0 as *mut c_void),
            iov_count: 1,
            addr: dest,
            rma_iov: &rma_iov,
            rma_iov_count: 1,
            context: context as *mut c_void,
        };
        const FI_COMPLETION: u64 = 1 << 1;
        const FI_DELIVERY_COMPLETE: u64 = 1 << 4;
        let rc = unsafe {
            ffi::fi_writemsg(ep.0 as *mut ffi::fid_ep, &msg, FI_COMPLETION | FI_DELIVERY_COMPLETE)
        };
        check("fi_writemsg", rc)
    }

    fn read(
        &self,
        ep: EpHandle,
        buf: *mut u8,
        len: usize,
        desc: Option<LocalDesc>,
        src: FiAddr,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> NaResult<()> {
        let rc = unsafe {
            ffi::fi_readv(
                ep.0 as *mut ffi::fid_ep,
                buf as *const c_void,
                [desc.map_or(ptr::null_mut(), |d| d.0 as *mut c_void)].as_mut_ptr(),
                1,
                src,
                remote_addr,
                key,
                context as *mut c_void,
            )
        };
        let _ = len;
        if rc < 0 {
            return Err(NaError::protocol("fi_readv", rc as i32));
        }
        Ok(())
    }

    fn cancel(&self, ep: EpHandle, context: usize) -> NaResult<()> {
        check(
            "fi_cancel",
            unsafe { ffi::fi_cancel(ep.0 as *mut c_void, context as *mut c_void) },
        )
    }

    fn cq_read(&self, cq: CqHandle, max: usize, with_src: bool) -> NaResult<Vec<CqOutcome>> {
        let mut entries: Vec<ffi::fi_cq_tagged_entry> = vec![Default::default(); max];
        let mut src_addrs = vec![super::FI_ADDR_UNSPEC; max];
        let n = if with_src {
            unsafe {
                ffi::fi_cq_readfrom(
                    cq.0 as *mut ffi::fid_cq,
                    entries.as_mut_ptr(),
                    max,
                    src_addrs.as_mut_ptr(),
                )
            }
        } else {
            unsafe { ffi::fi_cq_read(cq.0 as *mut ffi::fid_cq, entries.as_mut_ptr(), max) }
        };

        if n == -ffi::FI_EAGAIN as isize {
            return Ok(vec![]);
        }
        if n == -ffi::FI_EAVAIL as isize {
            let mut err: ffi::fi_cq_err_entry = unsafe { std::mem::zeroed() };
            let rc = unsafe { ffi::fi_cq_readerr(cq.0 as *mut ffi::fid_cq, &mut err, 0) };
            if rc < 0 {
                return Err(NaError::protocol("fi_cq_readerr", rc as i32));
            }
            let kind = match err.err {
                c if c == ffi::FI_ECANCELED => CqErrorKind::Canceled,
                c if c == ffi::FI_EADDRNOTAVAIL => {
                    let raw = if err.err_data.is_null() {
                        Vec::new()
                    } else {
                        unsafe {
                            std::slice::from_raw_parts(
                                err.err_data as *const u8,
                                err.err_data_size,
                            )
                            .to_vec()
                        }
                    };
                    CqErrorKind::AddressNotAvailable { raw_addr: raw }
                }
                c if c == ffi::FI_EIO => CqErrorKind::IoError,
                c => CqErrorKind::Other { code: c },
            };
            return Ok(vec![CqOutcome::Error(CqError {
                op_context: err.op_context as usize,
                flags: decode_cq_flags(err.flags),
                len: err.len,
                tag: err.tag,
                kind,
            })]);
        }
        if n < 0 {
            return Err(NaError::protocol("fi_cq_read", n as i32));
        }

        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n as usize {
            let e = &entries[i];
            let flags = decode_cq_flags(e.flags);
            let src_addr = if with_src && src_addrs[i] != super::FI_ADDR_UNSPEC {
                Some(src_addrs[i])
            } else {
                None
            };
            out.push(CqOutcome::Event(CqEvent {
                op_context: e.op_context as usize,
                flags,
                len: e.len,
                tag: e.tag,
                src_addr,
            }));
        }
        Ok(out)
    }

    fn close_ep(&self, ep: EpHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(ep.0 as *mut c_void) })
    }
    fn close_cq(&self, cq: CqHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(cq.0 as *mut c_void) })
    }
    fn close_av(&self, av: AvHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(av.0 as *mut c_void) })
    }
    fn close_domain(&self, domain: DomainHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(domain.0 as *mut c_void) })
    }
    fn close_fabric(&self, fabric: FabricHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(fabric.0 as *mut c_void) })
    }
    fn close_wait(&self, wait: WaitHandle) -> NaResult<()> {
        check("fi_close", unsafe { ffi::fi_close(wait.0 as *mut c_void) })
    }
}
