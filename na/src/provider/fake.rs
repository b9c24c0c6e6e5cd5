//! An in-memory [`FabricProvider`] double modeled on the software RDMA
//! simulators in the corpus (e.g. a counter-allocated id per resource type,
//! `parking_lot`-guarded shared state, tag-matching done in plain Rust
//! instead of hardware). It exists so the engine in [`crate::domain`],
//! [`crate::msg`], [`crate::rma`], and [`crate::progress`] can be exercised
//! deterministically, in-process, without a real fabric.
//!
//! One `FakeProvider` instance models an entire simulated fabric: two
//! [`crate::class::NaClass`]es built against `Arc::clone`d handles of the
//! same `FakeProvider` can "talk" to each other the way two real processes
//! would talk over a wire, because addresses, tag-matching, and completion
//! queues are all resolved against this shared state rather than per
//! instance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{NaError, NaResult};

use super::{
    AccessFlags, AvHandle, BindDirection, CqEvent, CqFlags, CqHandle, CqOutcome, DomainHandle,
    EpHandle, FabricHandle, FabricProvider, FiAddr, Hints, LocalDesc, MrHandle, ProviderInfo,
    WaitHandle, WaitKind, FI_ADDR_UNSPEC, RX_CTX_BITS,
};

struct PendingRecv {
    buf: usize,
    len: usize,
    match_tag: u64,
    ignore: u64,
    context: usize,
    owner_cq: usize,
}

struct PendingSend {
    payload: Vec<u8>,
    tag: u64,
    src_addr: FiAddr,
}

#[derive(Default)]
struct Target {
    pending_recvs: VecDeque<PendingRecv>,
    pending_sends: VecDeque<PendingSend>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    ep_cq: HashMap<usize, usize>,
    cqs: HashMap<usize, VecDeque<CqOutcome>>,
    /// Address of a basic endpoint, or the scalable endpoint "root" handle,
    /// reachable by node/service lookup.
    listeners: HashMap<String, usize>,
    /// `(sep_root_id, rx_ctx_index) -> rx context's own ep id`, populated by
    /// `open_rx_context`.
    sep_rx_contexts: HashMap<(usize, u32), usize>,
    /// Per-addressable-target (basic ep id, or SEP rx-context ep id)
    /// matching state.
    targets: HashMap<usize, Target>,
    ephemeral_port: u16,
    mrs: HashMap<usize, (usize, usize)>,
}

/// In-memory fabric-provider double. See module docs.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

impl State {
    fn alloc(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }
}

fn tag_matches(send_tag: u64, match_tag: u64, ignore: u64) -> bool {
    (send_tag & !ignore) == (match_tag & !ignore)
}

impl FakeProvider {
    pub fn new() -> Self {
        let mut state = State::default();
        state.ephemeral_port = 40000;
        Self { state: Mutex::new(state) }
    }

    fn push_event(state: &mut State, cq_id: usize, outcome: CqOutcome) {
        state.cqs.entry(cq_id).or_default().push_back(outcome);
    }

    /// Deliver `payload` to `target_id`, matching it against a posted
    /// receive if one is already waiting, or queuing it for a later
    /// `trecv` otherwise. Mirrors the tag-matching a real NIC performs in
    /// hardware.
    fn deliver(state: &mut State, target_id: usize, payload: Vec<u8>, tag: u64, src_addr: FiAddr) {
        let target = state.targets.entry(target_id).or_default();
        let slot = target
            .pending_recvs
            .iter()
            .position(|r| tag_matches(tag, r.match_tag, r.ignore));
        if let Some(idx) = slot {
            let recv = target.pending_recvs.remove(idx).unwrap();
            let n = payload.len().min(recv.len);
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), recv.buf as *mut u8, n);
            }
            let owner_cq = recv.owner_cq;
            Self::push_event(
                state,
                owner_cq,
                CqOutcome::Event(CqEvent {
                    op_context: recv.context,
                    flags: CqFlags::RECV | CqFlags::TAGGED,
                    len: payload.len(),
                    tag,
                    src_addr: Some(src_addr),
                }),
            );
        } else {
            state
                .targets
                .entry(target_id)
                .or_default()
                .pending_sends
                .push_back(PendingSend { payload, tag, src_addr });
        }
    }
}

impl FabricProvider for FakeProvider {
    fn get_info(
        &self,
        hints: &Hints,
        node: Option<&str>,
        service: Option<&str>,
        _numeric_host: bool,
    ) -> NaResult<ProviderInfo> {
        let mut state = self.state.lock();
        let bind_addr = match (node, service) {
            (Some(host), Some(port)) => {
                let p: u16 = port.parse().map_err(|_| NaError::InvalidParameter("service"))?;
                Some((host.to_string(), p))
            }
            (Some(host), None) => {
                let p = state.ephemeral_port;
                state.ephemeral_port += 1;
                Some((host.to_string(), p))
            }
            _ => None,
        };
        Ok(ProviderInfo {
            kind: hints.kind,
            mr_mode: hints.mr_mode,
            source_reporting: hints.source_reporting,
            raw_dest_addr: bind_addr
                .as_ref()
                .map(|(h, p)| encode_sockaddr(h, *p))
                .filter(|_| node.is_some() && service.is_some()),
            bind_addr,
        })
    }

    fn open_fabric(&self, _info: &ProviderInfo) -> NaResult<FabricHandle> {
        Ok(FabricHandle(self.state.lock().alloc()))
    }

    fn open_domain(&self, _fabric: FabricHandle, _info: &ProviderInfo) -> NaResult<DomainHandle> {
        Ok(DomainHandle(self.state.lock().alloc()))
    }

    fn reg_mr(
        &self,
        _domain: DomainHandle,
        base: *const u8,
        len: usize,
        _access: AccessFlags,
        _requested_key: Option<u64>,
    ) -> NaResult<MrHandle> {
        let mut state = self.state.lock();
        let id = state.alloc();
        state.mrs.insert(id, (base as usize, len));
        Ok(MrHandle(id))
    }

    fn mr_key(&self, mr: MrHandle) -> u64 {
        mr.0 as u64
    }

    fn mr_desc(&self, mr: MrHandle) -> LocalDesc {
        LocalDesc(mr.0)
    }

    fn close_mr(&self, mr: MrHandle) -> NaResult<()> {
        self.state.lock().mrs.remove(&mr.0);
        Ok(())
    }

    fn open_av(&self, _domain: DomainHandle, _rx_ctx_bits: u8) -> NaResult<AvHandle> {
        Ok(AvHandle(self.state.lock().alloc()))
    }

    fn av_insert_service(
        &self,
        _av: AvHandle,
        node: &str,
        service: &str,
    ) -> NaResult<Option<FiAddr>> {
        let state = self.state.lock();
        let key = format!("{node}:{service}");
        match state.listeners.get(&key) {
            Some(&id) => Ok(Some(id as u64)),
            None => Err(NaError::protocol("fi_av_insertsvc", -1)),
        }
    }

    fn av_insert(&self, _av: AvHandle, raw_addr: &[u8]) -> NaResult<FiAddr> {
        let (host, port) = decode_sockaddr(raw_addr)?;
        let state = self.state.lock();
        let key = format!("{host}:{port}");
        state
            .listeners
            .get(&key)
            .map(|&id| id as u64)
            .ok_or_else(|| NaError::protocol("fi_av_insert", -1))
    }

    fn av_remove(&self, _av: AvHandle, _addr: FiAddr) -> NaResult<()> {
        Ok(())
    }

    fn av_straddr(&self, _av: AvHandle, addr: FiAddr) -> NaResult<String> {
        Ok(format!("fake://{addr}"))
    }

    fn open_endpoint(&self, _domain: DomainHandle, info: &ProviderInfo) -> NaResult<EpHandle> {
        let mut state = self.state.lock();
        let id = state.alloc();
        if let Some((host, port)) = &info.bind_addr {
            state.listeners.insert(format!("{host}:{port}"), id);
        }
        Ok(EpHandle(id))
    }

    fn open_scalable_endpoint(
        &self,
        _domain: DomainHandle,
        info: &ProviderInfo,
    ) -> NaResult<EpHandle> {
        let mut state = self.state.lock();
        let id = state.alloc();
        if let Some((host, port)) = &info.bind_addr {
            state.listeners.insert(format!("{host}:{port}"), id);
        }
        Ok(EpHandle(id))
    }

    fn open_tx_context(&self, sep: EpHandle, _index: u32) -> NaResult<EpHandle> {
        // Transmit side never needs its own addressable identity; it
        // shares the SEP root's id for bookkeeping purposes.
        let _ = sep;
        Ok(EpHandle(self.state.lock().alloc()))
    }

    fn open_rx_context(&self, sep: EpHandle, index: u32) -> NaResult<EpHandle> {
        let mut state = self.state.lock();
        let id = state.alloc();
        state.sep_rx_contexts.insert((sep.0, index), id);
        Ok(EpHandle(id))
    }

    fn open_cq(&self, _domain: DomainHandle, _size: usize, _wait: WaitKind) -> NaResult<CqHandle> {
        let mut state = self.state.lock();
        let id = state.alloc();
        state.cqs.insert(id, VecDeque::new());
        Ok(CqHandle(id))
    }

    fn bind_cq(&self, ep: EpHandle, cq: CqHandle, _dir: BindDirection) -> NaResult<()> {
        self.state.lock().ep_cq.insert(ep.0, cq.0);
        Ok(())
    }

    fn bind_av(&self, _ep: EpHandle, _av: AvHandle) -> NaResult<()> {
        Ok(())
    }

    fn enable(&self, _ep: EpHandle) -> NaResult<()> {
        Ok(())
    }

    fn getname(&self, ep: EpHandle) -> NaResult<Vec<u8>> {
        let state = self.state.lock();
        for (key, &id) in state.listeners.iter() {
            if id == ep.0 {
                if let Some((host, port)) = key.rsplit_once(':') {
                    let port: u16 = port.parse().unwrap_or(0);
                    return Ok(encode_sockaddr(host, port));
                }
            }
        }
        Ok(vec![0u8; 6])
    }

    fn format_native_addr(&self, raw_addr: &[u8]) -> NaResult<String> {
        let (host, port) = decode_sockaddr(raw_addr)?;
        Ok(format!("{host}:{port}"))
    }

    fn open_wait(&self, _fabric: FabricHandle) -> NaResult<WaitHandle> {
        Ok(WaitHandle(self.state.lock().alloc()))
    }

    fn wait(&self, _wait: WaitHandle, _timeout_ms: i32) -> NaResult<bool> {
        // The fake provider never blocks for real; callers spin-poll `cq_read`
        // with the budget the progress engine already tracks.
        Ok(true)
    }

    fn cq_signal(&self, _cq: CqHandle) -> NaResult<()> {
        Ok(())
    }

    fn tsend(
        &self,
        ep: EpHandle,
        buf: &[u8],
        _desc: Option<LocalDesc>,
        dest: FiAddr,
        tag: u64,
        context: usize,
    ) -> NaResult<()> {
        let mut state = self.state.lock();
        let target_id = (dest >> RX_CTX_BITS) as usize;
        let ctx_bits_mask = (1u64 << RX_CTX_BITS) - 1;
        let rx_index = (dest & ctx_bits_mask) as u32;
        let resolved_target = state
            .sep_rx_contexts
            .get(&(target_id, rx_index))
            .copied()
            .unwrap_or(target_id);

        Self::deliver(&mut state, resolved_target, buf.to_vec(), tag, ep.0 as u64);

        let own_cq = *state
            .ep_cq
            .get(&ep.0)
            .ok_or_else(|| NaError::protocol("fi_tsend", -1))?;
        Self::push_event(
            &mut state,
            own_cq,
            CqOutcome::Event(CqEvent {
                op_context: context,
                flags: CqFlags::SEND | CqFlags::TAGGED,
                len: buf.len(),
                tag,
                src_addr: None,
            }),
        );
        Ok(())
    }

    fn trecv(
        &self,
        ep: EpHandle,
        buf: *mut u8,
        len: usize,
        _desc: Option<LocalDesc>,
        _src: FiAddr,
        tag: u64,
        ignore: u64,
        context: usize,
    ) -> NaResult<()> {
        let mut state = self.state.lock();
        let own_cq = *state
            .ep_cq
            .get(&ep.0)
            .ok_or_else(|| NaError::protocol("fi_trecvmsg", -1))?;

        let target = state.targets.entry(ep.0).or_default();
        let slot = target
            .pending_sends
            .iter()
            .position(|s| tag_matches(s.tag, tag, ignore));
        if let Some(idx) = slot {
            let sent = target.pending_sends.remove(idx).unwrap();
            let n = sent.payload.len().min(len);
            unsafe {
                std::ptr::copy_nonoverlapping(sent.payload.as_ptr(), buf, n);
            }
            Self::push_event(
                &mut state,
                own_cq,
                CqOutcome::Event(CqEvent {
                    op_context: context,
                    flags: CqFlags::RECV | CqFlags::TAGGED,
                    len: sent.payload.len(),
                    tag: sent.tag,
                    src_addr: Some(sent.src_addr),
                }),
            );
        } else {
            state.targets.entry(ep.0).or_default().pending_recvs.push_back(PendingRecv {
                buf: buf as usize,
                len,
                match_tag: tag,
                ignore,
                context,
                owner_cq: own_cq,
            });
        }
        Ok(())
    }

    fn write(
        &self,
        ep: EpHandle,
        buf: &[u8],
        _desc: Option<LocalDesc>,
        _dest: FiAddr,
        remote_addr: u64,
        _key: u64,
        context: usize,
    ) -> NaResult<()> {
        let n = buf.len();
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), remote_addr as *mut u8, n);
        }
        let mut state = self.state.lock();
        let own_cq = *state
            .ep_cq
            .get(&ep.0)
            .ok_or_else(|| NaError::protocol("fi_writemsg", -1))?;
        Self::push_event(
            &mut state,
            own_cq,
            CqOutcome::Event(CqEvent {
                op_context: context,
                flags: CqFlags::WRITE,
                len: n,
                tag: 0,
                src_addr: None,
            }),
        );
        Ok(())
    }

    fn read(
        &self,
        ep: EpHandle,
        buf: *mut u8,
        len: usize,
        _desc: Option<LocalDesc>,
        _src: FiAddr,
        remote_addr: u64,
        _key: u64,
        context: usize,
    ) -> NaResult<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(remote_addr as *const u8, buf, len);
        }
        let mut state = self.state.lock();
        let own_cq = *state
            .ep_cq
            .get(&ep.0)
            .ok_or_else(|| NaError::protocol("fi_readv", -1))?;
        Self::push_event(
            &mut state,
            own_cq,
            CqOutcome::Event(CqEvent {
                op_context: context,
                flags: CqFlags::READ,
                len,
                tag: 0,
                src_addr: None,
            }),
        );
        Ok(())
    }

    fn cancel(&self, ep: EpHandle, context: usize) -> NaResult<()> {
        let mut state = self.state.lock();
        if let Some(target) = state.targets.get_mut(&ep.0) {
            target.pending_recvs.retain(|r| r.context != context);
        }
        Ok(())
    }

    fn cq_read(&self, cq: CqHandle, max: usize, _with_src: bool) -> NaResult<Vec<CqOutcome>> {
        let mut state = self.state.lock();
        let queue = state.cqs.entry(cq.0).or_default();
        let mut out = Vec::new();
        while out.len() < max {
            match queue.pop_front() {
                Some(ev) => out.push(ev),
                None => break,
            }
        }
        Ok(out)
    }

    fn close_ep(&self, ep: EpHandle) -> NaResult<()> {
        self.state.lock().ep_cq.remove(&ep.0);
        Ok(())
    }
    fn close_cq(&self, cq: CqHandle) -> NaResult<()> {
        self.state.lock().cqs.remove(&cq.0);
        Ok(())
    }
    fn close_av(&self, _av: AvHandle) -> NaResult<()> {
        Ok(())
    }
    fn close_domain(&self, _domain: DomainHandle) -> NaResult<()> {
        Ok(())
    }
    fn close_fabric(&self, _fabric: FabricHandle) -> NaResult<()> {
        Ok(())
    }
    fn close_wait(&self, _wait: WaitHandle) -> NaResult<()> {
        Ok(())
    }
}

fn encode_sockaddr(host: &str, port: u16) -> Vec<u8> {
    let ip: std::net::Ipv4Addr = host.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&port.to_be_bytes());
    out
}

fn decode_sockaddr(raw: &[u8]) -> NaResult<(String, u16)> {
    if raw.len() < 6 {
        return Err(NaError::InvalidParameter("raw address too short"));
    }
    let ip = std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    Ok((ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_send_recv_matches_by_tag() {
        let provider = FakeProvider::new();
        let fabric = provider.open_fabric(&dummy_info()).unwrap();
        let domain = provider.open_domain(fabric, &dummy_info()).unwrap();

        let server_info = provider
            .get_info(&dummy_hints(), Some("127.0.0.1"), Some("7890"), true)
            .unwrap();
        let server_ep = provider.open_endpoint(domain, &server_info).unwrap();
        let server_cq = provider.open_cq(domain, 16, WaitKind::None).unwrap();
        provider.bind_cq(server_ep, server_cq, BindDirection::Both).unwrap();

        let client_info = provider
            .get_info(&dummy_hints(), Some("127.0.0.1"), Some("7891"), true)
            .unwrap();
        let client_ep = provider.open_endpoint(domain, &client_info).unwrap();
        let client_cq = provider.open_cq(domain, 16, WaitKind::None).unwrap();
        provider.bind_cq(client_ep, client_cq, BindDirection::Both).unwrap();

        let av = provider.open_av(domain, 8).unwrap();
        let server_addr =
            provider.av_insert_service(av, "127.0.0.1", "7890").unwrap().unwrap();

        let mut recv_buf = vec![0u8; 64];
        provider
            .trecv(server_ep, recv_buf.as_mut_ptr(), recv_buf.len(), None, FI_ADDR_UNSPEC, 1, 0xFFFF_FFFF, 0xAAAA)
            .unwrap();

        let payload = vec![7u8; 32];
        provider.tsend(client_ep, &payload, None, server_addr, 0x2A, 0xBBBB).unwrap();

        let events = provider.cq_read(server_cq, 8, false).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CqOutcome::Event(e) => {
                assert_eq!(e.op_context, 0xAAAA);
                assert_eq!(e.tag, 0x2A);
                assert_eq!(e.len, 32);
            }
            _ => panic!("expected event"),
        }
        assert_eq!(&recv_buf[..32], payload.as_slice());

        let send_events = provider.cq_read(client_cq, 8, false).unwrap();
        assert_eq!(send_events.len(), 1);
    }

    fn dummy_hints() -> Hints {
        Hints {
            kind: crate::provider::ProviderKind::Sockets,
            mr_mode: crate::provider::MrMode::Scalable,
            directed_recv: true,
            source_reporting: false,
            auth_key: None,
        }
    }

    fn dummy_info() -> ProviderInfo {
        ProviderInfo {
            kind: crate::provider::ProviderKind::Sockets,
            mr_mode: crate::provider::MrMode::Scalable,
            source_reporting: false,
            raw_dest_addr: None,
            bind_addr: None,
        }
    }
}
