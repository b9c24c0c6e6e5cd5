//! The fabric-provider boundary (§6): a thin libfabric-shaped interface,
//! modeled as a trait so the rest of this crate (domain, endpoint, context,
//! messaging, RMA, progress) can run against either a real provider or the
//! in-memory [`fake::FakeProvider`] used by tests.
//!
//! Every method here corresponds to one or a small cluster of the C calls
//! named in the specification's external-interfaces section
//! (`fi_getinfo`, `fi_domain`, `fi_av_insert_service`, `fi_tsend`,
//! `fi_cq_readfrom`, ...); the production implementation lives in
//! [`ofi::OfiProvider`] and binds them through `na-ofi-sys`.

use std::fmt;

use crate::error::NaResult;

pub mod ofi;

#[cfg(any(test, feature = "fake-provider"))]
pub mod fake;

/// A resolved fabric address handle, opaque to everything above this trait.
pub type FiAddr = u64;

/// Wildcard "don't care" source address, used when posting an
/// unexpected recv.
pub const FI_ADDR_UNSPEC: FiAddr = u64::MAX;

/// The four backends named in the specification's data model. Each maps to
/// a distinct hints record in [`Domain::open`](crate::domain::Domain::open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Sockets,
    VerbsRxm,
    Psm2,
    Gni,
}

impl ProviderKind {
    /// Resolve the `tcp`/`verbs`/`psm2`/`gni` config alias grammar (§4.11).
    pub fn from_alias(name: &str) -> Option<Self> {
        match name {
            "sockets" | "tcp" => Some(ProviderKind::Sockets),
            "verbs" | "verbs;ofi_rxm" => Some(ProviderKind::VerbsRxm),
            "psm2" => Some(ProviderKind::Psm2),
            "gni" => Some(ProviderKind::Gni),
            _ => None,
        }
    }

    /// The libfabric provider substring used in `fi_getinfo` hints and in
    /// the `"<provider>://..."` URI prefix.
    pub fn wire_name(self) -> &'static str {
        match self {
            ProviderKind::Sockets => "sockets",
            ProviderKind::VerbsRxm => "verbs;ofi_rxm",
            ProviderKind::Psm2 => "psm2",
            ProviderKind::Gni => "gni",
        }
    }

    /// True for providers whose `fi_cq_readfrom` carries a usable
    /// `src_fi_addr` directly (`FI_SOURCE | FI_SOURCE_ERR`), letting
    /// unexpected-recv skip the inline request header entirely.
    pub fn native_source_reporting(self) -> bool {
        matches!(self, ProviderKind::Psm2)
    }

    /// True for providers whose address vector is not internally
    /// thread-safe and therefore needs the domain-level provider lock
    /// around AV mutation (§5).
    pub fn needs_av_lock(self) -> bool {
        matches!(self, ProviderKind::Psm2)
    }

    /// True for providers that crash if `fi_cq_signal` is called on a CQ
    /// they own (§4.10).
    pub fn cq_signal_unsafe(self) -> bool {
        matches!(self, ProviderKind::VerbsRxm)
    }

    /// True if the provider accepts `FI_NUMERICHOST` when resolving a
    /// node/service pair (everything except PSM2 and verbs;ofi_rxm, §4.2).
    pub fn accepts_numeric_host(self) -> bool {
        !matches!(self, ProviderKind::Psm2 | ProviderKind::VerbsRxm)
    }

    /// True for providers whose address vector implements
    /// `fi_av_insertsvc` as a shortcut for `fi_getinfo` + `fi_av_insert`
    /// (sockets only, §4.5 step 3). Everywhere else the call is expected to
    /// come back unsupported and callers must use the fallback directly.
    pub fn supports_insert_service(self) -> bool {
        matches!(self, ProviderKind::Sockets)
    }

    pub fn mr_mode(self) -> MrMode {
        match self {
            ProviderKind::Sockets => MrMode::Scalable,
            ProviderKind::VerbsRxm | ProviderKind::Psm2 | ProviderKind::Gni => MrMode::Basic,
        }
    }
}

/// Memory-registration mode: scalable providers use one process-wide MR
/// with a fixed key; basic providers register each buffer individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrMode {
    Basic,
    Scalable,
}

/// The fixed key used for the single scalable-mode memory region covering
/// `[0, u64::MAX)` (§4.1).
pub const SCALABLE_MR_KEY: u64 = 0x0F1B_0F1B;

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const SEND  = 1 << 2;
        const RECV  = 1 << 3;
    }
}

/// A request passed to `fi_getinfo`: the capabilities and mode bits shared
/// by every provider plus the provider-specific bits added in
/// [`crate::domain::Domain::open`].
#[derive(Debug, Clone)]
pub struct Hints {
    pub kind: ProviderKind,
    pub mr_mode: MrMode,
    pub directed_recv: bool,
    pub source_reporting: bool,
    pub auth_key: Option<Vec<u8>>,
}

/// What `fi_getinfo` handed back: enough to drive domain/endpoint open
/// without re-querying the provider.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub mr_mode: MrMode,
    pub source_reporting: bool,
    /// Opaque provider-private payload (e.g. the raw destination address
    /// the provider resolved), forwarded verbatim into `av_insert` when the
    /// provider lacks `insert_service`.
    pub raw_dest_addr: Option<Vec<u8>>,
    /// The `(host, port)` this info resolved to when `get_info` was called
    /// with a bind-side node/service (§4.2). `None` for a pure destination
    /// lookup that never binds an endpoint.
    pub bind_addr: Option<(String, u16)>,
}

/// Number of low bits of an `fi_addr_t` reserved for a scalable endpoint's
/// receive-context index (`rx_ctx_bits = 8`, fixed by this crate's AV open
/// call, §4.1/§4.2).
pub const RX_CTX_BITS: u32 = 8;

/// `fi_rx_addr(peer_fi_addr, target_id, rx_ctx_bits)`: fold a scalable
/// endpoint's receive-context index into the peer address used to target a
/// specific context's CQ. A no-op shift for basic (non-SEP) endpoints,
/// which always address context 0.
pub fn rx_addr(peer: FiAddr, target_id: u32) -> FiAddr {
    (peer << RX_CTX_BITS) | (target_id as u64 & ((1u64 << RX_CTX_BITS) - 1))
}

/// How a context's completion queue should be told to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// No blocking; `progress` spin-polls.
    None,
    /// `FI_WAIT_FD`, used for the sockets provider.
    Fd,
    /// `FI_WAIT_SET`, used for everything else that supports waiting.
    Set,
}

/// Direction a transmit/receive context binds to its completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDirection {
    Transmit,
    Receive,
    Both,
}

/// One decoded completion-queue entry (`fi_cq_tagged_entry` plus, when the
/// provider reports it, the resolved source).
#[derive(Debug, Clone)]
pub struct CqEvent {
    /// The opaque context pointer this event's request was posted with,
    /// as a raw address — recovered into an `OpRecord` by
    /// [`crate::op::op_from_provider_context`].
    pub op_context: usize,
    pub flags: CqFlags,
    pub len: usize,
    pub tag: u64,
    /// Present only when `read_from` was used (native source reporting).
    pub src_addr: Option<FiAddr>,
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct CqFlags: u32 {
        const SEND   = 1 << 0;
        const RECV   = 1 << 1;
        const TAGGED = 1 << 2;
        const READ   = 1 << 3;
        const WRITE  = 1 << 4;
    }
}

/// The reason a `fi_cq_readerr` entry was produced (§4.9 step 4).
#[derive(Debug, Clone)]
pub enum CqErrorKind {
    Canceled,
    AddressNotAvailable { raw_addr: Vec<u8> },
    IoError,
    Other { code: i32 },
}

/// A decoded `fi_cq_err_entry`. Carries the same `flags`/`len`/`tag` a
/// normal [`CqEvent`] would so a re-dispatched recv (§4.9 step 4) can run
/// through the ordinary event-handling path instead of a synthesized
/// success payload.
#[derive(Debug, Clone)]
pub struct CqError {
    pub op_context: usize,
    pub flags: CqFlags,
    pub len: usize,
    pub tag: u64,
    pub kind: CqErrorKind,
}

/// Either a real event or an error event, as returned by one poll of the
/// completion queue.
#[derive(Debug, Clone)]
pub enum CqOutcome {
    Event(CqEvent),
    Error(CqError),
    /// The provider had nothing ready (`FI_EAGAIN`).
    WouldBlock,
}

/// Opaque per-resource handles. These are `usize`-backed (not raw
/// pointers) so they stay `Send + Sync` and so a fake provider can hand out
/// cheap integer ids instead of real memory addresses.
macro_rules! opaque_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);
    };
}

opaque_handle!(FabricHandle);
opaque_handle!(DomainHandle);
opaque_handle!(EpHandle);
opaque_handle!(CqHandle);
opaque_handle!(AvHandle);
opaque_handle!(MrHandle);
opaque_handle!(WaitHandle);

/// A registered-memory descriptor, returned by `reg_mr` and consumed by
/// `tsend`/`trecv`/`writemsg`/`readv` as the local iov descriptor.
#[derive(Debug, Clone, Copy)]
pub struct LocalDesc(pub usize);

/// The fabric-provider interface consumed by this crate (§6). Methods are
/// grouped to mirror the component design in §4 rather than the raw C
/// call list, but each is named after (and is a thin veneer over) the
/// underlying `fi_*` call.
pub trait FabricProvider: fmt::Debug + Send + Sync {
    /// `fi_getinfo`. Must return exactly one matching info or a
    /// `NaError::Protocol` (§4.1).
    fn get_info(
        &self,
        hints: &Hints,
        node: Option<&str>,
        service: Option<&str>,
        numeric_host: bool,
    ) -> NaResult<ProviderInfo>;

    /// `fi_fabric`.
    fn open_fabric(&self, info: &ProviderInfo) -> NaResult<FabricHandle>;
    /// `fi_domain`.
    fn open_domain(&self, fabric: FabricHandle, info: &ProviderInfo) -> NaResult<DomainHandle>;

    /// `fi_mr_reg`, basic-MR mode. Scalable mode calls this once, for the
    /// process-wide `[0, u64::MAX)` region with `SCALABLE_MR_KEY`.
    fn reg_mr(
        &self,
        domain: DomainHandle,
        base: *const u8,
        len: usize,
        access: AccessFlags,
        requested_key: Option<u64>,
    ) -> NaResult<MrHandle>;
    /// `fi_mr_key`.
    fn mr_key(&self, mr: MrHandle) -> u64;
    /// `fi_mr_desc`, the local iov descriptor handed to `tsend`/`trecv`.
    fn mr_desc(&self, mr: MrHandle) -> LocalDesc;
    fn close_mr(&self, mr: MrHandle) -> NaResult<()>;

    /// `fi_av_open`, with `rx_ctx_bits` (8 per §4.1).
    fn open_av(&self, domain: DomainHandle, rx_ctx_bits: u8) -> NaResult<AvHandle>;
    /// `fi_av_insert_service`. `Ok(None)` means the provider doesn't
    /// support this call and the caller should fall back to
    /// `get_info` + `av_insert`.
    fn av_insert_service(&self, av: AvHandle, node: &str, service: &str)
        -> NaResult<Option<FiAddr>>;
    /// `fi_av_insert` with a raw destination address.
    fn av_insert(&self, av: AvHandle, raw_addr: &[u8]) -> NaResult<FiAddr>;
    /// `fi_av_remove`.
    fn av_remove(&self, av: AvHandle, addr: FiAddr) -> NaResult<()>;
    /// `fi_av_straddr`, used to format the endpoint's own URI.
    fn av_straddr(&self, av: AvHandle, addr: FiAddr) -> NaResult<String>;

    /// `fi_endpoint`.
    fn open_endpoint(&self, domain: DomainHandle, info: &ProviderInfo) -> NaResult<EpHandle>;
    /// `fi_scalable_ep`.
    fn open_scalable_endpoint(&self, domain: DomainHandle, info: &ProviderInfo)
        -> NaResult<EpHandle>;
    /// `fi_tx_context`.
    fn open_tx_context(&self, sep: EpHandle, index: u32) -> NaResult<EpHandle>;
    /// `fi_rx_context`.
    fn open_rx_context(&self, sep: EpHandle, index: u32) -> NaResult<EpHandle>;

    /// `fi_cq_open`.
    fn open_cq(&self, domain: DomainHandle, size: usize, wait: WaitKind) -> NaResult<CqHandle>;
    /// `fi_ep_bind` with a CQ fid.
    fn bind_cq(&self, ep: EpHandle, cq: CqHandle, dir: BindDirection) -> NaResult<()>;
    /// `fi_ep_bind` with an AV fid.
    fn bind_av(&self, ep: EpHandle, av: AvHandle) -> NaResult<()>;
    /// `fi_enable`.
    fn enable(&self, ep: EpHandle) -> NaResult<()>;
    /// `fi_getname`, retried once with a larger buffer if too small.
    fn getname(&self, ep: EpHandle) -> NaResult<Vec<u8>>;
    /// Render a raw sockaddr the way `fi_av_straddr` would for this
    /// provider (used to build the endpoint URI without a live AV entry).
    fn format_native_addr(&self, raw_addr: &[u8]) -> NaResult<String>;

    /// `fi_wait_open`.
    fn open_wait(&self, fabric: FabricHandle) -> NaResult<WaitHandle>;
    /// `fi_wait`, blocking up to `timeout_ms`. `Ok(false)` means it timed
    /// out; `Ok(true)` means the wait object was signaled.
    fn wait(&self, wait: WaitHandle, timeout_ms: i32) -> NaResult<bool>;
    /// `fi_cq_signal`, to wake a blocked waiter after a cancel.
    fn cq_signal(&self, cq: CqHandle) -> NaResult<()>;

    /// `fi_tsend`.
    fn tsend(
        &self,
        ep: EpHandle,
        buf: &[u8],
        desc: Option<LocalDesc>,
        dest: FiAddr,
        tag: u64,
        context: usize,
    ) -> NaResult<()>;
    /// `fi_trecvmsg`.
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
    ) -> NaResult<()>;

    /// `fi_writemsg` with `FI_COMPLETION | FI_DELIVERY_COMPLETE`.
    fn write(
        &self,
        ep: EpHandle,
        buf: &[u8],
        desc: Option<LocalDesc>,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: usize,
    ) -> NaResult<()>;
    /// `fi_readv`.
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
    ) -> NaResult<()>;

    /// `fi_cancel` on the transmit or receive side of `ep`.
    fn cancel(&self, ep: EpHandle, context: usize) -> NaResult<()>;

    /// `fi_cq_read` / `fi_cq_readfrom` (the latter when `with_src` is set),
    /// draining up to `max` entries.
    fn cq_read(&self, cq: CqHandle, max: usize, with_src: bool) -> NaResult<Vec<CqOutcome>>;

    fn close_ep(&self, ep: EpHandle) -> NaResult<()>;
    fn close_cq(&self, cq: CqHandle) -> NaResult<()>;
    fn close_av(&self, av: AvHandle) -> NaResult<()>;
    fn close_domain(&self, domain: DomainHandle) -> NaResult<()>;
    fn close_fabric(&self, fabric: FabricHandle) -> NaResult<()>;
    fn close_wait(&self, wait: WaitHandle) -> NaResult<()>;
}
