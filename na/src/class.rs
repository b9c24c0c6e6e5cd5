//! `NaClass`: the crate's public entry point (§2, §6), tying a resolved
//! [`Config`] to a provider, the domain/endpoint pair it opens, a pool of
//! contexts created on demand up to `max_contexts`, and the completion
//! sink every posted op eventually drains into.
//!
//! Two `NaClass`es opened against `Arc::clone`d handles of the same
//! [`crate::provider::fake::FakeProvider`] talk to each other exactly as
//! two real processes would over a wire — see that module's docs.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{ip_key, Address};
use crate::callback::{Callback, CompletionSink};
use crate::config::Config;
use crate::context::Context;
use crate::domain::Domain;
use crate::endpoint::Endpoint;
use crate::error::{NaError, NaResult};
use crate::memh::MemHandle;
use crate::msg;
use crate::op::OpId;
use crate::progress;
use crate::provider::{AccessFlags, FabricProvider, LocalDesc, MrHandle};
use crate::rma;

pub struct NaClass {
    pub config: Config,
    pub domain: Arc<Domain>,
    pub endpoint: Arc<Endpoint>,
    contexts: Mutex<Vec<Option<Arc<Context>>>>,
    live_contexts: AtomicU32,
    sink: Arc<dyn CompletionSink>,
}

impl NaClass {
    /// Open a class against `provider` (§4.1, §4.2): resolves/joins the
    /// domain for `(provider, device_name)`, then opens its endpoint.
    pub fn open(
        config: Config,
        provider: Arc<dyn FabricProvider>,
        device_name: &str,
        sink: Arc<dyn CompletionSink>,
    ) -> NaResult<NaClass> {
        let domain = Domain::open(provider, &config, device_name)?;
        let endpoint = Endpoint::open(domain.clone(), config.max_contexts)?;
        Ok(NaClass {
            config,
            domain,
            endpoint,
            contexts: Mutex::new(Vec::new()),
            live_contexts: AtomicU32::new(0),
            sink,
        })
    }

    pub fn uri(&self) -> &str {
        &self.endpoint.uri
    }

    /// Create a new context, reusing the lowest free slot left by a prior
    /// `context_destroy` (§4.3). Exceeding `max_contexts` is a protocol
    /// error (§8; see DESIGN.md for why this overrides §4.3's literal
    /// wording of invalid-parameter).
    pub fn context_create(&self) -> NaResult<u32> {
        if self.live_contexts.load(Ordering::SeqCst) >= self.config.max_contexts as u32 {
            return Err(NaError::protocol("na_context_create", -1));
        }
        let mut slots = self.contexts.lock();
        let index = slots.iter().position(|slot| slot.is_none()).unwrap_or(slots.len());
        let context = Arc::new(Context::create(&self.endpoint, index as u32)?);
        if index == slots.len() {
            slots.push(Some(context));
        } else {
            slots[index] = Some(context);
        }
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        log::debug!("class: created context {index} on {}", self.endpoint.uri);
        Ok(index as u32)
    }

    /// Destroy context `index` (§4.3). Fails if the context is still
    /// referenced by an in-flight call on another thread, or if its
    /// unexpected-op queue is non-empty.
    pub fn context_destroy(&self, index: u32) -> NaResult<()> {
        let taken = {
            let mut slots = self.contexts.lock();
            let slot = slots
                .get_mut(index as usize)
                .ok_or(NaError::InvalidParameter("context_destroy: index out of range"))?;
            slot.take().ok_or(NaError::InvalidParameter("context_destroy: index is not live"))?
        };
        let context = Arc::try_unwrap(taken)
            .map_err(|_| NaError::protocol("na_context_destroy", -1))?;
        context.destroy(&self.endpoint)?;
        self.live_contexts.fetch_sub(1, Ordering::SeqCst);
        log::debug!("class: destroyed context {index} on {}", self.endpoint.uri);
        Ok(())
    }

    fn get_context(&self, index: u32) -> NaResult<Arc<Context>> {
        self.contexts
            .lock()
            .get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or(NaError::InvalidParameter("no live context at this index"))
    }

    /// Resolve `node:service` into a cached fabric address (§4.5). Only
    /// the IP-keyed form is implemented; PSM2's endpoint-id-string key
    /// scheme is out of scope (see DESIGN.md). Synchronous: used internally
    /// by messaging/progress and by callers that don't need the op/callback
    /// uniformity of [`NaClass::addr_lookup_op`].
    pub fn addr_lookup(&self, node: &str, service: &str) -> NaResult<Address> {
        let ip: Ipv4Addr = node
            .parse()
            .map_err(|_| NaError::InvalidParameter("addr_lookup: node must be a numeric IPv4 host"))?;
        let port: u16 = service
            .parse()
            .map_err(|_| NaError::InvalidParameter("addr_lookup: service must be numeric"))?;
        let key = ip_key(ip, port);
        self.domain.addr_cache.lookup(
            self.domain.provider.as_ref(),
            self.domain.av,
            &self.domain.hints,
            key,
            node,
            service,
            false,
        )
    }

    /// The async-uniform counterpart to [`NaClass::addr_lookup`]: posts a
    /// [`crate::op::OpKind::Lookup`] op and drives it through the same
    /// op/callback machinery as send/recv/put/get, even though resolution
    /// itself completes synchronously against the address cache rather than
    /// through a CQ event (§4.5, §9 "polymorphism over op kinds").
    pub fn addr_lookup_op(&self, node: &str, service: &str, callback: Callback) -> NaResult<OpId> {
        let op = crate::op::OpRecord::create(crate::op::OpKind::Lookup, None, callback);
        unsafe { op.as_ref().post() };
        let result = self.addr_lookup(node, service);
        match result {
            Ok(addr) => {
                if let crate::op::OpPayload::Lookup { addr: slot } = &mut *unsafe { op.as_ref() }.payload.lock() {
                    *slot = Some(addr.clone());
                }
                progress::complete(op, Ok(crate::callback::CompletionPayload::Lookup(addr)), self.sink.as_ref());
            }
            Err(e) => progress::complete(op, Err(e), self.sink.as_ref()),
        }
        Ok(op)
    }

    /// The header an unexpected send must be prefixed with when the
    /// provider can't report its source natively (§4.2, §4.7); a no-op on
    /// providers that can (PSM2).
    pub fn msg_init_unexpected(&self, buf: &mut [u8]) -> NaResult<()> {
        match &self.endpoint.header_template {
            Some(template) => template.encode(buf),
            None => Ok(()),
        }
    }

    /// Draw a registered buffer from the class's memory pool set (§4.6).
    pub fn msg_buf_alloc(&self, size: usize) -> NaResult<(*mut u8, MrHandle)> {
        self.domain.pools.alloc(self.domain.provider.as_ref(), size)
    }

    pub fn msg_buf_free(&self, ptr: *mut u8, mr: MrHandle) -> NaResult<()> {
        self.domain.pools.free(ptr, mr)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_unexpected(
        &self,
        ctx: u32,
        dest: Address,
        target_id: u32,
        buf: &[u8],
        desc: Option<LocalDesc>,
        tag: u64,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        msg::send_unexpected(
            &self.domain,
            &self.endpoint,
            &context,
            dest,
            target_id,
            buf,
            desc,
            tag,
            callback,
            self.sink.as_ref(),
        )
    }

    pub fn msg_recv_unexpected(
        &self,
        ctx: u32,
        buf: *mut u8,
        capacity: usize,
        desc: Option<LocalDesc>,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        msg::recv_unexpected(
            &self.domain,
            &self.endpoint,
            &context,
            buf,
            capacity,
            desc,
            callback,
            self.sink.as_ref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn msg_send_expected(
        &self,
        ctx: u32,
        dest: Address,
        target_id: u32,
        buf: &[u8],
        desc: Option<LocalDesc>,
        tag: u64,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        msg::send_expected(
            &self.domain,
            &self.endpoint,
            &context,
            dest,
            target_id,
            buf,
            desc,
            tag,
            callback,
            self.sink.as_ref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn msg_recv_expected(
        &self,
        ctx: u32,
        src: Address,
        target_id: u32,
        buf: *mut u8,
        capacity: usize,
        desc: Option<LocalDesc>,
        tag: u64,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        msg::recv_expected(
            &self.domain,
            &self.endpoint,
            &context,
            src,
            target_id,
            buf,
            capacity,
            desc,
            tag,
            callback,
            self.sink.as_ref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        ctx: u32,
        dest: Address,
        target_id: u32,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        rma::put(
            &self.domain,
            &self.endpoint,
            &context,
            dest,
            target_id,
            local,
            local_offset,
            remote,
            remote_offset,
            len,
            callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        ctx: u32,
        src: Address,
        target_id: u32,
        local: &MemHandle,
        local_offset: usize,
        remote: &MemHandle,
        remote_offset: usize,
        len: usize,
        callback: Callback,
    ) -> NaResult<OpId> {
        let context = self.get_context(ctx)?;
        rma::get(
            &self.domain,
            &self.endpoint,
            &context,
            src,
            target_id,
            local,
            local_offset,
            remote,
            remote_offset,
            len,
            callback,
        )
    }

    pub fn mem_register(&self, base: *const u8, size: usize, access: AccessFlags) -> NaResult<MemHandle> {
        MemHandle::register(self.domain.provider.as_ref(), self.domain.domain, self.domain.info.mr_mode, base, size, access)
    }

    pub fn mem_deregister(&self, handle: &MemHandle) -> NaResult<()> {
        handle.close(self.domain.provider.as_ref())
    }

    pub fn progress(&self, ctx: u32, timeout_ms: i32) -> NaResult<()> {
        let context = self.get_context(ctx)?;
        progress::progress(&self.domain, &self.endpoint, &context, timeout_ms, self.sink.as_ref())
    }

    pub fn cancel(&self, ctx: u32, op: OpId) -> NaResult<()> {
        let context = self.get_context(ctx)?;
        progress::cancel(&self.domain, &context, op, self.sink.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackQueue;
    use crate::config::ProgressMode;
    use crate::provider::fake::FakeProvider;
    use std::sync::atomic::AtomicBool;

    fn open_class(host: &str, max_contexts: u8) -> NaClass {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = Config::parse("tcp", Some(host), ProgressMode::Auto, max_contexts, None).unwrap();
        let sink = Arc::new(CallbackQueue::new());
        NaClass::open(cfg, provider, "dev0", sink).unwrap()
    }

    #[test]
    fn context_create_destroy_reuses_slots_and_tracks_live_count() {
        let class = open_class("127.0.0.1:7990", 2);
        let a = class.context_create().unwrap();
        let b = class.context_create().unwrap();
        assert_ne!(a, b);
        assert!(class.context_create().is_err());
        class.context_destroy(a).unwrap();
        let c = class.context_create().unwrap();
        assert_eq!(c, a);
        class.context_destroy(b).unwrap();
        class.context_destroy(c).unwrap();
    }

    #[test]
    fn two_classes_over_the_same_fake_fabric_exchange_an_unexpected_message() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let sink = Arc::new(CallbackQueue::new());

        let server_cfg =
            Config::parse("tcp", Some("127.0.0.1:7991"), ProgressMode::Auto, 1, None).unwrap();
        let server = NaClass::open(server_cfg, provider.clone(), "dev0", sink.clone()).unwrap();
        let server_ctx = server.context_create().unwrap();

        let client_cfg =
            Config::parse("tcp", Some("127.0.0.1:7992"), ProgressMode::Auto, 1, None).unwrap();
        let client = NaClass::open(client_cfg, provider, "dev0", sink.clone()).unwrap();
        let client_ctx = client.context_create().unwrap();

        let mut recv_buf = vec![0u8; 128];
        let got_tag = Arc::new(std::sync::Mutex::new(None));
        let got_tag_cb = got_tag.clone();
        server
            .msg_recv_unexpected(
                server_ctx,
                recv_buf.as_mut_ptr(),
                recv_buf.len(),
                None,
                Box::new(move |res| {
                    let payload = res.expect("recv-unexpected should succeed");
                    if let crate::callback::CompletionPayload::RecvUnexpected { tag, .. } = payload {
                        *got_tag_cb.lock().unwrap() = Some(tag);
                    }
                }),
            )
            .unwrap();

        let dest = client.addr_lookup("127.0.0.1", "7991").unwrap();
        let mut send_buf = vec![0u8; crate::header::HEADER_SIZE + 8];
        client.msg_init_unexpected(&mut send_buf).unwrap();
        send_buf[crate::header::HEADER_SIZE..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let sent = Arc::new(AtomicBool::new(false));
        let sent_cb = sent.clone();
        client
            .msg_send_unexpected(
                client_ctx,
                dest,
                0,
                &send_buf,
                None,
                0x2A,
                Box::new(move |res| {
                    assert!(res.is_ok());
                    sent_cb.store(true, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .unwrap();

        client.progress(client_ctx, 0).unwrap();
        server.progress(server_ctx, 0).unwrap();
        sink.trigger(8);

        assert!(sent.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*got_tag.lock().unwrap(), Some(0x2A));
    }

    #[test]
    fn addr_lookup_op_completes_through_the_callback_sink() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let sink = Arc::new(CallbackQueue::new());

        let server_cfg =
            Config::parse("tcp", Some("127.0.0.1:7993"), ProgressMode::Auto, 1, None).unwrap();
        let server = NaClass::open(server_cfg, provider.clone(), "dev0", sink.clone()).unwrap();

        let client_cfg =
            Config::parse("tcp", Some("127.0.0.1:7994"), ProgressMode::Auto, 1, None).unwrap();
        let client = NaClass::open(client_cfg, provider, "dev0", sink.clone()).unwrap();

        let resolved = Arc::new(std::sync::Mutex::new(None));
        let resolved_cb = resolved.clone();
        client
            .addr_lookup_op(
                "127.0.0.1",
                "7993",
                Box::new(move |res| {
                    let payload = res.expect("lookup should succeed");
                    if let crate::callback::CompletionPayload::Lookup(addr) = payload {
                        *resolved_cb.lock().unwrap() = Some(addr.uri.clone());
                    }
                }),
            )
            .unwrap();
        sink.trigger(8);

        assert_eq!(resolved.lock().unwrap().as_deref(), Some("sockets://127.0.0.1:7993"));
        let _ = server.uri();
    }

    /// §8 scenario 2: an expected send to peer context 3 of a 4-context
    /// scalable endpoint must land only on that context's completion queue,
    /// leaving the other three untouched.
    #[test]
    fn expected_send_with_sep_reaches_only_the_targeted_context() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let sink = Arc::new(CallbackQueue::new());

        let server_cfg =
            Config::parse("tcp", Some("127.0.0.1:7995"), ProgressMode::Auto, 4, None).unwrap();
        let server = NaClass::open(server_cfg, provider.clone(), "dev0", sink.clone()).unwrap();
        let server_ctx: Vec<u32> = (0..4).map(|_| server.context_create().unwrap()).collect();

        let client_cfg =
            Config::parse("tcp", Some("127.0.0.1:7996"), ProgressMode::Auto, 1, None).unwrap();
        let client = NaClass::open(client_cfg, provider, "dev0", sink.clone()).unwrap();
        let client_ctx = client.context_create().unwrap();

        let peer_for_server = server.addr_lookup("127.0.0.1", "7996").unwrap();
        let delivered = Arc::new(std::sync::Mutex::new(Vec::<u32>::new()));
        let mut bufs: Vec<Vec<u8>> = (0..4).map(|_| vec![0u8; 256]).collect();
        for (i, (&ctx, buf)) in server_ctx.iter().zip(bufs.iter_mut()).enumerate() {
            let delivered = delivered.clone();
            let idx = i as u32;
            server
                .msg_recv_expected(
                    ctx,
                    peer_for_server.clone(),
                    0,
                    buf.as_mut_ptr(),
                    buf.len(),
                    None,
                    0x10,
                    Box::new(move |res| {
                        assert!(res.is_ok());
                        delivered.lock().unwrap().push(idx);
                    }),
                )
                .unwrap();
        }

        let dest = client.addr_lookup("127.0.0.1", "7995").unwrap();
        let payload = vec![9u8; 128];
        client
            .msg_send_expected(
                client_ctx,
                dest,
                3,
                &payload,
                None,
                0x10,
                Box::new(|res| assert!(res.is_ok())),
            )
            .unwrap();

        client.progress(client_ctx, 0).unwrap();
        for &ctx in &server_ctx {
            let _ = server.progress(ctx, 0);
        }
        sink.trigger(8);

        assert_eq!(*delivered.lock().unwrap(), vec![3]);
    }

    /// §8 scenario 3: an RMA put into a peer's registered memory is
    /// observable at the target address once the put's callback has fired;
    /// a subsequent get off the same handle reads back exactly what was
    /// written.
    #[test]
    fn rma_put_then_get_round_trips_bytes() {
        let class = open_class("127.0.0.1:7997", 1);
        let ctx = class.context_create().unwrap();

        let mut local_src = vec![0xABu8; 1024];
        let mut remote_region = vec![0u8; 1024];
        let mut local_dst = vec![0u8; 1024];

        let local_handle =
            class.mem_register(local_src.as_mut_ptr(), local_src.len(), AccessFlags::READ).unwrap();
        let remote_handle = class
            .mem_register(remote_region.as_mut_ptr(), remote_region.len(), AccessFlags::READ | AccessFlags::WRITE)
            .unwrap();
        let dst_handle =
            class.mem_register(local_dst.as_mut_ptr(), local_dst.len(), AccessFlags::WRITE).unwrap();

        let self_addr = class.addr_lookup("127.0.0.1", "7997").unwrap();

        let put_done = Arc::new(AtomicBool::new(false));
        let put_done_cb = put_done.clone();
        class
            .put(
                ctx,
                self_addr.clone(),
                0,
                &local_handle,
                0,
                &remote_handle,
                0,
                1024,
                Box::new(move |res| {
                    assert!(res.is_ok());
                    put_done_cb.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
        class.progress(ctx, 0).unwrap();
        assert!(put_done.load(Ordering::SeqCst));
        assert_eq!(remote_region, local_src);

        let get_done = Arc::new(AtomicBool::new(false));
        let get_done_cb = get_done.clone();
        class
            .get(
                ctx,
                self_addr,
                0,
                &dst_handle,
                0,
                &remote_handle,
                0,
                1024,
                Box::new(move |res| {
                    assert!(res.is_ok());
                    get_done_cb.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
        class.progress(ctx, 0).unwrap();
        assert!(get_done.load(Ordering::SeqCst));
        assert_eq!(local_dst, local_src);
    }
}
