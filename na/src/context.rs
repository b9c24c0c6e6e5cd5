//! Context create/destroy (§3, §4.3): the transmit/receive/CQ/wait
//! resources a single progress-caller drives. In basic-endpoint mode every
//! context aliases the endpoint's own resources; in SEP mode each context
//! is an independently pollable transmit+receive context pair.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::domain::Domain;
use crate::endpoint::Endpoint;
use crate::error::{NaError, NaResult};
use crate::op::OpId;
use crate::provider::{BindDirection, CqHandle, EpHandle, WaitHandle, WaitKind};

pub struct Context {
    pub index: u32,
    pub tx: EpHandle,
    pub rx: EpHandle,
    pub cq: CqHandle,
    pub wait: Option<WaitHandle>,
    pub unexpected: Arc<SpinMutex<VecDeque<OpId>>>,
}

impl Context {
    /// Create context `index` against `endpoint` (§4.3). `index` must be
    /// `< endpoint.max_contexts`; the caller (`NaClass`) is responsible for
    /// enforcing `live_contexts <= max_contexts` since that count is
    /// class-wide, not context-local.
    pub fn create(endpoint: &Arc<Endpoint>, index: u32) -> NaResult<Context> {
        if !endpoint.with_sep {
            let basic = endpoint
                .basic
                .as_ref()
                .expect("a non-SEP endpoint always carries its basic resources");
            return Ok(Context {
                index,
                tx: endpoint.ep,
                rx: endpoint.ep,
                cq: basic.cq,
                wait: basic.wait,
                unexpected: basic.unexpected.clone(),
            });
        }

        let domain: &Arc<Domain> = &endpoint.domain;
        let provider = domain.provider.as_ref();

        let wait_kind = if domain.no_wait() {
            WaitKind::None
        } else {
            WaitKind::Set
        };
        let cq = provider.open_cq(domain.domain, 8192, wait_kind)?;
        let wait = match wait_kind {
            WaitKind::None => None,
            _ => Some(provider.open_wait(domain.fabric)?),
        };

        let tx = provider.open_tx_context(endpoint.ep, index)?;
        let rx = provider.open_rx_context(endpoint.ep, index)?;
        provider.bind_cq(tx, cq, BindDirection::Transmit)?;
        provider.bind_cq(rx, cq, BindDirection::Receive)?;
        provider.enable(tx)?;
        provider.enable(rx)?;

        log::debug!("context: opened SEP context {index} on {}", endpoint.uri);

        Ok(Context {
            index,
            tx,
            rx,
            cq,
            wait,
            unexpected: Arc::new(SpinMutex::new(VecDeque::new())),
        })
    }

    /// Tear down this context's independently-owned resources (§4.3). A
    /// no-op for a basic-mode context's aliased handles, which belong to
    /// the endpoint and are closed by `Endpoint`'s own `Drop`.
    pub fn destroy(self, endpoint: &Endpoint) -> NaResult<()> {
        if !self.unexpected.lock().is_empty() {
            return Err(NaError::protocol("na_context_destroy", -1));
        }
        if !endpoint.with_sep {
            return Ok(());
        }
        let provider = endpoint.domain.provider.as_ref();
        provider.close_ep(self.tx)?;
        provider.close_ep(self.rx)?;
        if let Some(wait) = self.wait {
            provider.close_wait(wait)?;
        }
        provider.close_cq(self.cq)?;
        log::debug!("context: closed SEP context {}", self.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProgressMode};
    use crate::provider::fake::FakeProvider;
    use crate::provider::FabricProvider;

    fn open_endpoint(host: &str, max_contexts: u8) -> Arc<Endpoint> {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = Config::parse("tcp", Some(host), ProgressMode::Auto, max_contexts, None).unwrap();
        let domain = Domain::open(provider, &cfg, "dev0").unwrap();
        Endpoint::open(domain, max_contexts).unwrap()
    }

    #[test]
    fn basic_mode_context_aliases_endpoint_resources() {
        let ep = open_endpoint("127.0.0.1:7900", 1);
        let ctx = Context::create(&ep, 0).unwrap();
        assert_eq!(ctx.tx, ep.ep);
        assert_eq!(ctx.rx, ep.ep);
        assert_eq!(ctx.cq, ep.basic.as_ref().unwrap().cq);
        ctx.destroy(&ep).unwrap();
    }

    #[test]
    fn sep_mode_contexts_get_independent_resources() {
        let ep = open_endpoint("127.0.0.1:7901", 4);
        let ctx0 = Context::create(&ep, 0).unwrap();
        let ctx1 = Context::create(&ep, 1).unwrap();
        assert_ne!(ctx0.cq, ctx1.cq);
        assert_ne!(ctx0.tx, ctx1.tx);
        ctx0.destroy(&ep).unwrap();
        ctx1.destroy(&ep).unwrap();
    }

    #[test]
    fn destroy_rejects_a_nonempty_unexpected_queue() {
        let ep = open_endpoint("127.0.0.1:7902", 1);
        let ctx = Context::create(&ep, 0).unwrap();
        ctx.unexpected.lock().push_back(OpId(std::ptr::null_mut()));
        assert!(ctx.destroy(&ep).is_err());
    }
}
