//! Endpoint open (§3, §4.2): either a single basic endpoint with one
//! completion queue and one unexpected-op queue shared by every context,
//! or a scalable endpoint (SEP) whose transmit/receive contexts each get
//! their own completion queue, created later by [`crate::context`].

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::domain::Domain;
use crate::error::NaResult;
use crate::header::RequestHeader;
use crate::op::OpId;
use crate::provider::{
    BindDirection, CqHandle, EpHandle, ProviderInfo, ProviderKind, WaitHandle, WaitKind,
};

/// The resources a basic (non-SEP) endpoint owns directly; a SEP endpoint
/// leaves these to its contexts instead (§3, "Flag `with_sep` determines
/// which").
pub struct BasicResources {
    pub cq: CqHandle,
    pub wait: Option<WaitHandle>,
    pub unexpected: Arc<SpinMutex<VecDeque<OpId>>>,
}

pub struct Endpoint {
    pub domain: Arc<Domain>,
    pub info: ProviderInfo,
    pub ep: EpHandle,
    pub uri: String,
    pub with_sep: bool,
    pub max_contexts: u8,
    pub basic: Option<BasicResources>,
    /// Cached `(feats, ip, port)` template used to stamp outgoing
    /// unexpected sends when the provider can't report source natively
    /// (§3, §4.2).
    pub header_template: Option<RequestHeader>,
}

impl Endpoint {
    pub fn open(domain: Arc<Domain>, max_contexts: u8) -> NaResult<Arc<Endpoint>> {
        let with_sep = max_contexts > 1 && domain.kind != ProviderKind::VerbsRxm;
        let info = domain.info.clone();

        let (ep, basic) = {
            let provider = domain.provider.as_ref();
            if with_sep {
                let ep = provider.open_scalable_endpoint(domain.domain, &domain.info)?;
                provider.bind_av(ep, domain.av)?;
                provider.enable(ep)?;
                (ep, None)
            } else {
                let ep = provider.open_endpoint(domain.domain, &domain.info)?;
                let wait_kind = if domain.no_wait() {
                    WaitKind::None
                } else if domain.kind == ProviderKind::Sockets {
                    WaitKind::Fd
                } else {
                    WaitKind::Set
                };
                let cq = provider.open_cq(domain.domain, 8192, wait_kind)?;
                provider.bind_cq(ep, cq, BindDirection::Both)?;
                provider.bind_av(ep, domain.av)?;
                provider.enable(ep)?;
                let wait = match wait_kind {
                    WaitKind::None => None,
                    _ => Some(provider.open_wait(domain.fabric)?),
                };
                let unexpected = Arc::new(SpinMutex::new(VecDeque::new()));
                (ep, Some(BasicResources { cq, wait, unexpected }))
            }
        };

        let raw_name = domain.provider.getname(ep)?;
        let native = domain.provider.format_native_addr(&raw_name)?;
        let native = fixup_verbs_straddr(domain.kind, &native);
        let uri = format!("{}://{native}", domain.kind.wire_name());

        let header_template = if !domain.info.source_reporting {
            domain.info.bind_addr.as_ref().and_then(|(host, port)| {
                host.parse::<Ipv4Addr>().ok().map(|ip| RequestHeader::new(ip, *port))
            })
        } else {
            None
        };

        log::debug!("endpoint: opened {uri} (sep={with_sep}, max_contexts={max_contexts})");

        Ok(Arc::new(Endpoint { domain, info, ep, uri, with_sep, max_contexts, basic, header_template }))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(basic) = &self.basic {
            debug_assert!(
                basic.unexpected.lock().is_empty(),
                "endpoint closed with a non-empty unexpected-op queue"
            );
            if let Some(wait) = basic.wait {
                let _ = self.domain.provider.close_wait(wait);
            }
            let _ = self.domain.provider.close_cq(basic.cq);
        }
        let _ = self.domain.provider.close_ep(self.ep);
        log::debug!("endpoint: closed {}", self.uri);
    }
}

fn fixup_verbs_straddr(kind: ProviderKind, native: &str) -> String {
    if kind == ProviderKind::VerbsRxm {
        native.replacen("inet://", "", 1)
    } else {
        native.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProgressMode};
    use crate::provider::fake::FakeProvider;
    use crate::provider::FabricProvider;

    fn open_domain(host: &str) -> Arc<Domain> {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = Config::parse("tcp", Some(host), ProgressMode::Auto, 4, None).unwrap();
        Domain::open(provider, &cfg, "dev0").unwrap()
    }

    #[test]
    fn basic_endpoint_derives_its_own_uri() {
        let domain = open_domain("127.0.0.1:7890");
        let ep = Endpoint::open(domain, 1).unwrap();
        assert_eq!(ep.uri, "sockets://127.0.0.1:7890");
        assert!(!ep.with_sep);
        assert!(ep.header_template.is_some());
    }

    #[test]
    fn multiple_contexts_selects_scalable_endpoint() {
        let domain = open_domain("127.0.0.1:7891");
        let ep = Endpoint::open(domain, 4).unwrap();
        assert!(ep.with_sep);
        assert!(ep.basic.is_none());
    }
}
