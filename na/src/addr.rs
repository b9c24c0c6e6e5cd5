//! Address cache (§3, §4.5): maps a source key (IPv4+port packed into a
//! u64, or a provider-native endpoint id) to the fabric address handle the
//! address vector resolved it to, with double-checked-locking insertion so
//! concurrent lookups of the same peer race safely onto one entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{NaError, NaResult};
use crate::provider::{AvHandle, FabricProvider, FiAddr, Hints};

/// Pack an IPv4 address and port into the 64-bit address-cache key used by
/// IP-based providers (§3).
pub fn ip_key(ip: std::net::Ipv4Addr, port: u16) -> u64 {
    (u32::from(ip) as u64) << 32 | port as u64
}

/// A resolved peer address: opaque handle, human-readable URI, and the two
/// flags named in §3. Shared via `Arc` — cloning it *is* the "extra
/// reference" mechanism the specification describes for addresses handed
/// to the framework across an unexpected recv (§3, §9).
#[derive(Debug)]
pub struct AddressInner {
    pub fi_addr: FiAddr,
    pub uri: String,
    pub is_unexpected_generated: bool,
    pub is_self: bool,
}

pub type Address = Arc<AddressInner>;

impl AddressInner {
    pub fn new(fi_addr: FiAddr, uri: String, is_unexpected_generated: bool, is_self: bool) -> Address {
        Arc::new(AddressInner { fi_addr, uri, is_unexpected_generated, is_self })
    }
}

#[derive(Debug, Default)]
pub struct AddressCache {
    map: RwLock<HashMap<u64, Address>>,
}

impl AddressCache {
    pub fn new() -> Self {
        AddressCache::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Resolve `key` (`node:service`) to a fabric address, inserting it on
    /// first use. Implements the double-checked-locking algorithm of §4.5.
    pub fn lookup(
        &self,
        provider: &dyn FabricProvider,
        av: AvHandle,
        hints: &Hints,
        key: u64,
        node: &str,
        service: &str,
        unexpected_generated: bool,
    ) -> NaResult<Address> {
        if let Some(addr) = self.map.read().get(&key) {
            return Ok(addr.clone());
        }

        let mut map = self.map.write();
        if let Some(addr) = map.get(&key) {
            return Ok(addr.clone());
        }

        let via_service =
            if hints.kind.supports_insert_service() { provider.av_insert_service(av, node, service)? } else { None };
        let fi_addr = match via_service {
            Some(a) => a,
            None => {
                let numeric = hints.kind.accepts_numeric_host();
                let resolved = provider.get_info(hints, Some(node), Some(service), numeric)?;
                let raw = resolved
                    .raw_dest_addr
                    .ok_or_else(|| NaError::protocol("fi_getinfo", -1))?;
                provider.av_insert(av, &raw)?
            }
        };

        // Another writer may have raced in via a different code path (e.g.
        // the progress engine resolving the same peer from an unexpected
        // recv's header) and won between our two reads.
        if let Some(addr) = map.get(&key) {
            let _ = provider.av_remove(av, fi_addr);
            return Ok(addr.clone());
        }

        let uri = format!("{}://{node}:{service}", hints.kind.wire_name());
        let addr = AddressInner::new(fi_addr, uri, unexpected_generated, false);
        map.insert(key, addr.clone());
        log::debug!("address cache: inserted {key:#018x} -> {}", addr.uri);
        Ok(addr)
    }

    /// Drop every entry, called at domain teardown (§4.1).
    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::{BindDirection, MrMode, ProviderKind, WaitKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn hints() -> Hints {
        Hints {
            kind: ProviderKind::Sockets,
            mr_mode: MrMode::Scalable,
            directed_recv: true,
            source_reporting: false,
            auth_key: None,
        }
    }

    #[test]
    fn concurrent_lookups_of_the_same_peer_resolve_to_one_entry() {
        let provider = FakeProvider::new();
        let fabric = provider.open_fabric(&dummy_info()).unwrap();
        let domain = provider.open_domain(fabric, &dummy_info()).unwrap();
        let av = provider.open_av(domain, 8).unwrap();

        let server_info =
            provider.get_info(&hints(), Some("127.0.0.1"), Some("7890"), true).unwrap();
        let ep = provider.open_endpoint(domain, &server_info).unwrap();
        let cq = provider.open_cq(domain, 16, WaitKind::None).unwrap();
        provider.bind_cq(ep, cq, BindDirection::Both).unwrap();

        let cache = AddressCache::new();
        let key = ip_key(std::net::Ipv4Addr::new(127, 0, 0, 1), 7890);

        let hits = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            let barrier = Barrier::new(4);
            for _ in 0..4 {
                let cache = &cache;
                let provider = &provider;
                let barrier = &barrier;
                let hits = &hits;
                scope.spawn(move || {
                    barrier.wait();
                    let addr = cache
                        .lookup(provider, av, &hints(), key, "127.0.0.1", "7890", false)
                        .unwrap();
                    assert_eq!(addr.uri, "sockets://127.0.0.1:7890");
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn non_sockets_providers_skip_insert_service_and_use_the_fallback() {
        let provider = FakeProvider::new();
        let fabric = provider.open_fabric(&dummy_info()).unwrap();
        let domain = provider.open_domain(fabric, &dummy_info()).unwrap();
        let av = provider.open_av(domain, 8).unwrap();

        let verbs_hints = Hints {
            kind: ProviderKind::VerbsRxm,
            mr_mode: MrMode::Basic,
            directed_recv: false,
            source_reporting: false,
            auth_key: None,
        };
        let server_info =
            provider.get_info(&verbs_hints, Some("127.0.0.1"), Some("7891"), false).unwrap();
        let ep = provider.open_endpoint(domain, &server_info).unwrap();
        let cq = provider.open_cq(domain, 16, WaitKind::None).unwrap();
        provider.bind_cq(ep, cq, BindDirection::Both).unwrap();

        // `FakeProvider::av_insert_service` would error out for any
        // node:service it hasn't seen registered as a listener under that
        // exact key; since VerbsRxm never calls it, this must still resolve
        // through `get_info` + `av_insert` instead.
        let cache = AddressCache::new();
        let key = ip_key(std::net::Ipv4Addr::new(127, 0, 0, 1), 7891);
        let addr = cache
            .lookup(&provider, av, &verbs_hints, key, "127.0.0.1", "7891", false)
            .unwrap();
        assert_eq!(addr.uri, "verbs;ofi_rxm://127.0.0.1:7891");
        assert_eq!(cache.len(), 1);
    }

    fn dummy_info() -> crate::provider::ProviderInfo {
        crate::provider::ProviderInfo {
            kind: ProviderKind::Sockets,
            mr_mode: MrMode::Scalable,
            source_reporting: false,
            raw_dest_addr: None,
            bind_addr: None,
        }
    }
}
