//! Domain lifecycle (§3, §4.1): the process-wide handle to a provider +
//! fabric + address vector + (scalable mode) global memory region, shared
//! by every endpoint opened against the same provider and device.
//!
//! The "at most one domain per (provider, device) tuple, refcounted,
//! removed from the registry at zero" invariant (§3) is realized directly
//! by `Arc<Domain>` strong-count semantics plus a `Drop` impl that removes
//! the registry entry — no separate refcount field is needed (§9, "global
//! mutable state").

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::addr::AddressCache;
use crate::config::Config;
use crate::error::{NaError, NaResult};
use crate::mempool::MemoryPoolSet;
use crate::provider::{
    AccessFlags, AvHandle, DomainHandle, FabricHandle, FabricProvider, Hints, MrHandle, MrMode,
    ProviderInfo, ProviderKind, RX_CTX_BITS, SCALABLE_MR_KEY,
};

/// `(provider instance identity, provider kind, device name)`. The
/// provider's data pointer disambiguates independent provider instances
/// (as used by concurrently-running tests against distinct `FakeProvider`s)
/// the way a single real libfabric provider instance per process wouldn't
/// need to.
type RegistryKey = (usize, ProviderKind, String);

fn registry() -> &'static Mutex<HashMap<RegistryKey, Weak<Domain>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Weak<Domain>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn provider_identity(provider: &Arc<dyn FabricProvider>) -> usize {
    Arc::as_ptr(provider) as *const () as usize
}

pub struct Domain {
    pub kind: ProviderKind,
    pub device_name: String,
    pub provider: Arc<dyn FabricProvider>,
    pub hints: Hints,
    pub info: ProviderInfo,
    pub fabric: FabricHandle,
    pub domain: DomainHandle,
    pub av: AvHandle,
    pub scalable_mr: Option<MrHandle>,
    pub addr_cache: AddressCache,
    pub pools: MemoryPoolSet,
    /// Guards address-vector mutation on providers whose AV isn't
    /// internally thread-safe (PSM2, §5); `None` elsewhere, where it's a
    /// no-op.
    av_lock: Option<Mutex<()>>,
    registry_key: RegistryKey,
}

impl Domain {
    /// Open (or join the refcount of) the domain for `config`'s provider
    /// and `device_name` (§4.1).
    pub fn open(
        provider: Arc<dyn FabricProvider>,
        config: &Config,
        device_name: &str,
    ) -> NaResult<Arc<Domain>> {
        let key: RegistryKey = (provider_identity(&provider), config.kind, device_name.to_string());

        {
            let reg = registry().lock();
            if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
                log::debug!(
                    "domain: joining existing domain for {:?}/{device_name}",
                    config.kind
                );
                return Ok(existing);
            }
        }

        if config.kind == ProviderKind::Gni && std::env::var_os("MPICH_GNI_NDREG_ENTRIES").is_none() {
            log::error!(
                "ofi+gni provider requested, but the MPICH_GNI_NDREG_ENTRIES environment \
                 variable is not set. Please run this executable with \
                 \"export MPICH_GNI_NDREG_ENTRIES=2000\" to ensure compatibility."
            );
            return Err(NaError::protocol("na_ofi_initialize", -1));
        }

        let hints = hints_for(config);
        let numeric_host = config.kind.accepts_numeric_host();
        let info = provider.get_info(
            &hints,
            config.host.as_deref(),
            config.service.as_deref(),
            numeric_host,
        )?;

        let fabric = provider.open_fabric(&info)?;
        let domain_handle = provider.open_domain(fabric, &info)?;

        let scalable_mr = if info.mr_mode == MrMode::Scalable {
            let access =
                AccessFlags::READ | AccessFlags::WRITE | AccessFlags::SEND | AccessFlags::RECV;
            Some(provider.reg_mr(
                domain_handle,
                std::ptr::null(),
                usize::MAX,
                access,
                Some(SCALABLE_MR_KEY),
            )?)
        } else {
            None
        };

        let av = provider.open_av(domain_handle, RX_CTX_BITS as u8)?;

        if config.kind == ProviderKind::Gni {
            log::debug!(
                "domain: gni selected; external MR cache with lazy deregistration assumed to be \
                 configured via the provider's environment"
            );
        }

        let domain = Arc::new(Domain {
            kind: config.kind,
            device_name: device_name.to_string(),
            provider: provider.clone(),
            hints,
            info: info.clone(),
            fabric,
            domain: domain_handle,
            av,
            scalable_mr,
            addr_cache: AddressCache::new(),
            pools: MemoryPoolSet::new(domain_handle, info.mr_mode, scalable_mr),
            av_lock: if config.kind.needs_av_lock() { Some(Mutex::new(())) } else { None },
            registry_key: key.clone(),
        });

        registry().lock().insert(key, Arc::downgrade(&domain));
        log::debug!("domain: opened new domain for {:?}/{device_name}", config.kind);
        Ok(domain)
    }

    /// Run `f` with the provider's AV-mutation lock held, a no-op on
    /// providers with a thread-safe AV (§5).
    pub fn with_av_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.av_lock {
            Some(lock) => {
                let _guard = lock.lock();
                f()
            }
            None => f(),
        }
    }

    /// `true` when the provider can't combine a wait object with manual
    /// progress for these capabilities and must run its own progress
    /// thread instead (§4.1). Only GNI is modeled as requiring this.
    pub fn no_wait(&self) -> bool {
        self.kind == ProviderKind::Gni
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        log::debug!("domain: closing {:?}/{}", self.kind, self.device_name);
        registry().lock().remove(&self.registry_key);
        self.addr_cache.clear();
        if let Some(mr) = self.scalable_mr {
            if let Err(e) = self.provider.close_mr(mr) {
                log::warn!("domain: failed to close scalable MR: {e}");
            }
        }
        if let Err(e) = self.provider.close_av(self.av) {
            log::warn!("domain: failed to close address vector: {e}");
        }
        if let Err(e) = self.provider.close_domain(self.domain) {
            log::warn!("domain: failed to close domain: {e}");
        }
        if let Err(e) = self.provider.close_fabric(self.fabric) {
            log::warn!("domain: failed to close fabric: {e}");
        }
    }
}

/// Per-provider hints (§4.1): capabilities and MR mode vary by backend,
/// everything else is shared.
fn hints_for(config: &Config) -> Hints {
    let (mr_mode, directed_recv, source_reporting) = match config.kind {
        ProviderKind::Sockets => (MrMode::Scalable, true, false),
        ProviderKind::VerbsRxm => (MrMode::Basic, false, false),
        ProviderKind::Psm2 => (MrMode::Basic, false, true),
        ProviderKind::Gni => (MrMode::Basic, false, false),
    };
    Hints { kind: config.kind, mr_mode, directed_recv, source_reporting, auth_key: config.auth_key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressMode;
    use crate::provider::fake::FakeProvider;

    fn config(host: &str) -> Config {
        Config::parse("tcp", Some(host), ProgressMode::Auto, 4, None).unwrap()
    }

    #[test]
    fn opening_the_same_provider_device_twice_joins_the_existing_domain() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = config("127.0.0.1:7890");
        let first = Domain::open(provider.clone(), &cfg, "dev0").unwrap();
        let second = Domain::open(provider.clone(), &cfg, "dev0").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(Arc::strong_count(&first), 2);
    }

    #[test]
    fn distinct_devices_get_distinct_domains() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = config("127.0.0.1:7890");
        let first = Domain::open(provider.clone(), &cfg, "dev0").unwrap();
        let second = Domain::open(provider.clone(), &cfg, "dev1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn gni_without_the_ndreg_env_var_fails_before_any_provider_call() {
        // Serialize against the process-global env var; no other test in
        // this crate touches it.
        static LOCK: Mutex<()> = Mutex::new(());
        let _guard = LOCK.lock();

        std::env::remove_var("MPICH_GNI_NDREG_ENTRIES");
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = Config::parse("gni", Some("127.0.0.1:7893"), ProgressMode::Auto, 1, None).unwrap();
        assert!(matches!(Domain::open(provider, &cfg, "dev0"), Err(NaError::Protocol { .. })));

        std::env::set_var("MPICH_GNI_NDREG_ENTRIES", "2000");
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        assert!(Domain::open(provider, &cfg, "dev0").is_ok());
        std::env::remove_var("MPICH_GNI_NDREG_ENTRIES");
    }

    #[test]
    fn domain_is_removed_from_registry_once_last_reference_drops() {
        let provider: Arc<dyn FabricProvider> = Arc::new(FakeProvider::new());
        let cfg = config("127.0.0.1:7890");
        let key: RegistryKey = (provider_identity(&provider), cfg.kind, "dev0".to_string());
        {
            let domain = Domain::open(provider.clone(), &cfg, "dev0").unwrap();
            assert!(registry().lock().get(&key).is_some());
            drop(domain);
        }
        assert!(registry().lock().get(&key).and_then(Weak::upgrade).is_none());
    }
}
