//! Memory handle (§3): what `put`/`get` address their local and remote
//! sides with. Basic-MR mode registers each handle's region individually
//! and carries a real provider key; scalable mode shares the domain's
//! single `[0, u64::MAX)` region and the fixed [`SCALABLE_MR_KEY`].

use crate::error::{NaError, NaResult};
use crate::provider::{AccessFlags, DomainHandle, FabricProvider, MrHandle, MrMode, SCALABLE_MR_KEY};

const SERIALIZED_SIZE: usize = 8 + 8 + 1 + 8;

/// A registered (or deserialized, remote) memory region (§3).
#[derive(Debug, Clone)]
pub struct MemHandle {
    pub base: usize,
    pub size: usize,
    pub access: AccessFlags,
    pub is_remote: bool,
    pub key: u64,
    /// Only set for a locally registered basic-MR handle; `None` in
    /// scalable mode and always `None` once deserialized (§3).
    mr: Option<MrHandle>,
}

impl MemHandle {
    /// Register `[base, base+size)` with the domain's provider (§4.8). In
    /// scalable mode no provider call is made; the handle just carries the
    /// domain's predefined key.
    pub fn register(
        provider: &dyn FabricProvider,
        domain: DomainHandle,
        mr_mode: MrMode,
        base: *const u8,
        size: usize,
        access: AccessFlags,
    ) -> NaResult<MemHandle> {
        match mr_mode {
            MrMode::Scalable => Ok(MemHandle {
                base: base as usize,
                size,
                access,
                is_remote: false,
                key: SCALABLE_MR_KEY,
                mr: None,
            }),
            MrMode::Basic => {
                let mr = provider.reg_mr(domain, base, size, access, None)?;
                let key = provider.mr_key(mr);
                Ok(MemHandle { base: base as usize, size, access, is_remote: false, key, mr: Some(mr) })
            }
        }
    }

    /// The local iov descriptor to pass to `tsend`/`trecv`/`write`/`read`;
    /// `None` in scalable mode, where the provider doesn't need one.
    pub fn local_desc(&self, provider: &dyn FabricProvider) -> Option<crate::provider::LocalDesc> {
        self.mr.map(|mr| provider.mr_desc(mr))
    }

    pub fn close(&self, provider: &dyn FabricProvider) -> NaResult<()> {
        match self.mr {
            Some(mr) => provider.close_mr(mr),
            None => Ok(()),
        }
    }

    /// Flatten to the wire form consumed by the upper framework's bulk
    /// handle serialization (§1 Non-goals: that layer itself is out of
    /// scope, but the byte layout this handle round-trips through is ours).
    pub fn serialize(&self, buf: &mut [u8]) -> NaResult<()> {
        if buf.len() < SERIALIZED_SIZE {
            return Err(NaError::Size { expected: SERIALIZED_SIZE, actual: buf.len() });
        }
        buf[0..8].copy_from_slice(&(self.base as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&(self.size as u64).to_le_bytes());
        buf[16] = self.access.bits() as u8;
        buf[17..25].copy_from_slice(&self.key.to_le_bytes());
        Ok(())
    }

    /// Reconstruct a handle describing a peer's memory. Never allocates or
    /// registers anything locally; `is_remote` is always `true` (§8).
    pub fn deserialize(buf: &[u8]) -> NaResult<MemHandle> {
        if buf.len() < SERIALIZED_SIZE {
            return Err(NaError::Size { expected: SERIALIZED_SIZE, actual: buf.len() });
        }
        let base = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let size = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let access = AccessFlags::from_bits_truncate(buf[16] as u32);
        let key = u64::from_le_bytes(buf[17..25].try_into().unwrap());
        Ok(MemHandle { base, size, access, is_remote: true, key, mr: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::ProviderKind;

    fn domain() -> (FakeProvider, DomainHandle) {
        let provider = FakeProvider::new();
        let info = crate::provider::ProviderInfo {
            kind: ProviderKind::Sockets,
            mr_mode: MrMode::Scalable,
            source_reporting: false,
            raw_dest_addr: None,
            bind_addr: None,
        };
        let fabric = provider.open_fabric(&info).unwrap();
        let domain = provider.open_domain(fabric, &info).unwrap();
        (provider, domain)
    }

    #[test]
    fn basic_mode_registers_and_serializes_a_real_key() {
        let (provider, domain) = domain();
        let mut region = vec![0u8; 256];
        let handle = MemHandle::register(
            &provider,
            domain,
            MrMode::Basic,
            region.as_mut_ptr(),
            region.len(),
            AccessFlags::READ | AccessFlags::WRITE,
        )
        .unwrap();
        assert!(!handle.is_remote);
        assert!(handle.local_desc(&provider).is_some());

        let mut wire = vec![0u8; SERIALIZED_SIZE];
        handle.serialize(&mut wire).unwrap();
        let remote = MemHandle::deserialize(&wire).unwrap();
        assert_eq!(remote.base, handle.base);
        assert_eq!(remote.size, handle.size);
        assert_eq!(remote.access, handle.access);
        assert_eq!(remote.key, handle.key);
        assert!(remote.is_remote);
        assert!(remote.local_desc(&provider).is_none());
    }

    #[test]
    fn scalable_mode_uses_the_fixed_key_without_registering() {
        let (provider, domain) = domain();
        let mut region = vec![0u8; 64];
        let handle = MemHandle::register(
            &provider,
            domain,
            MrMode::Scalable,
            region.as_mut_ptr(),
            region.len(),
            AccessFlags::READ,
        )
        .unwrap();
        assert_eq!(handle.key, SCALABLE_MR_KEY);
        assert!(handle.local_desc(&provider).is_none());
    }

    #[test]
    fn deserialize_rejects_undersized_buffer() {
        let buf = vec![0u8; SERIALIZED_SIZE - 1];
        assert!(MemHandle::deserialize(&buf).is_err());
    }
}
