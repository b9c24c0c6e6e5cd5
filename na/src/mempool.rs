//! Registered-memory pool (§3, §4.6): blocks handed out to the messaging
//! layer for unexpected-send/recv buffers so posting never needs a
//! per-call memory registration in basic-MR mode.
//!
//! A pool owns one page-aligned, fixed-stride region. Rather than the
//! source's intrusive "node precedes payload" free list, blocks are
//! tracked by index in a `spin::Mutex<Vec<u32>>` — an O(1) push/pop free
//! list with the same locking granularity (§5: "per-pool free list:
//! spinlock") without requiring unsafe pointer-linked nodes for something
//! a plain index stack already gives us safely.

use std::alloc::Layout;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use parking_lot::RwLock;

use crate::error::{NaError, NaResult};
use crate::provider::{AccessFlags, DomainHandle, FabricProvider, MrHandle, MrMode};

/// Unexpected-message size ceiling (§8): a pool's fixed block size and the
/// largest single `alloc` this set will satisfy.
pub const UNEXPECTED_SIZE: usize = 4096;

const PAGE_SIZE: usize = 4096;
const BLOCKS_PER_POOL: usize = 256;

struct Pool {
    base: *mut u8,
    layout: Layout,
    block_size: usize,
    block_count: usize,
    mr: MrHandle,
    free_list: SpinMutex<Vec<u32>>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    fn create(
        provider: &dyn FabricProvider,
        domain: DomainHandle,
        mr_mode: MrMode,
        scalable_mr: Option<MrHandle>,
        block_size: usize,
        block_count: usize,
    ) -> NaResult<Pool> {
        let total = block_size.checked_mul(block_count).ok_or(NaError::OutOfMemory)?;
        let layout = Layout::from_size_align(total, PAGE_SIZE).map_err(|_| NaError::OutOfMemory)?;
        let base = unsafe { std::alloc::alloc(layout) };
        if base.is_null() {
            return Err(NaError::OutOfMemory);
        }

        let mr = match mr_mode {
            MrMode::Basic => {
                let access = AccessFlags::READ | AccessFlags::WRITE | AccessFlags::SEND | AccessFlags::RECV;
                match provider.reg_mr(domain, base, total, access, None) {
                    Ok(mr) => mr,
                    Err(e) => {
                        unsafe { std::alloc::dealloc(base, layout) };
                        return Err(e);
                    }
                }
            }
            MrMode::Scalable => scalable_mr
                .expect("scalable-mode pool creation always supplies the domain's global MR"),
        };

        log::debug!(
            "mempool: created pool of {block_count} x {block_size}-byte blocks ({total} bytes total)"
        );

        Ok(Pool {
            base,
            layout,
            block_size,
            block_count,
            mr,
            free_list: SpinMutex::new((0..block_count as u32).collect()),
        })
    }

    fn try_alloc(&self) -> Option<(*mut u8, MrHandle)> {
        let idx = self.free_list.lock().pop()?;
        let ptr = unsafe { self.base.add(idx as usize * self.block_size) };
        Some((ptr, self.mr))
    }

    /// Returns `true` if `ptr` belongs to this pool and was freed.
    fn try_free(&self, ptr: *mut u8) -> bool {
        let offset = match (ptr as usize).checked_sub(self.base as usize) {
            Some(o) if o < self.block_count * self.block_size => o,
            _ => return false,
        };
        if offset % self.block_size != 0 {
            return false;
        }
        self.free_list.lock().push((offset / self.block_size) as u32);
        true
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

/// The class-owned set of pools messaging buffers are drawn from (§4.6).
pub struct MemoryPoolSet {
    domain: DomainHandle,
    mr_mode: MrMode,
    scalable_mr: Option<MrHandle>,
    pools: RwLock<Vec<Arc<Pool>>>,
}

impl MemoryPoolSet {
    pub fn new(domain: DomainHandle, mr_mode: MrMode, scalable_mr: Option<MrHandle>) -> Self {
        MemoryPoolSet { domain, mr_mode, scalable_mr, pools: RwLock::new(Vec::new()) }
    }

    /// Hand out a `size`-byte block. Scans for a pool with a free slot;
    /// creates a new `UNEXPECTED_SIZE * 256`-block pool if none has room.
    pub fn alloc(&self, provider: &dyn FabricProvider, size: usize) -> NaResult<(*mut u8, MrHandle)> {
        if size > UNEXPECTED_SIZE {
            return Err(NaError::Size { expected: UNEXPECTED_SIZE, actual: size });
        }

        {
            let pools = self.pools.read();
            for pool in pools.iter() {
                if let Some(result) = pool.try_alloc() {
                    return Ok(result);
                }
            }
        }

        let mut pools = self.pools.write();
        for pool in pools.iter() {
            if let Some(result) = pool.try_alloc() {
                return Ok(result);
            }
        }
        let pool = Arc::new(Pool::create(
            provider,
            self.domain,
            self.mr_mode,
            self.scalable_mr,
            UNEXPECTED_SIZE,
            BLOCKS_PER_POOL,
        )?);
        let result = pool.try_alloc().expect("a freshly created pool always has free blocks");
        pools.push(pool);
        Ok(result)
    }

    /// Return a block previously handed out by `alloc`, identified by the
    /// MR handle its owning pool was registered under (§4.6).
    pub fn free(&self, ptr: *mut u8, mr: MrHandle) -> NaResult<()> {
        let pools = self.pools.read();
        for pool in pools.iter() {
            if pool.mr == mr && pool.try_free(ptr) {
                return Ok(());
            }
        }
        Err(NaError::InvalidParameter("free: pointer not owned by any pool in this set"))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::ProviderKind;

    fn provider_and_domain() -> (FakeProvider, DomainHandle) {
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
    fn alloc_creates_a_pool_lazily_and_reuses_it() {
        let (provider, domain) = provider_and_domain();
        let mr = provider.reg_mr(domain, std::ptr::null(), u64::MAX as usize, AccessFlags::all(), None).unwrap();
        let set = MemoryPoolSet::new(domain, MrMode::Scalable, Some(mr));
        assert_eq!(set.pool_count(), 0);
        let (ptr1, mr1) = set.alloc(&provider, 64).unwrap();
        assert_eq!(set.pool_count(), 1);
        let (ptr2, _) = set.alloc(&provider, 128).unwrap();
        assert_ne!(ptr1, ptr2);
        set.free(ptr1, mr1).unwrap();
        set.free(ptr2, mr1).unwrap();
        assert_eq!(set.pool_count(), 1);
    }

    #[test]
    fn alloc_rejects_oversized_request() {
        let (provider, domain) = provider_and_domain();
        let mr = provider.reg_mr(domain, std::ptr::null(), u64::MAX as usize, AccessFlags::all(), None).unwrap();
        let set = MemoryPoolSet::new(domain, MrMode::Scalable, Some(mr));
        assert!(set.alloc(&provider, UNEXPECTED_SIZE + 1).is_err());
    }

    #[test]
    fn free_of_foreign_pointer_fails() {
        let (provider, domain) = provider_and_domain();
        let mr = provider.reg_mr(domain, std::ptr::null(), u64::MAX as usize, AccessFlags::all(), None).unwrap();
        let set = MemoryPoolSet::new(domain, MrMode::Scalable, Some(mr));
        let mut stray = [0u8; 4];
        assert!(set.free(stray.as_mut_ptr(), mr).is_err());
    }
}
