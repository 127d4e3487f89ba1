//! Simulated user address spaces
//!
//! Paged, copy-on-write user memory for hosts without an MMU of their own.
//! Memory is only reachable inside defined regions; pages inside a region
//! are materialized lazily and read as zero until written.
//!
//! Forking shares every page between parent and child. A write through
//! either side copies the page first, so the two spaces never observe each
//! other's stores.

use super::usermem::{AddressSpace, AddressSpaceFactory, Fault, OutOfMemory, UserPtr};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Page size for COW operations (4KB, matching typical page sizes)
pub const PAGE_SIZE: usize = 4096;

/// One past the highest stack address
pub const USER_STACK_TOP: u64 = 0x8000_0000;

/// Pages reserved for the user stack
pub const STACK_PAGES: u64 = 18;

/// A page that can be shared between address spaces via COW
#[derive(Debug, Clone)]
struct Page {
    data: Arc<Vec<u8>>,
}

impl Page {
    fn new() -> Self {
        Self {
            data: Arc::new(vec![0u8; PAGE_SIZE]),
        }
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
    }

    /// Write, copying the page first if it is shared
    fn write(&mut self, offset: usize, buf: &[u8]) {
        Arc::make_mut(&mut self.data)[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

/// Knobs and counters shared by every space from one factory
#[derive(Debug, Default)]
pub struct SpaceKnobs {
    fail_creates: AtomicBool,
    fail_clones: AtomicBool,
    live: AtomicUsize,
    activations: AtomicU64,
}

impl SpaceKnobs {
    /// Make every following `create` fail
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every following `try_clone` fail
    pub fn set_fail_clones(&self, fail: bool) {
        self.fail_clones.store(fail, Ordering::SeqCst);
    }

    /// Spaces currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }
}

/// A simulated user address space
#[derive(Debug)]
pub struct SimAddressSpace {
    /// Mapped `[start, end)` ranges
    regions: Vec<(u64, u64)>,
    pages: BTreeMap<u64, Page>,
    knobs: Arc<SpaceKnobs>,
}

impl SimAddressSpace {
    /// A standalone space with its own counters
    pub fn new() -> Self {
        Self::with_knobs(Arc::new(SpaceKnobs::default()))
    }

    fn with_knobs(knobs: Arc<SpaceKnobs>) -> Self {
        knobs.live.fetch_add(1, Ordering::SeqCst);
        Self {
            regions: Vec::new(),
            pages: BTreeMap::new(),
            knobs,
        }
    }

    fn is_mapped(&self, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.regions
            .iter()
            .any(|&(start, stop)| addr >= start && end <= stop)
    }

    fn check(&self, addr: UserPtr, len: usize) -> Result<(), Fault> {
        if len == 0 || self.is_mapped(addr.0, len as u64) {
            Ok(())
        } else {
            Err(Fault { addr: addr.0 })
        }
    }

    /// Pages currently shared with another space
    pub fn shared_pages(&self) -> usize {
        self.pages.values().filter(|p| p.is_shared()).count()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Default for SimAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimAddressSpace {
    fn drop(&mut self) {
        self.knobs.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AddressSpace for SimAddressSpace {
    fn copy_in(&self, src: UserPtr, buf: &mut [u8]) -> Result<(), Fault> {
        self.check(src, buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            let addr = src.0 + done as u64;
            let page_no = addr / PAGE_SIZE as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);

            match self.pages.get(&page_no) {
                Some(page) => page.read(offset, &mut buf[done..done + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn copy_out(&mut self, buf: &[u8], dst: UserPtr) -> Result<(), Fault> {
        self.check(dst, buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            let addr = dst.0 + done as u64;
            let page_no = addr / PAGE_SIZE as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);

            self.pages
                .entry(page_no)
                .or_insert_with(Page::new)
                .write(offset, &buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn define_region(&mut self, base: UserPtr, len: u64) -> Result<(), OutOfMemory> {
        let end = base.0.checked_add(len).ok_or(OutOfMemory)?;
        self.regions.push((base.0, end));
        Ok(())
    }

    fn define_stack(&mut self) -> Result<UserPtr, OutOfMemory> {
        let size = STACK_PAGES * PAGE_SIZE as u64;
        self.define_region(UserPtr(USER_STACK_TOP - size), size)?;
        Ok(UserPtr(USER_STACK_TOP))
    }

    fn try_clone(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory> {
        if self.knobs.fail_clones.load(Ordering::SeqCst) {
            return Err(OutOfMemory);
        }
        let mut child = SimAddressSpace::with_knobs(Arc::clone(&self.knobs));
        child.regions = self.regions.clone();
        // Arc clones: pages are shared until written
        child.pages = self.pages.clone();
        Ok(Box::new(child))
    }

    fn activate(&self) {
        self.knobs.activations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory for [`SimAddressSpace`]
#[derive(Debug, Clone, Default)]
pub struct SimSpaces {
    knobs: Arc<SpaceKnobs>,
}

impl SimSpaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knobs(&self) -> &Arc<SpaceKnobs> {
        &self.knobs
    }

    /// A concrete space tied to this factory's counters
    pub fn create_sim(&self) -> SimAddressSpace {
        SimAddressSpace::with_knobs(Arc::clone(&self.knobs))
    }
}

impl AddressSpaceFactory for SimSpaces {
    fn create(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory> {
        if self.knobs.fail_creates.load(Ordering::SeqCst) {
            return Err(OutOfMemory);
        }
        Ok(Box::new(self.create_sim()))
    }
}
