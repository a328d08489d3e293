//! Quota-limited heap allocator
//!
//! Allocations are carved from one process-wide simulated address space and
//! addresses are never reused, so a stale capability can always be told
//! apart from a fresh one. Each [`Allocator`] is a cheap cloneable handle
//! onto one quota.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::capability::Capability;
use crate::mem;
use crate::perms::Permissions;

/// Allocation granule.
pub const ALLOC_ALIGN: u32 = 8;

const HEAP_SPACE_START: u32 = 0x8000_0000;
const HEAP_SPACE_END: u32 = 0xf000_0000;

static NEXT_HEAP_ADDRESS: AtomicU32 = AtomicU32::new(HEAP_SPACE_START);

/// Allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u32, available: u32 },

    #[error("zero-sized allocation")]
    ZeroSize,

    #[error("address space exhausted")]
    AddressSpaceExhausted,

    #[error("capability {0} does not denote a live allocation")]
    InvalidFree(u32),
}

/// Rounds `size` up to the allocation granule.
pub fn round_up(size: u32) -> u32 {
    size.div_ceil(ALLOC_ALIGN).saturating_mul(ALLOC_ALIGN)
}

fn reserve_heap_range(size: u32) -> Result<u32, AllocError> {
    NEXT_HEAP_ADDRESS
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
            next.checked_add(size).filter(|end| *end <= HEAP_SPACE_END)
        })
        .map_err(|_| AllocError::AddressSpaceExhausted)
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    length: u32,
    live: bool,
}

#[derive(Debug)]
struct AllocatorState {
    quota: u32,
    used: u32,
    peak: u32,
    /// Every allocation ever made, keyed by base. Freed entries stay so the
    /// load filter can recognise capabilities to released memory.
    allocations: BTreeMap<u32, Allocation>,
}

impl AllocatorState {
    fn containing(&self, address: u32) -> Option<(u32, Allocation)> {
        let (&base, &allocation) = self.allocations.range(..=address).next_back()?;
        (u64::from(address) < u64::from(base) + u64::from(allocation.length.max(1)))
            .then_some((base, allocation))
    }
}

/// Handle onto one allocation quota.
#[derive(Debug, Clone)]
pub struct Allocator {
    state: Rc<RefCell<AllocatorState>>,
}

impl Allocator {
    pub fn with_quota(quota: u32) -> Self {
        Allocator {
            state: Rc::new(RefCell::new(AllocatorState {
                quota,
                used: 0,
                peak: 0,
                allocations: BTreeMap::new(),
            })),
        }
    }

    /// Allocates `size` bytes and returns a read-write capability bounded to
    /// exactly that size.
    pub fn alloc(&self, size: u32) -> Result<Capability, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let mut state = self.state.borrow_mut();
        let rounded = round_up(size);
        let available = state.quota - state.used;
        if rounded > available {
            log::debug!("allocation of {} bytes refused ({} available)", size, available);
            return Err(AllocError::QuotaExceeded {
                requested: size,
                available,
            });
        }
        let base = reserve_heap_range(rounded)?;
        state.allocations.insert(base, Allocation { length: size, live: true });
        state.used += rounded;
        state.peak = state.peak.max(state.used);
        Ok(Capability::root(base, size, Permissions::DATA))
    }

    /// Releases the allocation `cap` denotes. `cap` must carry the complete
    /// bounds of a live allocation.
    pub fn free(&self, cap: Capability) -> Result<(), AllocError> {
        let mut state = self.state.borrow_mut();
        let valid = cap.is_tagged()
            && state
                .allocations
                .get(&cap.base())
                .is_some_and(|a| a.live && a.length == cap.length());
        if !valid {
            return Err(AllocError::InvalidFree(cap.address()));
        }
        if let Some(allocation) = state.allocations.get_mut(&cap.base()) {
            allocation.live = false;
        }
        state.used -= round_up(cap.length());
        mem::release(cap.base(), cap.length());
        Ok(())
    }

    /// Releases everything; returns how many allocations were live.
    pub fn free_all(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let mut released = 0;
        for (base, allocation) in state.allocations.iter_mut().filter(|(_, a)| a.live) {
            allocation.live = false;
            mem::release(*base, allocation.length);
            released += 1;
        }
        state.used = 0;
        released
    }

    /// Whether `cap` points into memory this allocator still holds.
    pub fn is_live(&self, cap: &Capability) -> bool {
        cap.is_tagged()
            && self
                .state
                .borrow()
                .containing(cap.base())
                .is_some_and(|(_, a)| a.live)
    }

    /// Strips the tag from capabilities into memory this allocator has
    /// released. Capabilities it never issued pass through.
    pub fn load_filter(&self, cap: Capability) -> Capability {
        if !cap.is_tagged() {
            return cap;
        }
        match self.state.borrow().containing(cap.base()) {
            Some((_, allocation)) if !allocation.live => cap.untagged(),
            _ => cap,
        }
    }

    pub fn quota(&self) -> u32 {
        self.state.borrow().quota
    }

    /// Bytes currently charged against the quota.
    pub fn used(&self) -> u32 {
        self.state.borrow().used
    }

    pub fn available(&self) -> u32 {
        let state = self.state.borrow();
        state.quota - state.used
    }

    pub fn peak(&self) -> u32 {
        self.state.borrow().peak
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().allocations.values().filter(|a| a.live).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_bounded_and_charged() {
        let heap = Allocator::with_quota(128);
        let cap = heap.alloc(10).unwrap();
        assert!(cap.is_tagged());
        assert_eq!(cap.length(), 10);
        assert_eq!(heap.used(), 16);
        assert_eq!(heap.live_allocations(), 1);
    }

    #[test]
    fn test_quota_refusal_leaves_state_untouched() {
        let heap = Allocator::with_quota(64);
        heap.alloc(40).unwrap();
        let err = heap.alloc(40).unwrap_err();
        assert!(matches!(err, AllocError::QuotaExceeded { requested: 40, .. }));
        assert_eq!(heap.used(), 40);
        assert_eq!(heap.live_allocations(), 1);
    }

    #[test]
    fn test_free_requires_exact_live_allocation() {
        let heap = Allocator::with_quota(256);
        let cap = heap.alloc(32).unwrap();
        assert!(heap.free(cap.offset(8).bounded(8)).is_err());
        heap.free(cap).unwrap();
        assert_eq!(heap.free(cap), Err(AllocError::InvalidFree(cap.address())));
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_load_filter_revokes_freed_memory() {
        let heap = Allocator::with_quota(256);
        let cap = heap.alloc(32).unwrap();
        let inner = cap.offset(4);
        assert!(heap.load_filter(inner).is_tagged());
        heap.free(cap).unwrap();
        assert!(!heap.load_filter(inner).is_tagged());
        assert!(!heap.is_live(&cap));
    }

    #[test]
    fn test_free_all() {
        let heap = Allocator::with_quota(256);
        let a = heap.alloc(8).unwrap();
        heap.alloc(8).unwrap();
        assert_eq!(heap.free_all(), 2);
        assert_eq!(heap.used(), 0);
        assert!(!heap.is_live(&a));
    }

    #[test]
    fn test_addresses_are_not_reused() {
        let heap = Allocator::with_quota(64);
        let a = heap.alloc(8).unwrap();
        heap.free(a).unwrap();
        let b = heap.alloc(8).unwrap();
        assert_ne!(a.base(), b.base());
    }
}
