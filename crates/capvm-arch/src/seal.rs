//! Sealing keys and sealed-object stores
//!
//! A sealed capability is an opaque token: it cannot be dereferenced or
//! modified, and only the holder of the key whose object type it carries can
//! turn it back into a usable capability. [`TokenStore`] pairs a key with a
//! table of host-side payloads, giving the `token_sealed_unsealed_alloc`
//! pattern: allocate some memory, hand out only its sealed capability, and
//! recover the payload later by unsealing.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;

use crate::alloc::{AllocError, Allocator};
use crate::capability::Capability;
use crate::perms::Permissions;

static NEXT_OTYPE: AtomicU32 = AtomicU32::new(1);

/// Authority to seal and unseal one object type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SealingKey(Capability);

impl SealingKey {
    /// Mints a key for a fresh object type.
    pub fn new() -> Self {
        let otype = NEXT_OTYPE.fetch_add(1, Ordering::Relaxed);
        SealingKey(Capability::root(otype, 1, Permissions::SEALING))
    }

    pub fn otype(&self) -> u32 {
        self.0.address()
    }

    pub fn capability(&self) -> Capability {
        self.0
    }

    /// Seals `cap`. Sealing an untagged or already sealed capability gives
    /// an untagged result.
    pub fn seal(&self, cap: Capability) -> Capability {
        let sealed = cap.seal_with(self.otype());
        if !cap.is_tagged() || cap.is_sealed() || !self.0.perms().contains(Permissions::SEAL) {
            return sealed.untagged();
        }
        sealed
    }

    /// Unseals `cap` if it is a valid token of this key's type.
    pub fn unseal(&self, cap: Capability) -> Option<Capability> {
        (cap.is_tagged()
            && cap.otype() == self.otype()
            && self.0.perms().contains(Permissions::UNSEAL))
        .then(|| cap.unsealed())
    }
}

impl Default for SealingKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealingKey(otype {})", self.otype())
    }
}

/// Sealed object handle, an opaque token handed across a boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SObj(Capability);

impl SObj {
    /// A handle that never validates.
    pub const INVALID: SObj = SObj(Capability::NULL);

    /// Wraps an arbitrary capability as a handle. The result only validates
    /// if the capability really is a live token of the store it is shown to.
    pub const fn from_capability(cap: Capability) -> Self {
        SObj(cap)
    }

    pub fn capability(&self) -> Capability {
        self.0
    }

    /// Whether the handle is tagged at all; says nothing about which store
    /// it belongs to.
    pub fn is_valid(&self) -> bool {
        self.0.is_tagged() && self.0.is_sealed()
    }
}

impl fmt::Debug for SObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SObj({:?})", self.0)
    }
}

struct Entry<T> {
    backing: Capability,
    value: T,
}

/// A sealing key plus the payloads of every token it has issued.
pub struct TokenStore<T> {
    key: SealingKey,
    allocator: Allocator,
    objects: FxHashMap<u32, Entry<T>>,
}

impl<T> TokenStore<T> {
    pub fn new(key: SealingKey, allocator: Allocator) -> Self {
        TokenStore {
            key,
            allocator,
            objects: FxHashMap::default(),
        }
    }

    pub fn key(&self) -> SealingKey {
        self.key
    }

    /// Allocates `size` bytes of backing storage, records `value` against it
    /// and returns the sealed token.
    pub fn alloc(&mut self, size: u32, value: T) -> Result<SObj, AllocError> {
        let backing = self.allocator.alloc(size)?;
        self.objects.insert(backing.base(), Entry { backing, value });
        Ok(SObj(self.key.seal(backing)))
    }

    fn resolve(&self, token: SObj) -> Option<u32> {
        let cap = self.key.unseal(self.allocator.load_filter(token.0))?;
        let entry = self.objects.get(&cap.base())?;
        (entry.backing.length() == cap.length() && self.allocator.is_live(&entry.backing))
            .then_some(cap.base())
    }

    pub fn contains(&self, token: SObj) -> bool {
        self.resolve(token).is_some()
    }

    pub fn unseal(&self, token: SObj) -> Option<&T> {
        let base = self.resolve(token)?;
        self.objects.get(&base).map(|e| &e.value)
    }

    pub fn unseal_mut(&mut self, token: SObj) -> Option<&mut T> {
        let base = self.resolve(token)?;
        self.objects.get_mut(&base).map(|e| &mut e.value)
    }

    /// The unsealed backing capability of a live token.
    pub fn backing(&self, token: SObj) -> Option<Capability> {
        let base = self.resolve(token)?;
        self.objects.get(&base).map(|e| e.backing)
    }

    /// Invalidates `token`, releases its storage and hands back the payload.
    pub fn destroy(&mut self, token: SObj) -> Option<T> {
        let base = self.resolve(token)?;
        let entry = self.objects.remove(&base)?;
        if let Err(err) = self.allocator.free(entry.backing) {
            log::warn!("token storage release failed: {}", err);
        }
        Some(entry.value)
    }

    /// Live tokens, in no particular order.
    pub fn len(&self) -> usize {
        self.objects
            .values()
            .filter(|e| self.allocator.is_live(&e.backing))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
