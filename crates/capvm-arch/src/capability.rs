//! Hardware capabilities
//!
//! A [`Capability`] is address + bounds + permissions + object type + tag.
//! Nothing in this module can widen bounds, add permissions, or set a tag
//! that was clear: new authority only comes from the root minting helpers
//! used by the allocator, the boot code and the sealing key.

use std::fmt;

use crate::cause::CapFault;
use crate::perms::Permissions;

/// Size of a capability's in-register representation.
pub const CAP_BYTES: usize = 16;

/// Object type of an unsealed capability.
pub const OTYPE_UNSEALED: u32 = 0;

/// A CHERI capability.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    address: u32,
    base: u32,
    length: u32,
    perms: Permissions,
    otype: u32,
    tag: bool,
}

impl Capability {
    /// The null capability: untagged, zero everything.
    pub const NULL: Capability = Capability {
        address: 0,
        base: 0,
        length: 0,
        perms: Permissions::empty(),
        otype: OTYPE_UNSEALED,
        tag: false,
    };

    /// An integer-derived capability: carries an address and no authority.
    pub const fn from_address(address: u32) -> Self {
        Capability {
            address,
            ..Self::NULL
        }
    }

    /// Mints a tagged capability. Only trusted roots call this.
    pub(crate) const fn root(base: u32, length: u32, perms: Permissions) -> Self {
        Capability {
            address: base,
            base,
            length,
            perms,
            otype: OTYPE_UNSEALED,
            tag: true,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// One past the last accessible byte.
    pub fn top(&self) -> u64 {
        u64::from(self.base) + u64::from(self.length)
    }

    pub fn perms(&self) -> Permissions {
        self.perms
    }

    pub fn otype(&self) -> u32 {
        self.otype
    }

    pub fn is_tagged(&self) -> bool {
        self.tag
    }

    pub fn is_sealed(&self) -> bool {
        self.otype != OTYPE_UNSEALED
    }

    /// Whether `address` lies within `[base, top]`.
    fn representable(&self, address: u32) -> bool {
        address >= self.base && u64::from(address) <= self.top()
    }

    /// Replaces the address. Moving a sealed capability, or moving outside
    /// the representable range, clears the tag.
    #[must_use]
    pub fn with_address(self, address: u32) -> Self {
        let mut out = self;
        out.address = address;
        if self.is_sealed() || !self.representable(address) {
            out.tag = false;
        }
        out
    }

    /// Pointer arithmetic on the address.
    #[must_use]
    pub fn offset(self, delta: i64) -> Self {
        let address = (i64::from(self.address)).wrapping_add(delta) as u32;
        self.with_address(address)
    }

    /// Intersects the permission set with `mask`.
    #[must_use]
    pub fn restrict(self, mask: Permissions) -> Self {
        let mut out = self;
        out.perms = self.perms & mask;
        if self.is_sealed() {
            out.tag = false;
        }
        out
    }

    /// Narrows the bounds to `[address, address + length)`.
    #[must_use]
    pub fn bounded(self, length: u32) -> Self {
        let top = u64::from(self.address) + u64::from(length);
        let mut out = self;
        out.base = self.address;
        out.length = length;
        if self.is_sealed() || self.address < self.base || top > self.top() {
            out.tag = false;
        }
        out
    }

    /// Validates an access of `size` bytes at `address + offset` and returns
    /// the effective address.
    pub fn check(&self, required: Permissions, offset: u32, size: u32) -> Result<u32, CapFault> {
        if !self.tag {
            return Err(CapFault::Tag);
        }
        if self.is_sealed() {
            return Err(CapFault::Seal);
        }
        if let Some(missing) = (required - self.perms).iter().next() {
            return Err(missing_permission_fault(missing));
        }
        let address = self.address.wrapping_add(offset);
        if address < self.base || u64::from(address) + u64::from(size) > self.top() {
            return Err(CapFault::Bounds);
        }
        Ok(address)
    }

    /// Same bits, tag cleared.
    #[must_use]
    pub fn untagged(self) -> Self {
        let mut out = self;
        out.tag = false;
        out
    }

    pub(crate) fn seal_with(self, otype: u32) -> Self {
        let mut out = self;
        out.otype = otype;
        out
    }

    pub(crate) fn unsealed(self) -> Self {
        let mut out = self;
        out.otype = OTYPE_UNSEALED;
        out
    }

    /// The in-register representation. The tag lives outside these bytes.
    pub fn to_bytes(&self) -> [u8; CAP_BYTES] {
        let mut bytes = [0u8; CAP_BYTES];
        bytes[0..4].copy_from_slice(&self.address.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.base.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.perms.bits().to_le_bytes());
        bytes[14..16].copy_from_slice(&(self.otype as u16).to_le_bytes());
        bytes
    }

    /// Rebuilds a capability from its byte image. The result is untagged:
    /// plain data can never become authority.
    pub fn from_bytes(bytes: &[u8; CAP_BYTES]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Capability {
            address: word(0),
            base: word(4),
            length: word(8),
            perms: Permissions::from_bits_truncate(u16::from_le_bytes([bytes[12], bytes[13]])),
            otype: u32::from(u16::from_le_bytes([bytes[14], bytes[15]])),
            tag: false,
        }
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::NULL
    }
}

fn missing_permission_fault(missing: Permissions) -> CapFault {
    if missing.contains(Permissions::EXECUTE) {
        CapFault::PermitExecute
    } else if missing.contains(Permissions::LOAD) {
        CapFault::PermitLoad
    } else if missing.contains(Permissions::STORE) {
        CapFault::PermitStore
    } else if missing.contains(Permissions::LOAD_STORE_CAP) {
        CapFault::PermitStoreCap
    } else if missing.contains(Permissions::STORE_LOCAL) {
        CapFault::PermitStoreLocal
    } else if missing.contains(Permissions::ACCESS_SYSTEM_REGISTERS) {
        CapFault::PermitSystemRegisters
    } else {
        CapFault::Seal
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.address)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08x} (v:{} 0x{:08x}-0x{:08x} l:0x{:x} o:0x{:x} p:{:#05x})",
            self.address,
            u8::from(self.tag),
            self.base,
            self.top(),
            self.length,
            self.otype,
            self.perms.bits()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(base: u32, length: u32) -> Capability {
        Capability::root(base, length, Permissions::DATA)
    }

    #[test]
    fn test_null_is_untagged() {
        assert!(!Capability::NULL.is_tagged());
        assert_eq!(Capability::default(), Capability::NULL);
        assert!(!Capability::from_address(0x1234).is_tagged());
    }

    #[test]
    fn test_address_moves_within_bounds_keep_tag() {
        let cap = data(0x1000, 0x100);
        assert!(cap.offset(0x80).is_tagged());
        assert!(cap.with_address(0x1100).is_tagged()); // one past the end
        assert!(!cap.offset(0x101).is_tagged());
        assert!(!cap.offset(-1).is_tagged());
    }

    #[test]
    fn test_bounded_cannot_widen() {
        let cap = data(0x1000, 0x100);
        let narrow = cap.offset(0x10).bounded(0x20);
        assert!(narrow.is_tagged());
        assert_eq!(narrow.base(), 0x1010);
        assert_eq!(narrow.length(), 0x20);
        assert!(!narrow.bounded(0x40).is_tagged());
    }

    #[test]
    fn test_restrict_only_clears() {
        let cap = data(0x1000, 0x10).restrict(!Permissions::STORE);
        assert!(cap.is_tagged());
        assert_eq!(cap.check(Permissions::STORE, 0, 1), Err(CapFault::PermitStore));
        assert_eq!(cap.check(Permissions::LOAD, 0, 4), Ok(0x1000));
    }

    #[test]
    fn test_check_order_and_codes() {
        let cap = data(0x2000, 8);
        assert_eq!(cap.check(Permissions::LOAD, 8, 1), Err(CapFault::Bounds));
        assert_eq!(cap.check(Permissions::LOAD, 4, 4), Ok(0x2004));
        assert_eq!(cap.check(Permissions::EXECUTE, 0, 4), Err(CapFault::PermitExecute));
        let untagged = cap.with_address(0x3000);
        assert_eq!(untagged.check(Permissions::LOAD, 0, 1), Err(CapFault::Tag));
        let sealed = cap.seal_with(7);
        assert_eq!(sealed.check(Permissions::LOAD, 0, 1), Err(CapFault::Seal));
    }

    #[test]
    fn test_sealed_capability_is_immutable() {
        let sealed = data(0x1000, 0x10).seal_with(3);
        assert!(sealed.is_tagged());
        assert!(!sealed.offset(1).is_tagged());
        assert!(!sealed.restrict(Permissions::LOAD).is_tagged());
        assert!(!sealed.bounded(1).is_tagged());
    }

    #[test]
    fn test_bytes_preserve_metadata_but_not_tag() {
        let cap = data(0x4000, 0x40).offset(0x8);
        let back = Capability::from_bytes(&cap.to_bytes());
        assert_eq!(back.address(), cap.address());
        assert_eq!(back.base(), cap.base());
        assert_eq!(back.length(), cap.length());
        assert_eq!(back.perms(), cap.perms());
        assert!(!back.is_tagged());
    }

    #[test]
    fn test_display_is_pointer_format() {
        assert_eq!(data(0xbeef, 1).to_string(), "0x0000beef");
    }
}
