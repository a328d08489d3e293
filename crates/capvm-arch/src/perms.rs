//! Capability permission bits
//!
//! The bit assignment follows the CHERIoT architectural permission encoding
//! once decompressed. Derivations may only ever clear bits.

use bitflags::bitflags;

bitflags! {
    /// Permission set carried by a [`Capability`](crate::Capability).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        /// May be stored through capabilities lacking `STORE_LOCAL`.
        const GLOBAL = 1 << 0;
        /// Capabilities loaded through this one keep `GLOBAL`.
        const LOAD_GLOBAL = 1 << 1;
        /// Capabilities loaded through this one keep `STORE`.
        const LOAD_MUTABLE = 1 << 2;
        /// May store non-global capabilities.
        const STORE_LOCAL = 1 << 3;
        const LOAD = 1 << 4;
        const STORE = 1 << 5;
        /// May load and store tagged capabilities.
        const LOAD_STORE_CAP = 1 << 6;
        const ACCESS_SYSTEM_REGISTERS = 1 << 7;
        const EXECUTE = 1 << 8;
        const UNSEAL = 1 << 9;
        const SEAL = 1 << 10;
        const USER0 = 1 << 11;
    }
}

impl Permissions {
    /// Read-write heap memory, as handed out by the allocator.
    pub const DATA: Self = Self::GLOBAL
        .union(Self::LOAD_GLOBAL)
        .union(Self::LOAD_MUTABLE)
        .union(Self::STORE_LOCAL)
        .union(Self::LOAD)
        .union(Self::STORE)
        .union(Self::LOAD_STORE_CAP);

    /// Executable compartment code.
    pub const CODE: Self = Self::GLOBAL
        .union(Self::LOAD_GLOBAL)
        .union(Self::LOAD)
        .union(Self::LOAD_STORE_CAP)
        .union(Self::EXECUTE);

    /// Sealing authority over an object type range.
    pub const SEALING: Self = Self::GLOBAL.union(Self::SEAL).union(Self::UNSEAL);

    /// Memory-mapped device registers.
    pub const MMIO: Self = Self::GLOBAL.union(Self::LOAD).union(Self::STORE);
}
