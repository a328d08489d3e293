//! Capability machine model
//!
//! A software model of the CHERIoT pieces the script boundary depends on:
//!
//! - [`Capability`] and [`Permissions`]: monotonic, tagged references
//! - [`SealingKey`], [`SObj`] and [`TokenStore`]: opaque sealed handles
//! - [`Allocator`]: quota-limited heap with revocation
//! - [`mem`]: capability-checked loads and stores that trap on violation
//! - [`hart`]: the register file and trap delivery
//! - [`nlr`]: the unwind-frame chain behind protected regions
//! - [`Compartment`]: protection domains and the switcher
//!
//! Each thread models one hart. Nothing here is `Send`; a compartment and
//! everything it owns stay on the thread that created it.

pub mod alloc;
pub mod capability;
pub mod cause;
pub mod compartment;
pub mod hart;
pub mod mem;
pub mod nlr;
pub mod perms;
pub mod regs;
pub mod seal;

pub use alloc::{AllocError, Allocator};
pub use capability::{Capability, CAP_BYTES};
pub use cause::{CapFault, CheriFault, FaultRegister, SpecialReg};
pub use compartment::{CallFault, Compartment, ErrorHandler, ErrorRecovery};
pub use perms::Permissions;
pub use regs::{Reg, RegisterFile, TrappedFrame};
pub use seal::{SObj, SealingKey, TokenStore};
