//! Script compartment boundary
//!
//! Hosts script engines inside a compartment and exposes them to the rest
//! of the system through sealed handles:
//!
//! - [`VmCompartment`]: context lifecycle (create, destroy, restart) and the
//!   entry points that run source, call named functions and drive the
//!   interactive loops
//! - [`marshal`]: signature-driven conversion between [`NativeValue`] slots
//!   and script values
//! - [`Callback`]: native closures callable from scripts, run in their home
//!   compartment
//! - [`ExportTable`]: roots for script objects held outside the engine
//! - [`FaultTranslator`]: turns traps into `OSError` exceptions or forced
//!   unwinds
//! - [`Context`]: typed, self-destroying wrapper over a handle
//!
//! ```text
//! caller ──compartment call──▶ unseal ▶ marshal in ▶ Vm (protected) ▶ marshal out
//!                                  ▲                     │ trap
//!                                  └── FaultTranslator ◀─┘
//! ```

pub mod callback;
pub mod capability;
pub mod config;
pub mod error;
pub mod export;
pub mod marshal;
pub mod native;
pub mod repl;
pub mod report;
pub mod signature;
pub mod translator;
pub mod typed;
pub mod vm_compartment;

pub use callback::{Callback, CallbackFn};
pub use capability::CapObject;
pub use config::VmConfig;
pub use error::{status_of, BoundaryError, BoundaryResult};
pub use export::ExportTable;
pub use native::{NativeValue, StrView};
pub use repl::{Console, ReplExit, ReplMode, ScriptedConsole};
pub use report::FaultReport;
pub use signature::{Signature, TypeTag};
pub use translator::FaultTranslator;
pub use typed::{typed_callback, Context, NativeArgs, NativeReturn, NativeType};
pub use vm_compartment::VmCompartment;
