//! Configuration for a script compartment

use capvm_arch::alloc::round_up;
use capvm_engine::{EngineConfig, OutputSink};
use rustc_hash::FxHashMap;

/// Allocator quota of the script compartment in bytes
pub const DEFAULT_QUOTA: u32 = 65536;

/// Default context heap in bytes
pub const DEFAULT_HEAP_SIZE: u32 = 0xc000;

/// Frozen module run at the end of every context creation
pub const BOOT_MODULE: &str = "_boot.py";

/// Frozen module auto mode runs before the first interactive loop
pub const AUTO_BOOT_MODULE: &str = "boot.py";

/// Options for creating a [`VmCompartment`](crate::VmCompartment)
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Compartment name, as shown in fault reports
    pub name: String,

    /// Bytes the compartment may allocate in total, heaps included
    pub quota: u32,

    /// Heap size used by [`Context::create_default`](crate::Context::create_default)
    pub heap_size: u32,

    /// Frozen modules by file name
    pub frozen: FxHashMap<String, String>,

    /// Collector threshold, as a share of the heap
    pub gc_threshold_percent: u8,

    /// Maximum script call depth
    pub max_depth: usize,

    /// Destination of script output
    pub output: OutputSink,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "mp_vm".to_string(),
            quota: DEFAULT_QUOTA,
            heap_size: DEFAULT_HEAP_SIZE,
            frozen: FxHashMap::default(),
            gc_threshold_percent: 50,
            max_depth: 64,
            output: OutputSink::Stdout,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_quota(mut self, quota: u32) -> Self {
        self.quota = round_up(quota);
        self
    }

    pub fn with_heap_size(mut self, heap_size: u32) -> Self {
        self.heap_size = heap_size;
        self
    }

    /// Sets the bootstrap script, run as the frozen module `_boot.py`.
    pub fn with_boot_script(self, source: impl Into<String>) -> Self {
        self.with_frozen_module(BOOT_MODULE, source)
    }

    pub fn with_frozen_module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.frozen.insert(name.into(), source.into());
        self
    }

    pub fn with_gc_threshold(mut self, percent: u8) -> Self {
        self.gc_threshold_percent = percent.min(100);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn frozen_module(&self, name: &str) -> Option<&str> {
        self.frozen.get(name).map(String::as_str)
    }

    pub(crate) fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_depth: self.max_depth,
            gc_threshold_percent: self.gc_threshold_percent,
            output: self.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.name, "mp_vm");
        assert_eq!(config.quota, 65536);
        assert_eq!(config.heap_size, 0xc000);
        assert!(config.frozen_module(BOOT_MODULE).is_none());
    }

    #[test]
    fn test_builder() {
        let config = VmConfig::new()
            .with_name("scripts")
            .with_quota(1001)
            .with_boot_script("x = 1")
            .with_frozen_module("boot.py", "y = 2")
            .with_gc_threshold(150);
        assert_eq!(config.name, "scripts");
        assert_eq!(config.quota, 1008);
        assert_eq!(config.frozen_module("_boot.py"), Some("x = 1"));
        assert_eq!(config.frozen_module(AUTO_BOOT_MODULE), Some("y = 2"));
        assert_eq!(config.gc_threshold_percent, 100);
        assert_eq!(config.engine_config().max_depth, 64);
    }
}
