//! CPU and memory ceilings of the host.

use std::sync::Arc;
use sysinfo::System;

/// Source of the host's compute and memory ceilings.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    /// Number of CPUs this process may schedule on, at least 1.
    fn schedulable_cpus(&self) -> i64;

    /// Bytes of RAM currently available to this process.
    fn available_ram_bytes(&self) -> u64;
}

/// Shared handle to a resource probe.
pub type ProbeRef = Arc<dyn ResourceProbe>;

/// Reads ceilings from the running system.
///
/// CPU count comes from `std::thread::available_parallelism`, which honors
/// affinity masks and cgroup quotas. Available memory is read through
/// `sysinfo`, preferring the cgroup limit when one applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResources;

impl SystemResources {
    pub fn shared() -> ProbeRef {
        Arc::new(SystemResources)
    }
}

impl ResourceProbe for SystemResources {
    fn schedulable_cpus(&self) -> i64 {
        std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1)
            .max(1)
    }

    fn available_ram_bytes(&self) -> u64 {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        system
            .cgroup_limits()
            .map(|limits| limits.free_memory.min(available))
            .unwrap_or(available)
    }
}

/// Fixed ceilings, for tests and reproducible runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticResources {
    pub cpus: i64,
    pub ram_bytes: u64,
}

impl StaticResources {
    pub fn new(cpus: i64, ram_bytes: u64) -> Self {
        Self {
            cpus: cpus.max(1),
            ram_bytes,
        }
    }
}

impl ResourceProbe for StaticResources {
    fn schedulable_cpus(&self) -> i64 {
        self.cpus
    }

    fn available_ram_bytes(&self) -> u64 {
        self.ram_bytes
    }
}
