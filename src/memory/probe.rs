use anyhow::{anyhow, Context};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, System};

/// Raw memory figures in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
}

/// Source of memory usage readings.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    fn sample(&self) -> anyhow::Result<MemoryUsage>;
}

/// Reads the current process through `sysinfo`.
///
/// Native code has no managed heap, so the resident set stands in for heap
/// usage and the virtual size for the heap ceiling. `external` is always zero.
pub struct ProcessMemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> anyhow::Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|err| anyhow!("cannot determine current pid: {err}"))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl fmt::Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemoryProbe").field("pid", &self.pid).finish()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> anyhow::Result<MemoryUsage> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_process(self.pid);

        let process = system
            .process(self.pid)
            .with_context(|| format!("process {} not visible", self.pid))?;

        let rss = process.memory();
        Ok(MemoryUsage {
            heap_used: rss,
            heap_total: process.virtual_memory(),
            external: 0,
            rss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_probe_reports_resident_memory() {
        let probe = ProcessMemoryProbe::new().unwrap();
        let usage = probe.sample().unwrap();

        assert!(usage.rss > 0);
        assert_eq!(usage.heap_used, usage.rss);
        assert_eq!(usage.external, 0);
    }
}
