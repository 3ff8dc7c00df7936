//! Process memory sampling and reclamation advice.

pub mod advisor;
pub mod probe;

pub use advisor::{MemoryAdvisor, MemoryConfig, MemorySample, ReclaimHook};
pub use probe::{MemoryProbe, MemoryUsage, ProcessMemoryProbe};
