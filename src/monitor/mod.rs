// Memory and process monitoring module

mod meminfo;
mod process;

pub use meminfo::{MemInfo, MemSampler, MemorySource};
pub use process::{fix_truncated_utf8, PidStat, ProcReader, Snapshot, Unavailable, KTHREADD_PID};
