// Per-process reads from /proc/<pid>
//
// Every accessor may race against the process exiting. That is the normal
// case when scanning thousands of pids, so failures come back as
// `Unavailable` instead of an error that would get logged.

use anyhow::{Context, Result};
use procfs::process::Process;
use procfs::ProcError;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Kernel thread reaper (kthreadd). It and its children are kernel threads.
pub const KTHREADD_PID: i32 = 2;

/// Why a field could not be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The process exited between listing and reading
    Gone,
    /// We lack the privileges to read this field
    PermissionDenied,
    /// The file was there but its content made no sense
    Malformed,
}

/// Result of a single /proc read
pub type Snapshot<T> = std::result::Result<T, Unavailable>;

impl From<ProcError> for Unavailable {
    fn from(err: ProcError) -> Self {
        match err {
            ProcError::NotFound(_) => Self::Gone,
            ProcError::PermissionDenied(_) => Self::PermissionDenied,
            ProcError::Io(ref e, _) => Self::from(e),
            _ => Self::Malformed,
        }
    }
}

impl From<&io::Error> for Unavailable {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::Gone,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            // ESRCH: the task is being torn down while we read
            _ if err.raw_os_error() == Some(libc::ESRCH) => Self::Gone,
            _ => Self::Malformed,
        }
    }
}

/// The fields of /proc/<pid>/stat we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidStat {
    pub state: char,
    pub ppid: i32,
    pub num_threads: i64,
    /// Resident set size in pages
    pub rss_pages: u64,
}

impl PidStat {
    /// A zombie only counts as gone once its last thread is gone too.
    pub const fn is_alive(&self) -> bool {
        !(self.state == 'Z' && self.num_threads <= 1)
    }

    pub const fn is_kernel_thread(&self, pid: i32) -> bool {
        pid == KTHREADD_PID || self.ppid == KTHREADD_PID
    }
}

/// Reads process attributes below a proc root (normally `/proc`)
#[derive(Debug, Clone)]
pub struct ProcReader {
    root: PathBuf,
    page_size_kib: u64,
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcReader {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use a different proc root (for testing)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size_kib: procfs::page_size() / 1024,
        }
    }

    /// List every pid currently visible. Failing to list the root is fatal.
    pub fn pids(&self) -> Result<Vec<i32>> {
        let mut pids = Vec::new();

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Could not open {}", self.root.display()))?;

        for entry in entries {
            let entry =
                entry.with_context(|| format!("Could not list {}", self.root.display()))?;
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
                pids.push(pid);
            }
        }

        Ok(pids)
    }

    fn process(&self, pid: i32) -> Snapshot<Process> {
        Ok(Process::new_with_root(self.root.join(pid.to_string()))?)
    }

    pub fn stat(&self, pid: i32) -> Snapshot<PidStat> {
        let stat = self.process(pid)?.stat()?;
        Ok(PidStat {
            state: stat.state,
            ppid: stat.ppid,
            num_threads: stat.num_threads,
            rss_pages: stat.rss,
        })
    }

    /// Kernel-computed badness, /proc/<pid>/oom_score
    pub fn oom_score(&self, pid: i32) -> Snapshot<i32> {
        Ok(self.process(pid)?.oom_score()? as i32)
    }

    /// /proc/<pid>/oom_score_adj, -1000..=1000
    pub fn oom_score_adj(&self, pid: i32) -> Snapshot<i32> {
        let path = self.root.join(pid.to_string()).join("oom_score_adj");
        let raw = fs::read_to_string(&path).map_err(|e| Unavailable::from(&e))?;
        raw.trim().parse().map_err(|_| Unavailable::Malformed)
    }

    pub fn rss_kib(&self, pid: i32) -> Snapshot<u64> {
        Ok(self.pages_to_kib(self.stat(pid)?.rss_pages))
    }

    pub const fn pages_to_kib(&self, pages: u64) -> u64 {
        pages * self.page_size_kib
    }

    /// Owner of /proc/<pid>, which is the effective uid of the process
    pub fn uid(&self, pid: i32) -> Snapshot<u32> {
        Ok(self.process(pid)?.uid()?)
    }

    /// Short name from /proc/<pid>/comm, repaired if the kernel cut a
    /// multi-byte character in half.
    pub fn name(&self, pid: i32) -> Snapshot<String> {
        let path = self.root.join(pid.to_string()).join("comm");
        let raw = fs::read(&path).map_err(|e| Unavailable::from(&e))?;

        let raw = raw.strip_suffix(b"\n").unwrap_or(&raw);
        Ok(String::from_utf8_lossy(fix_truncated_utf8(raw)).into_owned())
    }

    /// Full command line with arguments joined by spaces. Empty for kernel
    /// threads and zombies.
    pub fn cmdline(&self, pid: i32) -> Snapshot<String> {
        Ok(self.process(pid)?.cmdline()?.join(" "))
    }

    pub fn is_alive(&self, pid: i32) -> bool {
        match self.stat(pid) {
            Ok(stat) => {
                log::trace!(
                    "pid {pid}: state={} num_threads={}",
                    stat.state,
                    stat.num_threads
                );
                stat.is_alive()
            }
            Err(_) => false,
        }
    }
}

/// Drop a trailing, incomplete UTF-8 sequence.
///
/// /proc/<pid>/comm is cut at a fixed byte length, which can slice a
/// multi-byte character. Valid input comes back unchanged.
pub fn fix_truncated_utf8(bytes: &[u8]) -> &[u8] {
    // Only the tail matters. Garbage earlier in the name is left to the
    // lossy conversion.
    for back in 1..=bytes.len().min(3) {
        let start = bytes.len() - back;
        let lead = bytes[start];
        if lead & 0xc0 == 0x80 {
            // continuation byte, keep looking for the lead
            continue;
        }
        let needed = match lead {
            0x00..=0x7f => 1,
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return bytes,
        };
        return if back < needed { &bytes[..start] } else { bytes };
    }
    bytes
}
