// Test doubles shared by the unit tests

use crate::killer::{ProcessControl, Target};
use crate::monitor::{MemInfo, MemorySource};
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

/// Contents of a fake /proc/<pid> directory
#[derive(Debug, Clone)]
pub struct MockProc {
    pub pid: i32,
    pub ppid: i32,
    pub state: char,
    pub num_threads: i64,
    pub rss_pages: u64,
    pub oom_score: i32,
    pub oom_score_adj: i32,
    pub comm: String,
    pub cmdline: Vec<String>,
}

impl MockProc {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            ppid: 1,
            state: 'S',
            num_threads: 1,
            rss_pages: 1000,
            oom_score: 100,
            oom_score_adj: 0,
            comm: format!("proc{pid}"),
            cmdline: vec![format!("/usr/bin/proc{pid}"), "--flag".to_string()],
        }
    }

    pub fn scored(pid: i32, oom_score: i32, rss_pages: u64) -> Self {
        Self {
            oom_score,
            rss_pages,
            ..Self::new(pid)
        }
    }
}

/// Write `proc` below `root` in the same layout the kernel uses
pub fn write_mock_proc(root: &Path, proc: &MockProc) {
    let dir = root.join(proc.pid.to_string());
    fs::create_dir_all(&dir).unwrap();

    let stat = format!(
        "{pid} ({comm}) {state} {ppid} {pid} {ppid} 34816 {pid} 4194304 94 0 0 0 0 0 0 0 20 0 \
         {threads} 0 5017160 227065856 {rss} 18446744073709551615 94898152189952 \
         94898152206609 140721104501216 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 94898152221328 \
         94898152222824 94898185641984 140721104505828 140721104505848 140721104505848 \
         140721104510955 0\n",
        pid = proc.pid,
        comm = proc.comm,
        state = proc.state,
        ppid = proc.ppid,
        threads = proc.num_threads,
        rss = proc.rss_pages,
    );
    fs::write(dir.join("stat"), stat).unwrap();
    fs::write(dir.join("oom_score"), format!("{}\n", proc.oom_score)).unwrap();
    fs::write(dir.join("oom_score_adj"), format!("{}\n", proc.oom_score_adj)).unwrap();
    fs::write(dir.join("comm"), format!("{}\n", proc.comm)).unwrap();

    let mut cmdline = Vec::new();
    for arg in &proc.cmdline {
        cmdline.extend_from_slice(arg.as_bytes());
        cmdline.push(0);
    }
    fs::write(dir.join("cmdline"), cmdline).unwrap();
}

/// Hands out a fixed sequence of samples, then repeats the last one
pub struct ScriptedMemory {
    samples: VecDeque<MemInfo>,
    last: MemInfo,
    pub taken: usize,
}

impl ScriptedMemory {
    pub fn new(samples: Vec<MemInfo>) -> Self {
        let last = samples.last().copied().unwrap_or_default();
        Self {
            samples: samples.into(),
            last,
            taken: 0,
        }
    }

    pub fn constant(info: MemInfo) -> Self {
        Self::new(vec![info])
    }
}

impl MemorySource for ScriptedMemory {
    fn sample(&mut self) -> Result<MemInfo> {
        self.taken += 1;
        Ok(self.samples.pop_front().unwrap_or(self.last))
    }
}

/// Memory snapshot with the given percentages of a 10 GiB machine
pub fn mem_percent(mem_available_percent: f64, swap_free_percent: f64) -> MemInfo {
    const TOTAL: u64 = 10 * 1024 * 1024;
    let available = (TOTAL as f64 * mem_available_percent / 100.0) as u64;
    let swap_free = (TOTAL as f64 * swap_free_percent / 100.0) as u64;
    MemInfo::new(TOTAL, available, TOTAL, swap_free, Some(TOTAL - available))
}

/// Records every signal instead of sending it
#[derive(Default)]
pub struct FakeControl {
    pub sent: RefCell<Vec<(Target, Option<Signal>)>>,
    pub released: Cell<usize>,
    /// How many more liveness checks report the victim as alive
    pub alive_checks: Cell<usize>,
    /// Error returned for every signal
    pub fail_with: Option<Errno>,
    /// Process group returned for group kills
    pub pgid: Option<i32>,
    /// Refuse to hand out pinned handles
    pub no_pidfd: bool,
}

impl FakeControl {
    pub fn alive_for(checks: usize) -> Self {
        Self {
            alive_checks: Cell::new(checks),
            ..Self::default()
        }
    }

    pub fn signals(&self) -> Vec<Option<Signal>> {
        self.sent.borrow().iter().map(|(_, sig)| *sig).collect()
    }
}

impl ProcessControl for FakeControl {
    type Handle = i32;

    fn process_group(&self, pid: i32) -> nix::Result<i32> {
        Ok(self.pgid.unwrap_or(pid))
    }

    fn pin(&self, pid: i32) -> nix::Result<i32> {
        if self.no_pidfd {
            Err(Errno::ENOSYS)
        } else {
            Ok(pid)
        }
    }

    fn signal(&self, target: Target, signal: Option<Signal>) -> nix::Result<()> {
        self.sent.borrow_mut().push((target, signal));
        self.fail_with.map_or(Ok(()), Err)
    }

    fn signal_pinned(&self, handle: &i32, signal: Option<Signal>) -> nix::Result<()> {
        self.signal(Target::Process(*handle), signal)
    }

    fn release_memory(&self, _handle: &i32) -> nix::Result<()> {
        self.released.set(self.released.get() + 1);
        Ok(())
    }

    fn is_alive(&self, _pid: i32) -> bool {
        let left = self.alive_checks.get();
        if left == 0 {
            return false;
        }
        self.alive_checks.set(left - 1);
        true
    }
}
