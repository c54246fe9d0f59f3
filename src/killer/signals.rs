// Signal delivery and the wait-for-exit loop

use super::pidfd::PidFd;
use super::selector::Victim;
use crate::config::Config;
use crate::daemon::PollState;
use crate::monitor::{MemorySource, ProcReader};
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::thread;
use std::time::{Duration, Instant};

/// How often the wait loop looks at the victim and at memory
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a signal goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Process(i32),
    Group(i32),
}

/// The OS operations the kill coordinator needs.
///
/// `None` as signal is the null signal: delivery is checked, nothing is sent.
pub trait ProcessControl {
    /// Stable reference to a process that survives pid reuse
    type Handle;

    fn process_group(&self, pid: i32) -> nix::Result<i32>;
    fn pin(&self, pid: i32) -> nix::Result<Self::Handle>;
    fn signal(&self, target: Target, signal: Option<Signal>) -> nix::Result<()>;
    fn signal_pinned(&self, handle: &Self::Handle, signal: Option<Signal>) -> nix::Result<()>;
    /// Speed up reclaim of a SIGKILLed process's memory
    fn release_memory(&self, handle: &Self::Handle) -> nix::Result<()>;
    fn is_alive(&self, pid: i32) -> bool;
}

/// The real thing: kill(2), killpg(2) and pidfds
pub struct SystemControl {
    reader: ProcReader,
}

impl SystemControl {
    pub const fn new(reader: ProcReader) -> Self {
        Self { reader }
    }
}

impl ProcessControl for SystemControl {
    type Handle = PidFd;

    fn process_group(&self, pid: i32) -> nix::Result<i32> {
        getpgid(Some(Pid::from_raw(pid))).map(Pid::as_raw)
    }

    fn pin(&self, pid: i32) -> nix::Result<PidFd> {
        PidFd::open(pid)
    }

    fn signal(&self, target: Target, signal: Option<Signal>) -> nix::Result<()> {
        match target {
            Target::Process(pid) => signal::kill(Pid::from_raw(pid), signal),
            Target::Group(pgid) => killpg(Pid::from_raw(pgid), signal),
        }
    }

    fn signal_pinned(&self, handle: &PidFd, signal: Option<Signal>) -> nix::Result<()> {
        handle.send_signal(signal)
    }

    fn release_memory(&self, handle: &PidFd) -> nix::Result<()> {
        handle.release_memory()
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.reader.is_alive(pid)
    }
}

/// Result of a kill operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillResult {
    /// The victim exited after the signal
    Exited(Duration),
    /// Dry run, no signal was sent
    DryRun,
    /// Null signal delivered, the victim is reachable
    Probed,
    /// Permission denied (typically need root)
    PermissionDenied,
    /// Process not found
    NotFound,
    /// The victim was still alive when the wait loop gave up
    TimedOut(Duration),
    /// Other error occurred
    Error(String),
}

impl KillResult {
    /// Check if the kill operation was successful
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::DryRun | Self::Probed)
    }

    /// True for failures where retrying right away would just fail again
    pub const fn needs_cooldown(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Error(_))
    }

    /// Get a human-readable description
    pub fn description(&self) -> String {
        match self {
            Self::Exited(elapsed) => format!("exited after {:.3}s", elapsed.as_secs_f64()),
            Self::DryRun => "dry run, no signal sent".to_string(),
            Self::Probed => "reachable".to_string(),
            Self::PermissionDenied => "permission denied".to_string(),
            Self::NotFound => "not found".to_string(),
            Self::TimedOut(elapsed) => {
                format!("still alive after {:.3}s", elapsed.as_secs_f64())
            }
            Self::Error(msg) => msg.clone(),
        }
    }

    fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => Self::NotFound,
            Errno::EPERM => Self::PermissionDenied,
            e => Self::Error(format!("signal error: {e}")),
        }
    }
}

fn signal_name(signal: Option<Signal>) -> &'static str {
    signal.map_or("signal 0", Signal::as_str)
}

/// Sends a signal to the victim and waits, bounded, for it to go away
pub struct KillCoordinator<'a, C: ProcessControl> {
    control: &'a C,
    config: &'a Config,
    poll_interval: Duration,
}

impl<'a, C: ProcessControl> KillCoordinator<'a, C> {
    pub const fn new(control: &'a C, config: &'a Config) -> Self {
        Self {
            control,
            config,
            poll_interval: KILL_POLL_INTERVAL,
        }
    }

    /// Poll faster or slower than KILL_POLL_INTERVAL (for testing)
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Kill `victim` with `signal`.
    ///
    /// While waiting for a SIGTERMed victim, memory is resampled on every
    /// tick and the signal is upgraded to SIGKILL as soon as the kill limits
    /// are crossed. Only a failing memory sample is an error.
    pub fn kill(
        &self,
        victim: &Victim,
        signal: Option<Signal>,
        memory: &mut dyn MemorySource,
    ) -> Result<KillResult> {
        let pid = victim.pid;

        if self.config.dry_run && signal.is_some() {
            log::warn!(
                "dryrun, not actually sending {} to process {pid}",
                signal_name(signal)
            );
            return Ok(KillResult::DryRun);
        }

        let (target, handle) = self.resolve_target(pid);

        if let Err(errno) = self.send(target, handle.as_ref(), signal) {
            log::warn!(
                "Failed to send {} to process {pid}: {errno}",
                signal_name(signal)
            );
            return Ok(KillResult::from_errno(errno));
        }

        let Some(mut signal) = signal else {
            return Ok(KillResult::Probed);
        };

        if signal == Signal::SIGKILL {
            self.release_memory(handle.as_ref(), pid);
        }

        let started = Instant::now();
        let ticks = (self.config.kill_timeout.as_nanos() / self.poll_interval.as_nanos().max(1))
            .max(1);

        for _ in 0..ticks {
            if signal != Signal::SIGKILL {
                let meminfo = memory.sample()?;
                if PollState::evaluate(&meminfo, self.config) == PollState::KillPending {
                    log::warn!(
                        "Low memory! at or below SIGKILL limits while waiting, escalating to SIGKILL: {meminfo}"
                    );
                    signal = Signal::SIGKILL;
                    if let Err(errno) = self.send(target, handle.as_ref(), Some(signal)) {
                        log::warn!("Failed to send SIGKILL to process {pid}: {errno}");
                        return Ok(KillResult::from_errno(errno));
                    }
                    self.release_memory(handle.as_ref(), pid);
                }
            }

            if !self.control.is_alive(pid) {
                let elapsed = started.elapsed();
                log::info!(
                    "process {pid} exited after {:.3}s",
                    elapsed.as_secs_f64()
                );
                return Ok(KillResult::Exited(elapsed));
            }

            thread::sleep(self.poll_interval);
        }

        let elapsed = started.elapsed();
        log::warn!(
            "process {pid} did not exit after {:.3}s",
            elapsed.as_secs_f64()
        );
        Ok(KillResult::TimedOut(elapsed))
    }

    /// Process group or single process; single processes get pinned
    fn resolve_target(&self, pid: i32) -> (Target, Option<C::Handle>) {
        if self.config.kill_group {
            match self.control.process_group(pid) {
                Ok(pgid) => {
                    log::debug!("Killing process group {pgid} (leader pid {pid})");
                    return (Target::Group(pgid), None);
                }
                Err(e) => {
                    log::warn!(
                        "Failed to get process group for pid {pid}: {e}. Falling back to single process kill."
                    );
                }
            }
        }

        match self.control.pin(pid) {
            Ok(handle) => (Target::Process(pid), Some(handle)),
            Err(e) => {
                log::debug!("pidfd_open({pid}) failed: {e}, using plain kill()");
                (Target::Process(pid), None)
            }
        }
    }

    fn send(
        &self,
        target: Target,
        handle: Option<&C::Handle>,
        signal: Option<Signal>,
    ) -> nix::Result<()> {
        match handle {
            Some(handle) => self.control.signal_pinned(handle, signal),
            None => self.control.signal(target, signal),
        }
    }

    /// Best effort. Failure only costs reclaim speed.
    fn release_memory(&self, handle: Option<&C::Handle>, pid: i32) {
        if let Some(handle) = handle {
            if let Err(e) = self.control.release_memory(handle) {
                log::debug!("process_mrelease({pid}) failed: {e}");
            }
        }
    }
}
