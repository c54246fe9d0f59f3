// Main daemon service implementation

use super::policy::{sleep_time, PollState, MIN_SLEEP};
use crate::config::Config;
use crate::killer::{KillCoordinator, KillResult, ProcessControl, Victim, VictimSelector};
use crate::monitor::{MemInfo, MemorySource, ProcReader};
use crate::notify::NotificationManager;
use anyhow::{Context, Result};
use log::Level;
use nix::sys::signal::Signal;
use std::fs;
use std::io::Error;
use std::time::{Duration, Instant};

/// Pause after a scan that found nothing or a kill that cannot succeed
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(1);

/// Extra wait after a kill while swap is in use. Reclaim of swapped-out
/// pages lags behind the exit of the process.
pub const SWAP_SETTLE_TIME: Duration = Duration::from_millis(200);

/// Set daemon priority using the configured value
#[allow(unsafe_code)]
fn set_daemon_priority(priority: i32) {
    // SAFETY: setpriority only reads its integer arguments
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };

    if result != 0 {
        let err = Error::last_os_error();
        log::warn!("Failed to set niceness to {priority}: {err}. May need root privileges.");
    } else {
        log::info!("Set daemon niceness to {priority}");
    }

    // Let the kernel OOM killer pick others before us
    match fs::write("/proc/self/oom_score_adj", "-100") {
        Ok(()) => log::info!("Set oom_score_adj to -100"),
        Err(e) => log::warn!("Failed to set oom_score_adj: {e}"),
    }
}

/// The poll loop: sample memory, decide, kill, repeat
pub struct DaemonService<M: MemorySource, C: ProcessControl> {
    config: Config,
    reader: ProcReader,
    memory: M,
    control: C,
    notifier: NotificationManager,
    self_pid: i32,
    last_report: Option<Instant>,
}

impl<M: MemorySource, C: ProcessControl> DaemonService<M, C> {
    pub fn new(config: Config, reader: ProcReader, memory: M, control: C) -> Self {
        let notifier = NotificationManager::new(
            config.notify,
            config.pre_kill_script.clone(),
            config.post_kill_script.clone(),
        );
        Self {
            config,
            reader,
            memory,
            control,
            notifier,
            self_pid: std::process::id() as i32,
            last_report: None,
        }
    }

    /// Pretend to be another pid (for testing)
    #[cfg(test)]
    const fn with_self_pid(mut self, pid: i32) -> Self {
        self.self_pid = pid;
        self
    }

    /// Renice and shield ourselves if -p was given
    pub fn apply_priority(&self) {
        if let Some(priority) = self.config.priority {
            set_daemon_priority(priority);
        }
    }

    /// Log the totals and the limits in effect
    pub fn print_startup_info(&mut self) -> Result<()> {
        let m = self.memory.sample().context("Failed to read memory info")?;

        log::info!("=== lowmem_guard v{} starting ===", env!("CARGO_PKG_VERSION"));
        log::info!(
            "mem total: {} MiB, user mem total: {} MiB, swap total: {} MiB",
            m.mem_total / 1024,
            m.user_mem_total / 1024,
            m.swap_total / 1024
        );
        log::info!(
            "sending SIGTERM when mem avail <= {:.2}% and swap free <= {:.2}%,",
            self.config.mem_term_percent,
            self.config.swap_term_percent
        );
        log::info!(
            "        SIGKILL when mem avail <= {:.2}% and swap free <= {:.2}%",
            self.config.mem_kill_percent,
            self.config.swap_kill_percent
        );

        if !self.config.prefer.is_empty() {
            log::info!("Prefer killing: {} pattern(s)", self.config.prefer.len());
        }
        if !self.config.avoid.is_empty() {
            log::info!("Avoid killing: {} pattern(s)", self.config.avoid.len());
        }
        if !self.config.ignore.is_empty() {
            log::info!("Ignore processes: {} pattern(s)", self.config.ignore.len());
        }
        if self.config.sort_by_rss {
            log::info!("Selecting victims by RSS instead of oom_score");
        }
        if self.config.ignore_root_user {
            log::info!("Processes owned by root will not be killed");
        }
        if self.config.kill_group {
            log::info!("Killing whole process groups");
        }
        if self.config.dry_run {
            log::warn!("DRY RUN MODE - will not actually kill processes");
        }

        Ok(())
    }

    /// One full selection plus a null-signal kill, so a broken /proc view
    /// or missing privileges show up at startup instead of under pressure
    pub fn self_test(&mut self) -> Result<()> {
        let selector =
            VictimSelector::new(&self.config, &self.reader).with_self_pid(self.self_pid);
        let Some(victim) = selector.select().context("Startup process scan failed")? else {
            log::warn!("Startup self-test: no killable process found");
            return Ok(());
        };

        let result = KillCoordinator::new(&self.control, &self.config).kill(
            &victim,
            None,
            &mut self.memory,
        )?;
        if result.is_success() {
            log::debug!("Startup self-test: {victim} is {}", result.description());
        } else {
            log::warn!("Startup self-test: could not signal {victim}: {}", result.description());
        }
        Ok(())
    }

    /// Main run loop. Only fatal errors get out of here.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let pause = self.poll_once()?;
            std::thread::sleep(pause);
        }
    }

    /// Sample, act if needed, and return how long to sleep
    pub fn poll_once(&mut self) -> Result<Duration> {
        let meminfo = self.memory.sample().context("Failed to read memory info")?;
        let state = PollState::evaluate(&meminfo, &self.config);

        match state.signal() {
            Some(signal) => {
                log_status(Level::Warn, &format!("low memory! {state}"), &meminfo);
                self.handle_pressure(signal)
            }
            None => {
                self.report_status(&meminfo);
                Ok(sleep_time(&meminfo, &self.config))
            }
        }
    }

    fn handle_pressure(&mut self, signal: Signal) -> Result<Duration> {
        let selector =
            VictimSelector::new(&self.config, &self.reader).with_self_pid(self.self_pid);
        let scan = match selector.select() {
            Ok(scan) => scan,
            Err(e) => {
                log::error!(
                    "Failed to scan processes: {e:#}. Sleeping {}s.",
                    ERROR_COOLDOWN.as_secs()
                );
                self.notifier.error("could not scan processes");
                return Ok(ERROR_COOLDOWN);
            }
        };
        let Some(victim) = scan else {
            log::warn!(
                "Could not find a process to kill. Sleeping {}s.",
                ERROR_COOLDOWN.as_secs()
            );
            self.notifier.error("could not find a process to kill");
            return Ok(ERROR_COOLDOWN);
        };

        // The scan is not instant, recheck before shooting
        let fresh = self.memory.sample().context("Failed to read memory info")?;
        let state = PollState::evaluate(&fresh, &self.config);
        let Some(fresh_signal) = state.signal() else {
            log::info!("Memory situation has recovered while selecting victim");
            return Ok(MIN_SLEEP);
        };
        if fresh_signal != signal {
            log::debug!("Pressure changed during the scan, now {state}");
        }

        log::warn!("sending {} to {victim}", fresh_signal.as_str());

        if !self.config.dry_run {
            self.notifier.pre_kill(&victim);
        }

        let result = KillCoordinator::new(&self.control, &self.config).kill(
            &victim,
            Some(fresh_signal),
            &mut self.memory,
        )?;

        Ok(self.after_kill(&victim, &result, &fresh))
    }

    fn after_kill(&mut self, victim: &Victim, result: &KillResult, meminfo: &MemInfo) -> Duration {
        match result {
            KillResult::DryRun => MIN_SLEEP,
            KillResult::Exited(_) => {
                self.notifier.post_kill(victim);
                if meminfo.swap_total > 0 {
                    SWAP_SETTLE_TIME
                } else {
                    MIN_SLEEP
                }
            }
            KillResult::NotFound => {
                log::info!("process {} was gone before the signal arrived", victim.pid);
                MIN_SLEEP
            }
            failure => {
                log::error!(
                    "Failed to kill process {}: {}",
                    victim.pid,
                    failure.description()
                );
                self.notifier
                    .error(&format!("failed to kill process {}", victim.pid));
                if failure.needs_cooldown() {
                    log::warn!("Sleeping {}s", ERROR_COOLDOWN.as_secs());
                    ERROR_COOLDOWN
                } else {
                    MIN_SLEEP
                }
            }
        }
    }

    /// Periodic status line. A zero interval turns it off.
    fn report_status(&mut self, meminfo: &MemInfo) {
        if self.config.report_interval.is_zero() {
            return;
        }
        let due = self
            .last_report
            .map_or(true, |last| last.elapsed() >= self.config.report_interval);
        if due {
            log_status(Level::Info, "", meminfo);
            self.last_report = Some(Instant::now());
        }
    }
}

fn log_status(level: Level, prefix: &str, meminfo: &MemInfo) {
    if prefix.is_empty() {
        log::log!(level, "{meminfo}");
    } else {
        log::log!(level, "{prefix}: {meminfo}");
    }
}
