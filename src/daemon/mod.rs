// Daemon module - poll loop, threshold policy and startup

mod policy;
mod service;

pub use policy::{sleep_time, PollState, MAX_SLEEP, MIN_SLEEP};
pub use service::{DaemonService, ERROR_COOLDOWN, SWAP_SETTLE_TIME};

use crate::config::{Args, Config};
use crate::killer::SystemControl;
use crate::monitor::{MemSampler, MemorySource, ProcReader};
use crate::notify::hooks::HookValidator;
use anyhow::{Context, Result};
use nix::sys::mman::{mlockall, MlockAllFlags};

/// Build everything from the command line and run the poll loop.
///
/// Returns only on fatal errors.
pub fn run(args: Args) -> Result<()> {
    let mut memory = MemSampler::new()?;
    let meminfo = memory.sample()?;

    let config = Config::from_args(args, &meminfo).context("Invalid configuration")?;

    HookValidator::validate_hooks(
        config.pre_kill_script.as_deref(),
        config.post_kill_script.as_deref(),
    )?;

    let reader = ProcReader::new();
    // Fail now, not under pressure, if /proc cannot be listed
    reader.pids().context("Cannot list processes")?;

    let control = SystemControl::new(ProcReader::new());
    let mut service = DaemonService::new(config, reader, memory, control);

    service.print_startup_info()?;
    service.apply_priority();
    service.self_test()?;

    // The self-test has paged in the whole kill path by now
    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => log::debug!("Memory locked"),
        Err(e) => log::warn!("Could not lock memory: {e}. Responses may be slow under pressure."),
    }

    service.run()
}
