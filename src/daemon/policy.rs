// Threshold policy and poll pacing

use crate::config::Config;
use crate::monitor::MemInfo;
use nix::sys::signal::Signal;
use std::time::Duration;

/// Worst-case memory fill rate in KiB per millisecond (~ MiB/s).
/// 6000 MiB/s was seen with "stress -m 4 --vm-bytes 4G".
pub const MEM_FILL_RATE: u64 = 6000;

/// Worst-case swap fill rate. 800 MiB/s was seen with a memory bomb on zram.
pub const SWAP_FILL_RATE: u64 = 800;

pub const MIN_SLEEP: Duration = Duration::from_millis(100);
pub const MAX_SLEEP: Duration = Duration::from_millis(1000);

/// Where the current sample sits relative to the configured limits.
///
/// Both memory AND swap have to be low: a box with plenty of free swap is
/// not in trouble just because RAM is tight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Monitoring,
    TermPending,
    KillPending,
}

impl PollState {
    pub fn evaluate(m: &MemInfo, config: &Config) -> Self {
        if m.mem_available_percent <= config.mem_kill_percent
            && m.swap_free_percent <= config.swap_kill_percent
        {
            Self::KillPending
        } else if m.mem_available_percent <= config.mem_term_percent
            && m.swap_free_percent <= config.swap_term_percent
        {
            Self::TermPending
        } else {
            Self::Monitoring
        }
    }

    /// Signal to send in this state, `None` while monitoring
    pub const fn signal(self) -> Option<Signal> {
        match self {
            Self::Monitoring => None,
            Self::TermPending => Some(Signal::SIGTERM),
            Self::KillPending => Some(Signal::SIGKILL),
        }
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monitoring => write!(f, "above limits"),
            Self::TermPending => write!(f, "at or below SIGTERM limits"),
            Self::KillPending => write!(f, "at or below SIGKILL limits"),
        }
    }
}

/// How long to sleep before the next sample.
///
/// Headroom above the SIGTERM limits divided by the worst-case fill rates:
/// the time it would take at least to get into trouble, clamped to
/// MIN_SLEEP..=MAX_SLEEP.
pub fn sleep_time(m: &MemInfo, config: &Config) -> Duration {
    let mem_headroom_kib = headroom_kib(
        m.mem_available_percent,
        config.mem_term_percent,
        m.user_mem_total,
    );
    let swap_headroom_kib =
        headroom_kib(m.swap_free_percent, config.swap_term_percent, m.swap_total);

    let ms = mem_headroom_kib / MEM_FILL_RATE + swap_headroom_kib / SWAP_FILL_RATE;
    Duration::from_millis(ms).clamp(MIN_SLEEP, MAX_SLEEP)
}

fn headroom_kib(percent: f64, limit_percent: f64, total_kib: u64) -> u64 {
    let headroom = (percent - limit_percent) * (total_kib as f64 / 100.0);
    if headroom > 0.0 {
        headroom as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mem_percent;

    #[test]
    fn test_kill_band_always_means_sigkill() {
        let config = Config::default();
        for mem in [0.0, 1.0, 2.5, 4.99, 5.0] {
            for swap in [0.0, 3.0, 5.0] {
                let state = PollState::evaluate(&mem_percent(mem, swap), &config);
                assert_eq!(state, PollState::KillPending, "mem {mem} swap {swap}");
                assert_eq!(state.signal(), Some(Signal::SIGKILL));
            }
        }
    }

    #[test]
    fn test_both_must_be_low() {
        let config = Config::default();
        assert_eq!(
            PollState::evaluate(&mem_percent(1.0, 50.0), &config),
            PollState::Monitoring
        );
        assert_eq!(
            PollState::evaluate(&mem_percent(50.0, 1.0), &config),
            PollState::Monitoring
        );
        assert_eq!(
            PollState::evaluate(&mem_percent(4.0, 8.0), &config),
            PollState::TermPending
        );
    }

    #[test]
    fn test_term_band_scenario() {
        // 8 GB box, 6.25% available, 2.5% swap free, limits 10/5:
        // swap is in the kill band but memory is not, so SIGTERM.
        let m = MemInfo::new(8_000_000, 500_000, 2_000_000, 50_000, Some(7_500_000));
        assert_eq!(m.mem_available_percent, 6.25);
        assert_eq!(m.swap_free_percent, 2.5);

        let state = PollState::evaluate(&m, &Config::default());
        assert_eq!(state, PollState::TermPending);
        assert_eq!(state.signal(), Some(Signal::SIGTERM));
    }

    #[test]
    fn test_no_swap_only_memory_counts() {
        let m = MemInfo::new(8_000_000, 300_000, 0, 0, Some(7_700_000));
        assert_eq!(
            PollState::evaluate(&m, &Config::default()),
            PollState::KillPending
        );
    }

    #[test]
    fn test_sleep_time_clamped() {
        let config = Config::default();
        assert_eq!(sleep_time(&mem_percent(5.0, 5.0), &config), MIN_SLEEP);
        assert_eq!(sleep_time(&mem_percent(100.0, 100.0), &config), MAX_SLEEP);
    }

    #[test]
    fn test_sleep_time_grows_with_headroom() {
        let config = Config::default();
        // 10 GiB box: 2% memory headroom = ~209 MiB -> ~34 ms, swap 1% = ~104 MiB -> ~131 ms
        let near = sleep_time(&mem_percent(12.0, 11.0), &config);
        let far = sleep_time(&mem_percent(14.0, 13.0), &config);
        assert!(near > MIN_SLEEP);
        assert!(far > near);
        assert!(far < MAX_SLEEP);
    }
}
