// Command-line argument parsing

use clap::Parser;

/// lowmem_guard - early low-memory killer
///
/// Monitors available memory and free swap and terminates the process with
/// the highest badness before the kernel OOM killer has to step in.
#[derive(Parser, Debug)]
#[command(name = "lowmem_guard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Userspace low-memory killer daemon", long_about = None)]
pub struct Args {
    /// Available memory minimum PERCENT[,KILL_PERCENT] (default: 10,5).
    /// A single value sets the SIGKILL level to half of it
    #[arg(short = 'm', long = "mem", value_name = "PERCENT[,KILL_PERCENT]")]
    pub mem_percent: Option<String>,

    /// Free swap minimum PERCENT[,KILL_PERCENT] (default: 10,5)
    #[arg(short = 's', long = "swap", value_name = "PERCENT[,KILL_PERCENT]")]
    pub swap_percent: Option<String>,

    /// Available memory minimum SIZE[,KILL_SIZE] in KiB (overrides -m)
    #[arg(short = 'M', long = "mem-size", value_name = "SIZE[,KILL_SIZE]")]
    pub mem_size_kib: Option<String>,

    /// Free swap minimum SIZE[,KILL_SIZE] in KiB (overrides -s)
    #[arg(short = 'S', long = "swap-size", value_name = "SIZE[,KILL_SIZE]")]
    pub swap_size_kib: Option<String>,

    /// Memory report interval in seconds, 0 disables (default: 1)
    #[arg(short = 'r', long = "report", value_name = "SECONDS")]
    pub report: Option<u64>,

    /// Seconds to wait for a victim to exit (default: 10)
    #[arg(long = "kill-timeout", value_name = "SECONDS")]
    pub kill_timeout: Option<u64>,

    /// Enable desktop notifications when killing processes
    #[arg(short = 'n', long = "notify")]
    pub notify: bool,

    /// Script to run after killing a process
    #[arg(short = 'N', long = "post-kill-script", value_name = "PATH")]
    pub post_kill_script: Option<String>,

    /// Script to run before killing a process
    #[arg(short = 'P', long = "pre-kill-script", value_name = "PATH")]
    pub pre_kill_script: Option<String>,

    /// Kill entire process group instead of just the process
    #[arg(short = 'g', long = "kill-group")]
    pub kill_group: bool,

    /// Ignore positive oom_score_adj values when computing badness
    #[arg(short = 'i', long = "ignore-oom-score-adj")]
    pub ignore_oom_score_adj: bool,

    /// Set daemon priority (-20 to 19, lower = higher priority)
    #[arg(short = 'p', long = "set-priority", value_name = "PRIORITY", allow_hyphen_values = true)]
    pub priority: Option<i32>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Find the process with the largest RSS instead of the highest oom_score
    #[arg(long = "sort-by-rss")]
    pub sort_by_rss: bool,

    /// Prefer to kill processes whose name matches this regex (can be used multiple times)
    #[arg(long = "prefer", value_name = "REGEX")]
    pub prefer: Vec<String>,

    /// Avoid killing processes whose name matches this regex (can be used multiple times)
    #[arg(long = "avoid", value_name = "REGEX")]
    pub avoid: Vec<String>,

    /// Never kill processes whose name matches this regex (can be used multiple times)
    #[arg(long = "ignore", value_name = "REGEX")]
    pub ignore: Vec<String>,

    /// Dry run mode - select victims and report them, but send no signals
    #[arg(long = "dryrun")]
    pub dry_run: bool,

    /// Never kill processes owned by root
    #[arg(long = "ignore-root-user")]
    pub ignore_root_user: bool,

    /// Use syslog instead of stdout/stderr for logging
    #[arg(long = "syslog")]
    pub syslog: bool,
}

impl Args {
    /// Parse arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
