// Configuration module

mod args;
mod env;

pub use args::Args;
use crate::monitor::MemInfo;
use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use std::time::Duration;

/// Maximum allowed length for regex patterns to prevent ReDoS attacks
const MAX_REGEX_PATTERN_LENGTH: usize = 256;

/// Maximum compiled regex size in bytes (10MB) to prevent memory exhaustion
const REGEX_SIZE_LIMIT: usize = 10 * (1 << 20);

/// Badness added for --prefer matches (subtracted for --avoid)
pub const DEFAULT_PREFER_BADNESS_BONUS: i32 = 300;

/// RSS added for --prefer matches when sorting by RSS: 3 GiB
pub const DEFAULT_PREFER_RSS_BONUS_KIB: u64 = 3 * 1024 * 1024;

/// Compile a regex pattern with safety limits to prevent ReDoS attacks.
///
/// This function applies the following protections:
/// - Limits pattern length to MAX_REGEX_PATTERN_LENGTH characters
/// - Sets a compiled size limit to prevent memory exhaustion
fn compile_safe_regex(pattern: &str) -> Result<Regex> {
    if pattern.len() > MAX_REGEX_PATTERN_LENGTH {
        bail!(
            "Regex pattern too long (max {} chars): {}...",
            MAX_REGEX_PATTERN_LENGTH,
            pattern.chars().take(50).collect::<String>()
        );
    }

    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .context(format!("Invalid regex pattern: {pattern}"))
}

/// Parse "TERM" or "TERM,KILL" into (term, kill).
///
/// A single value sets KILL to TERM/2. `upper_limit` bounds TERM.
fn parse_term_kill_pair(s: &str, upper_limit: f64) -> Result<(f64, f64)> {
    let mut parts = s.split(',');
    let term: f64 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .with_context(|| format!("Invalid SIGTERM value in {s:?}"))?;

    let kill: f64 = match parts.next() {
        Some(kill) => kill
            .trim()
            .parse()
            .with_context(|| format!("Invalid SIGKILL value in {s:?}"))?,
        None => term / 2.0,
    };

    if parts.next().is_some() {
        bail!("Found multiple ',' in {s:?}");
    }
    if term < 0.0 || kill < 0.0 {
        bail!("Negative value in {s:?}");
    }
    if term == 0.0 && kill == 0.0 {
        bail!("Both SIGTERM and SIGKILL values are zero in {s:?}");
    }

    // SIGTERM below SIGKILL would never fire
    let term = if term < kill {
        log::warn!(
            "SIGTERM value {term} is below SIGKILL value {kill}, setting SIGTERM = SIGKILL = {kill}"
        );
        kill
    } else {
        term
    };

    if term > upper_limit {
        bail!("SIGTERM value {term} exceeds limit {upper_limit}");
    }

    Ok((term, kill))
}

/// Turn an absolute KiB pair into a percent pair of `total`
fn size_pair_to_percent(s: &str, total_kib: u64) -> Result<(f64, f64)> {
    let (term_kib, kill_kib) = parse_term_kill_pair(s, total_kib as f64)?;
    let total = total_kib as f64;
    Ok((term_kib * 100.0 / total, kill_kib * 100.0 / total))
}

/// Everything the poll loop needs, fixed at startup
#[derive(Debug, Clone)]
pub struct Config {
    // Thresholds, in percent of available memory / free swap
    pub mem_term_percent: f64,
    pub mem_kill_percent: f64,
    pub swap_term_percent: f64,
    pub swap_kill_percent: f64,

    pub report_interval: Duration, // Zero disables the status line
    pub kill_timeout: Duration,    // How long to wait for a victim to exit

    // Victim selection
    pub sort_by_rss: bool,
    pub ignore_oom_score_adj: bool, // Subtract positive oom_score_adj from the badness
    pub ignore_root_user: bool,
    pub prefer: Vec<Regex>,
    pub avoid: Vec<Regex>,
    pub ignore: Vec<Regex>,
    pub prefer_badness_bonus: i32,
    pub prefer_rss_bonus_kib: u64,

    // Behavior flags
    pub dry_run: bool,
    pub kill_group: bool,

    // Notifications
    pub notify: bool,
    pub pre_kill_script: Option<String>,
    pub post_kill_script: Option<String>,

    pub priority: Option<i32>,
}

impl Config {
    /// Create configuration from command-line arguments.
    ///
    /// `meminfo` provides the totals that absolute sizes (-M/-S) are
    /// converted against.
    pub fn from_args(args: Args, meminfo: &MemInfo) -> Result<Self> {
        let mut config = Self::default();

        if let Some(mem) = &args.mem_percent {
            let (term, kill) = parse_term_kill_pair(mem, 100.0).context("-m")?;
            config.mem_term_percent = term;
            config.mem_kill_percent = kill;
        }
        if let Some(swap) = &args.swap_percent {
            let (term, kill) = parse_term_kill_pair(swap, 100.0).context("-s")?;
            config.swap_term_percent = term;
            config.swap_kill_percent = kill;
        }

        // Absolute sizes win over percentages
        if let Some(mem) = &args.mem_size_kib {
            let (term, kill) = size_pair_to_percent(mem, meminfo.mem_total).context("-M")?;
            config.mem_term_percent = term;
            config.mem_kill_percent = kill;
        }
        if let Some(swap) = &args.swap_size_kib {
            if meminfo.swap_total == 0 {
                log::warn!("-S given but the system has no swap, ignoring it");
            } else {
                let (term, kill) =
                    size_pair_to_percent(swap, meminfo.swap_total).context("-S")?;
                config.swap_term_percent = term;
                config.swap_kill_percent = kill;
            }
        }

        if let Some(report) = args.report {
            config.report_interval = Duration::from_secs(report);
        }
        if let Some(timeout) = args.kill_timeout {
            config.kill_timeout = Duration::from_secs(timeout);
        }

        config.sort_by_rss = args.sort_by_rss;
        config.ignore_oom_score_adj = args.ignore_oom_score_adj;
        config.ignore_root_user = args.ignore_root_user;

        for pattern in &args.prefer {
            config.prefer.push(compile_safe_regex(pattern)?);
        }
        for pattern in &args.avoid {
            config.avoid.push(compile_safe_regex(pattern)?);
        }
        for pattern in &args.ignore {
            config.ignore.push(compile_safe_regex(pattern)?);
        }

        config.dry_run = args.dry_run;
        config.kill_group = args.kill_group;

        config.notify = args.notify;
        config.pre_kill_script = args.pre_kill_script;
        config.post_kill_script = args.post_kill_script;

        config.priority = args.priority;

        let config = env::apply_env_overrides(config)?;
        config.validate()?;

        Ok(config)
    }

    /// True if any --prefer/--avoid/--ignore pattern is set
    pub fn has_name_patterns(&self) -> bool {
        !(self.prefer.is_empty() && self.avoid.is_empty() && self.ignore.is_empty())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("mem_term_percent", self.mem_term_percent),
            ("mem_kill_percent", self.mem_kill_percent),
            ("swap_term_percent", self.swap_term_percent),
            ("swap_kill_percent", self.swap_kill_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                bail!("{name} must be between 0 and 100, got {value}");
            }
        }

        if self.mem_kill_percent > self.mem_term_percent {
            bail!(
                "mem_kill_percent ({}) is greater than mem_term_percent ({})",
                self.mem_kill_percent,
                self.mem_term_percent
            );
        }
        if self.swap_kill_percent > self.swap_term_percent {
            bail!(
                "swap_kill_percent ({}) is greater than swap_term_percent ({})",
                self.swap_kill_percent,
                self.swap_term_percent
            );
        }

        if self.kill_timeout.is_zero() {
            bail!("kill timeout must be at least one second");
        }

        if let Some(priority) = self.priority {
            if !(-20..=19).contains(&priority) {
                bail!("priority must be between -20 and 19");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_term_percent: 10.0,
            mem_kill_percent: 5.0,
            swap_term_percent: 10.0,
            swap_kill_percent: 5.0,
            report_interval: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(10),
            sort_by_rss: false,
            ignore_oom_score_adj: false,
            ignore_root_user: false,
            prefer: Vec::new(),
            avoid: Vec::new(),
            ignore: Vec::new(),
            prefer_badness_bonus: DEFAULT_PREFER_BADNESS_BONUS,
            prefer_rss_bonus_kib: DEFAULT_PREFER_RSS_BONUS_KIB,
            dry_run: false,
            kill_group: false,
            notify: false,
            pre_kill_script: None,
            post_kill_script: None,
            priority: None,
        }
    }
}
