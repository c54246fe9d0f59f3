// Environment variable configuration support

use super::Config;
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

fn var(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Apply LOWMEM_GUARD_* environment overrides to configuration
pub fn apply_env_overrides(mut config: Config) -> Result<Config> {
    // Thresholds
    if let Some(val) = var("LOWMEM_GUARD_MEM_TERM") {
        config.mem_term_percent = val.parse().context("LOWMEM_GUARD_MEM_TERM")?;
    }
    if let Some(val) = var("LOWMEM_GUARD_MEM_KILL") {
        config.mem_kill_percent = val.parse().context("LOWMEM_GUARD_MEM_KILL")?;
    }
    if let Some(val) = var("LOWMEM_GUARD_SWAP_TERM") {
        config.swap_term_percent = val.parse().context("LOWMEM_GUARD_SWAP_TERM")?;
    }
    if let Some(val) = var("LOWMEM_GUARD_SWAP_KILL") {
        config.swap_kill_percent = val.parse().context("LOWMEM_GUARD_SWAP_KILL")?;
    }

    // Timing
    if let Some(val) = var("LOWMEM_GUARD_REPORT") {
        config.report_interval =
            Duration::from_secs(val.parse().context("LOWMEM_GUARD_REPORT")?);
    }
    if let Some(val) = var("LOWMEM_GUARD_KILL_TIMEOUT") {
        config.kill_timeout =
            Duration::from_secs(val.parse().context("LOWMEM_GUARD_KILL_TIMEOUT")?);
    }

    // Process selection
    if let Some(val) = var("LOWMEM_GUARD_SORT_BY_RSS") {
        config.sort_by_rss = parse_bool(&val)?;
    }
    if let Some(val) = var("LOWMEM_GUARD_IGNORE_OOM_SCORE_ADJ") {
        config.ignore_oom_score_adj = parse_bool(&val)?;
    }
    if let Some(val) = var("LOWMEM_GUARD_IGNORE_ROOT_USER") {
        config.ignore_root_user = parse_bool(&val)?;
    }

    // Behavior flags
    if let Some(val) = var("LOWMEM_GUARD_DRY_RUN") {
        config.dry_run = parse_bool(&val)?;
    }
    if let Some(val) = var("LOWMEM_GUARD_NOTIFY") {
        config.notify = parse_bool(&val)?;
    }
    if let Some(val) = var("LOWMEM_GUARD_KILL_GROUP") {
        config.kill_group = parse_bool(&val)?;
    }

    if let Some(val) = var("LOWMEM_GUARD_PRIORITY") {
        config.priority = Some(val.parse().context("LOWMEM_GUARD_PRIORITY")?);
    }

    Ok(config)
}

/// Parse boolean value from string
/// Accepts: true/false, 1/0, yes/no, on/off (case-insensitive)
fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean value: {}", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(parse_bool("on").unwrap());

        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("Off").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(!parse_bool("no").unwrap());

        assert!(parse_bool("invalid").is_err());
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = apply_env_overrides(Config::default()).unwrap();
        assert_eq!(config.mem_term_percent, 10.0);
        assert_eq!(config.kill_timeout, Duration::from_secs(10));
    }
}
