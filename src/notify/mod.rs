pub mod hooks;

use crate::killer::Victim;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

#[cfg(feature = "dbus-notify")]
use notify_rust::{Notification, Timeout};

/// At most one notification per this interval
pub const NOTIFY_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Sanitize a string for safe use in environment variables and shell scripts
fn sanitize_env_value(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            c if c.is_alphanumeric() => c,
            ' ' | '.' | '-' | '_' | '/' => c,
            // Replace control characters and shell metacharacters
            _ => '_',
        })
        .take(256)
        .collect()
}

/// Drops events that come in faster than `interval`
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True if an event may go out now. Records it if so.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Desktop notifications and user hook scripts.
///
/// Scripts are spawned and not waited for. Finished children are reaped on
/// every later spawn so they never pile up as zombies.
pub struct NotificationManager {
    enable_dbus: bool,
    pre_kill_script: Option<String>,
    post_kill_script: Option<String>,
    limiter: RateLimiter,
    children: Vec<Child>,
}

impl NotificationManager {
    pub fn new(
        enable_dbus: bool,
        pre_kill_script: Option<String>,
        post_kill_script: Option<String>,
    ) -> Self {
        Self {
            enable_dbus,
            pre_kill_script,
            post_kill_script,
            limiter: RateLimiter::new(NOTIFY_RATE_LIMIT),
            children: Vec::new(),
        }
    }

    /// Run the pre-kill hook, if any. Not rate limited.
    pub fn pre_kill(&mut self, victim: &Victim) {
        if let Some(script) = self.pre_kill_script.clone() {
            info!("Executing pre-kill script: {script} for process {}", victim.pid);
            if let Err(e) = self.spawn_script(&script, victim) {
                error!("Failed to execute pre-kill script: {e:#}");
            }
        }
    }

    /// Tell the user about a kill. Called after the signal so the freed
    /// memory is there for spawning the helpers.
    pub fn post_kill(&mut self, victim: &Victim) {
        if self.post_kill_script.is_none() && !self.enable_dbus {
            return;
        }
        if !self.limiter.allow() {
            debug!("Notification for process {} rate limited", victim.pid);
            return;
        }

        if let Some(script) = self.post_kill_script.clone() {
            info!("Executing post-kill script: {script} for process {}", victim.pid);
            if let Err(e) = self.spawn_script(&script, victim) {
                error!("Failed to execute post-kill script: {e:#}");
            }
        }

        if self.enable_dbus {
            self.desktop(
                "Low memory! Killing process",
                &format!(
                    "Killed process {} \"{}\" (uid {}, {} MiB)",
                    victim.pid,
                    victim.name,
                    victim.uid,
                    victim.rss_kib / 1024
                ),
            );
        }
    }

    /// Tell the user something went wrong (rate limited)
    pub fn error(&mut self, message: &str) {
        if !self.enable_dbus || !self.limiter.allow() {
            return;
        }
        self.desktop("lowmem_guard", &format!("Error: {message}"));
    }

    fn spawn_script(&mut self, script_path: &str, victim: &Victim) -> Result<()> {
        self.reap();

        let mut child = Command::new(script_path)
            .env("LOWMEM_GUARD_PID", victim.pid.to_string())
            .env("LOWMEM_GUARD_UID", victim.uid.to_string())
            .env("LOWMEM_GUARD_NAME", sanitize_env_value(&victim.name))
            .env("LOWMEM_GUARD_CMDLINE", sanitize_env_value(&victim.cmdline))
            .env("LOWMEM_GUARD_RSS", victim.rss_kib.to_string())
            .env("LOWMEM_GUARD_SCORE", victim.badness.to_string())
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Could not spawn {script_path}"))?;

        // Catch scripts that die straight away, without blocking on the rest
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                warn!("Script {script_path} failed with status {status}");
            }
            Ok(Some(_)) => {}
            Ok(None) => self.children.push(child),
            Err(e) => warn!("Could not check on {script_path}: {e}"),
        }

        Ok(())
    }

    /// Collect exited children. Returns how many are still running.
    pub fn reap(&mut self) -> usize {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("Hook pid {} exited with {status}", child.id());
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not wait for hook pid {}: {e}", child.id());
                false
            }
        });
        self.children.len()
    }

    #[cfg(feature = "dbus-notify")]
    fn desktop(&self, summary: &str, body: &str) {
        let result = Notification::new()
            .summary(summary)
            .body(body)
            .icon("dialog-warning")
            .timeout(Timeout::Milliseconds(6000))
            .show();

        match result {
            Ok(_) => debug!("D-Bus notification sent: {body}"),
            Err(e) => error!("Failed to send D-Bus notification: {e}"),
        }
    }

    #[cfg(not(feature = "dbus-notify"))]
    fn desktop(&self, _summary: &str, body: &str) {
        error!("D-Bus notifications enabled but feature 'dbus-notify' not compiled in, dropping: {body}");
    }
}
