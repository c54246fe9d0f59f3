use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Environment variables handed to -P and -N scripts
pub const HOOK_VARIABLES: [(&str, &str); 6] = [
    ("LOWMEM_GUARD_PID", "Process ID of the victim"),
    ("LOWMEM_GUARD_UID", "Owner UID of the victim"),
    ("LOWMEM_GUARD_NAME", "Name of the victim (sanitized)"),
    ("LOWMEM_GUARD_CMDLINE", "Command line of the victim (sanitized)"),
    ("LOWMEM_GUARD_RSS", "Resident Set Size in KiB"),
    ("LOWMEM_GUARD_SCORE", "Badness the victim was selected with"),
];

pub struct HookValidator;

impl HookValidator {
    /// Validates that a hook script exists and is executable
    pub fn validate_hook_script(script_path: &str) -> Result<()> {
        let path = Path::new(script_path);

        if !path.exists() {
            bail!("Script does not exist: {script_path}");
        }
        if !path.is_file() {
            bail!("Path is not a file: {script_path}");
        }

        let mode = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for: {script_path}"))?
            .permissions()
            .mode();
        if mode & 0o111 == 0 {
            bail!("Script is not executable: {script_path}. Use 'chmod +x {script_path}'");
        }
        debug!("Script {script_path} is executable (permissions: {mode:o})");

        Ok(())
    }

    /// Validates the pre-kill and post-kill scripts that are set
    pub fn validate_hooks(
        pre_kill_script: Option<&str>,
        post_kill_script: Option<&str>,
    ) -> Result<()> {
        for (kind, script) in [("pre-kill", pre_kill_script), ("post-kill", post_kill_script)] {
            let Some(script) = script else {
                continue;
            };
            if let Err(e) = Self::validate_hook_script(script) {
                error!("{kind} script validation failed: {e}");
                return Err(e);
            }
            info!("Using {kind} script {script}");
        }

        if pre_kill_script.is_some() || post_kill_script.is_some() {
            debug!("{}", describe_environment());
        }

        Ok(())
    }
}

/// Human readable list of the hook variables
pub fn describe_environment() -> String {
    let mut out = String::from("Hook scripts receive the following environment variables:");
    for (name, meaning) in HOOK_VARIABLES {
        out.push_str(&format!("\n - {name}: {meaning}"));
    }
    out
}
