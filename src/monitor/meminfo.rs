// Memory information parsing from /proc/meminfo

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Anything that can hand out a fresh memory snapshot.
///
/// The poll loop and the kill coordinator only depend on this trait so they
/// can be driven by scripted memory curves in tests.
pub trait MemorySource {
    /// Take a fresh sample. Errors are fatal for the caller.
    fn sample(&mut self) -> Result<MemInfo>;
}

/// Memory information structure, all sizes in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInfo {
    /// Total physical memory
    pub mem_total: u64,
    /// Available memory (kernel estimate, or our guesstimate on old kernels)
    pub mem_available: u64,
    /// Total swap space
    pub swap_total: u64,
    /// Free swap space
    pub swap_free: u64,
    /// Anonymous pages, i.e. memory that only goes away when its owner dies
    pub anon_pages: u64,
    /// `mem_available + anon_pages`: what user processes can possibly use
    pub user_mem_total: u64,
    /// Percent of `user_mem_total` that is available
    pub mem_available_percent: f64,
    /// Percent of swap that is free. Zero when there is no swap at all.
    pub swap_free_percent: f64,
}

impl MemInfo {
    /// Build a snapshot and compute the derived fields.
    ///
    /// `anon_pages == None` means the kernel does not report AnonPages; the
    /// percentage is then taken against `mem_total`.
    pub fn new(
        mem_total: u64,
        mem_available: u64,
        swap_total: u64,
        swap_free: u64,
        anon_pages: Option<u64>,
    ) -> Self {
        let user_mem_total = match anon_pages {
            Some(anon) => mem_available + anon,
            None => mem_total,
        };

        let mem_available_percent = if user_mem_total == 0 {
            0.0
        } else {
            mem_available as f64 * 100.0 / user_mem_total as f64
        };

        let swap_free_percent = if swap_total == 0 {
            0.0
        } else {
            swap_free as f64 * 100.0 / swap_total as f64
        };

        Self {
            mem_total,
            mem_available,
            swap_total,
            swap_free,
            anon_pages: anon_pages.unwrap_or(0),
            user_mem_total,
            mem_available_percent,
            swap_free_percent,
        }
    }

    /// Parse the text of /proc/meminfo.
    ///
    /// Returns the snapshot and whether MemAvailable had to be estimated.
    pub fn parse(buf: &str) -> Result<(Self, bool)> {
        let mem_total = required_entry(buf, "MemTotal")?;
        let swap_total = required_entry(buf, "SwapTotal")?;
        let swap_free = required_entry(buf, "SwapFree")?;
        let anon_pages = entry(buf, "AnonPages")?;

        let (mem_available, guessed) = match entry(buf, "MemAvailable")? {
            Some(available) => (available, false),
            None => (available_guesstimate(buf)?, true),
        };

        Ok((
            Self::new(mem_total, mem_available, swap_total, swap_free, anon_pages),
            guessed,
        ))
    }

    /// Format memory size in human-readable format
    pub fn format_size(kib: u64) -> String {
        const MIB: u64 = 1024;
        const GIB: u64 = MIB * 1024;

        if kib >= GIB {
            format!("{:.2} GiB", kib as f64 / GIB as f64)
        } else if kib >= MIB {
            format!("{:.2} MiB", kib as f64 / MIB as f64)
        } else {
            format!("{kib} KiB")
        }
    }
}

impl std::fmt::Display for MemInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mem avail: {} of {} ({:.2}%), swap free: {} of {} ({:.2}%)",
            Self::format_size(self.mem_available),
            Self::format_size(self.user_mem_total),
            self.mem_available_percent,
            Self::format_size(self.swap_free),
            Self::format_size(self.swap_total),
            self.swap_free_percent,
        )
    }
}

/// Look up "Key:   1234 kB". `Ok(None)` if the key is absent.
fn entry(buf: &str, key: &str) -> Result<Option<u64>> {
    for line in buf.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != key {
            continue;
        }
        let value = rest
            .split_whitespace()
            .next()
            .with_context(|| format!("Missing value for {key}"))?;
        let value = value
            .parse()
            .with_context(|| format!("Failed to parse value for {key}: {value:?}"))?;
        return Ok(Some(value));
    }
    Ok(None)
}

fn required_entry(buf: &str, key: &str) -> Result<u64> {
    match entry(buf, key)? {
        Some(value) => Ok(value),
        None => bail!("Could not find {key:?} in meminfo"),
    }
}

/// Kernels before 3.14 do not export MemAvailable.
fn available_guesstimate(buf: &str) -> Result<u64> {
    let cached = required_entry(buf, "Cached")?;
    let free = required_entry(buf, "MemFree")?;
    let buffers = required_entry(buf, "Buffers")?;
    let shmem = required_entry(buf, "Shmem")?;

    Ok((free + cached + buffers).saturating_sub(shmem))
}

/// Re-reads /proc/meminfo through one open handle.
pub struct MemSampler {
    path: PathBuf,
    file: File,
    buf: String,
    guess_warned: bool,
}

impl MemSampler {
    /// Open /proc/meminfo
    pub fn new() -> Result<Self> {
        Self::with_path("/proc/meminfo")
    }

    /// Open a meminfo file at a specific path (for testing)
    pub fn with_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        Ok(Self {
            path,
            file,
            buf: String::with_capacity(8192),
            guess_warned: false,
        })
    }
}

impl MemorySource for MemSampler {
    fn sample(&mut self) -> Result<MemInfo> {
        self.buf.clear();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut self.buf))
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        if self.buf.is_empty() {
            bail!("{} is empty", self.path.display());
        }

        let (info, guessed) = MemInfo::parse(&self.buf)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        if guessed && !self.guess_warned {
            log::warn!(
                "Your kernel does not provide MemAvailable data (needs 3.14+), falling back to guesstimate"
            );
            self.guess_warned = true;
        }

        Ok(info)
    }
}
