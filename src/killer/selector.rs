// Victim selection
//
// One pass over /proc. Each pid is checked cheapest-first and fields are
// only read when they can still change the outcome: the full command line
// and owner are fetched for the winner alone.

use crate::config::Config;
use crate::monitor::{PidStat, ProcReader, Unavailable};
use anyhow::Result;
use regex::Regex;
use std::cmp::Ordering;

/// Pids at or below this are never killed (init)
pub const PROTECTED_PID_FLOOR: i32 = 1;

/// oom_score_adj value meaning "never kill me"
pub const OOM_SCORE_ADJ_MIN: i32 = -1000;

/// A process under consideration. `None` fields have not been read yet.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub pid: i32,
    pub stat: Option<PidStat>,
    pub oom_score_adj: Option<i32>,
    pub uid: Option<u32>,
    pub name: Option<String>,
    /// oom_score after adjustments and prefer/avoid bonus
    pub badness: i32,
    /// RSS in KiB after the prefer/avoid bonus (can go negative)
    pub rss_score: i64,
    /// Real RSS in KiB
    pub rss_kib: u64,
}

impl Candidate {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }
}

/// The process picked for killing, with display fields filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub pid: i32,
    pub uid: u32,
    pub badness: i32,
    pub oom_score_adj: i32,
    pub rss_kib: u64,
    pub name: String,
    pub cmdline: String,
}

impl std::fmt::Display for Victim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "process {} uid {} \"{}\": badness {}, VmRSS {} MiB",
            self.pid,
            self.uid,
            self.name,
            self.badness,
            self.rss_kib / 1024
        )
    }
}

/// Applies filters and picks the process with the highest badness
pub struct VictimSelector<'a> {
    config: &'a Config,
    reader: &'a ProcReader,
    self_pid: i32,
}

impl<'a> VictimSelector<'a> {
    pub fn new(config: &'a Config, reader: &'a ProcReader) -> Self {
        Self {
            config,
            reader,
            self_pid: std::process::id() as i32,
        }
    }

    /// Pretend to be another pid (for testing)
    pub const fn with_self_pid(mut self, pid: i32) -> Self {
        self.self_pid = pid;
        self
    }

    /// Scan every process and return the worst offender.
    ///
    /// `Ok(None)` means nothing qualified. Errors only come from listing the
    /// proc root itself.
    pub fn select(&self) -> Result<Option<Victim>> {
        let mut best: Option<Candidate> = None;

        for pid in self.reader.pids()? {
            if let Some(candidate) = self.challenge(pid, best.as_ref()) {
                log::debug!(
                    "pid {:>7}: badness {:>4} VmRSS {:>8} KiB  ^ new victim",
                    candidate.pid,
                    candidate.badness,
                    candidate.rss_kib
                );
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            return Ok(None);
        };

        if best.pid == self.self_pid {
            log::warn!(
                "Selected myself (pid {}) as victim. Can we see other processes? Check for hidepid or pid namespaces.",
                best.pid
            );
            return Ok(None);
        }

        Ok(Some(self.fill_victim(best)))
    }

    /// Read `pid` just far enough to know whether it beats `best`.
    /// Returns the populated candidate on a strict win.
    fn challenge(&self, pid: i32, best: Option<&Candidate>) -> Option<Candidate> {
        match self.evaluate(pid, best) {
            Ok(candidate) => candidate,
            Err(Unavailable::Gone) => {
                log::trace!("pid {pid}: exited while scanning");
                None
            }
            Err(reason) => {
                log::debug!("pid {pid}: skipped, {reason:?}");
                None
            }
        }
    }

    fn evaluate(
        &self,
        pid: i32,
        best: Option<&Candidate>,
    ) -> Result<Option<Candidate>, Unavailable> {
        let reader = self.reader;
        let mut cur = Candidate::new(pid);

        if pid <= PROTECTED_PID_FLOOR {
            return Ok(None);
        }

        if self.config.ignore_root_user {
            let uid = reader.uid(pid)?;
            if uid == 0 {
                return Ok(None);
            }
            cur.uid = Some(uid);
        }

        let stat = reader.stat(pid)?;
        if stat.is_kernel_thread(pid) || stat.rss_pages == 0 || !stat.is_alive() {
            return Ok(None);
        }
        cur.stat = Some(stat);
        cur.rss_kib = reader.pages_to_kib(stat.rss_pages);
        cur.rss_score = cur.rss_kib as i64;

        cur.badness = reader.oom_score(pid)?;
        if self.config.ignore_oom_score_adj {
            let adj = reader.oom_score_adj(pid)?;
            if adj > 0 {
                cur.badness -= adj;
            }
            cur.oom_score_adj = Some(adj);
        }

        if self.config.has_name_patterns() {
            let name = reader.name(pid)?;
            if matches_any(&self.config.ignore, &name) {
                log::trace!("pid {pid}: \"{name}\" matches --ignore");
                return Ok(None);
            }
            if matches_any(&self.config.prefer, &name) {
                self.apply_bonus(&mut cur, 1);
            }
            if matches_any(&self.config.avoid, &name) {
                self.apply_bonus(&mut cur, -1);
            }
            cur.name = Some(name);
        }

        if let Some(best) = best {
            if self.compare(&cur, best) != Ordering::Greater {
                return Ok(None);
            }
        }

        let adj = match cur.oom_score_adj {
            Some(adj) => adj,
            None => reader.oom_score_adj(pid)?,
        };
        if adj == OOM_SCORE_ADJ_MIN {
            log::trace!("pid {pid}: oom_score_adj {OOM_SCORE_ADJ_MIN}, never killing it");
            return Ok(None);
        }
        cur.oom_score_adj = Some(adj);

        Ok(Some(cur))
    }

    /// Shift the sort key by the configured bonus. `sign` is 1 or -1.
    fn apply_bonus(&self, cur: &mut Candidate, sign: i32) {
        if self.config.sort_by_rss {
            cur.rss_score += i64::from(sign) * self.config.prefer_rss_bonus_kib as i64;
        } else {
            cur.badness += sign * self.config.prefer_badness_bonus;
        }
    }

    /// Primary key badness, RSS breaks ties. Swapped with --sort-by-rss.
    fn compare(&self, cur: &Candidate, best: &Candidate) -> Ordering {
        if self.config.sort_by_rss {
            cur.rss_score
                .cmp(&best.rss_score)
                .then(cur.badness.cmp(&best.badness))
        } else {
            cur.badness
                .cmp(&best.badness)
                .then(cur.rss_score.cmp(&best.rss_score))
        }
    }

    /// Fill in the fields only the winner needs. The process may have
    /// exited in the meantime; the kill then simply fails with ESRCH.
    fn fill_victim(&self, best: Candidate) -> Victim {
        let pid = best.pid;
        let uid = best.uid.or_else(|| self.reader.uid(pid).ok()).unwrap_or(0);
        let name = best
            .name
            .or_else(|| self.reader.name(pid).ok())
            .unwrap_or_default();
        let cmdline = self.reader.cmdline(pid).unwrap_or_default();

        Victim {
            pid,
            uid,
            badness: best.badness,
            oom_score_adj: best.oom_score_adj.unwrap_or(0),
            rss_kib: best.rss_kib,
            name,
            cmdline,
        }
    }
}

/// Check if name matches any of the given patterns
fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|p| p.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PREFER_BADNESS_BONUS;
    use crate::testing::{write_mock_proc, MockProc};
    use tempfile::TempDir;

    fn mock_root(procs: &[MockProc]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for proc in procs {
            write_mock_proc(dir.path(), proc);
        }
        dir
    }

    fn select(config: &Config, dir: &TempDir) -> Option<Victim> {
        let reader = ProcReader::with_root(dir.path());
        VictimSelector::new(config, &reader)
            .with_self_pid(999_999)
            .select()
            .unwrap()
    }

    #[test]
    fn test_highest_badness_wins() {
        let dir = mock_root(&[
            MockProc::scored(100, 100, 5000),
            MockProc::scored(101, 400, 1000),
            MockProc::scored(102, 200, 9000),
        ]);
        let victim = select(&Config::default(), &dir).unwrap();
        assert_eq!(victim.pid, 101);
        assert_eq!(victim.badness, 400);
        assert_eq!(victim.name, "proc101");
        assert_eq!(victim.cmdline, "/usr/bin/proc101 --flag");
    }

    #[test]
    fn test_equal_badness_larger_rss_wins() {
        let dir = mock_root(&[
            MockProc::scored(100, 300, 1000),
            MockProc::scored(101, 300, 2000),
            MockProc::scored(102, 300, 1500),
        ]);
        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 101);
    }

    #[test]
    fn test_full_tie_keeps_incumbent() {
        let dir = mock_root(&[MockProc::scored(100, 300, 1000), MockProc::scored(101, 300, 1000)]);
        let config = Config::default();
        let reader = ProcReader::with_root(dir.path());
        let selector = VictimSelector::new(&config, &reader);

        let incumbent = selector.challenge(100, None).unwrap();
        assert!(selector.challenge(101, Some(&incumbent)).is_none());

        // Whichever pid the directory listing yields first stays
        let first = reader.pids().unwrap()[0];
        assert_eq!(select(&config, &dir).unwrap().pid, first);
    }

    #[test]
    fn test_protected_pids_never_selected() {
        let mut init = MockProc::scored(1, 1000, 100_000);
        init.ppid = 0;
        let mut kthreadd = MockProc::scored(2, 1000, 100_000);
        kthreadd.ppid = 0;
        let dir = mock_root(&[init, kthreadd, MockProc::scored(500, 10, 10)]);

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 500);
    }

    #[test]
    fn test_only_init_means_no_victim() {
        let dir = mock_root(&[MockProc::scored(1, 1000, 100_000)]);
        assert!(select(&Config::default(), &dir).is_none());
    }

    #[test]
    fn test_kernel_threads_and_zero_rss_skipped() {
        let mut kworker = MockProc::scored(50, 900, 100);
        kworker.ppid = 2;
        let no_rss = MockProc::scored(51, 800, 0);
        let dir = mock_root(&[kworker, no_rss, MockProc::scored(52, 1, 1)]);

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 52);
    }

    #[test]
    fn test_zombie_skipped() {
        let mut zombie = MockProc::scored(60, 900, 100);
        zombie.state = 'Z';
        let dir = mock_root(&[zombie, MockProc::scored(61, 1, 1)]);

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 61);
    }

    #[test]
    fn test_oom_score_adj_sentinel_excluded() {
        let mut protected = MockProc::scored(70, 1000, 100_000);
        protected.oom_score_adj = OOM_SCORE_ADJ_MIN;
        let dir = mock_root(&[protected, MockProc::scored(71, 5, 5)]);

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 71);
    }

    #[test]
    fn test_unreadable_candidate_falls_through() {
        let broken = MockProc::scored(75, 900, 50_000);
        let dir = mock_root(&[broken, MockProc::scored(76, 10, 10)]);
        std::fs::write(dir.path().join("75/oom_score"), "not a number\n").unwrap();

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 76);
    }

    #[test]
    fn test_ignore_oom_score_adj() {
        let mut boosted = MockProc::scored(80, 700, 100);
        boosted.oom_score_adj = 600;
        let dir = mock_root(&[boosted, MockProc::scored(81, 300, 100)]);

        assert_eq!(select(&Config::default(), &dir).unwrap().pid, 80);

        let config = Config {
            ignore_oom_score_adj: true,
            ..Config::default()
        };
        let victim = select(&config, &dir).unwrap();
        assert_eq!(victim.pid, 81);
        assert_eq!(victim.badness, 300);
    }

    #[test]
    fn test_self_selection_is_discarded() {
        let dir = mock_root(&[MockProc::scored(4000, 900, 100), MockProc::scored(4001, 10, 10)]);
        let config = Config::default();
        let reader = ProcReader::with_root(dir.path());

        let victim = VictimSelector::new(&config, &reader)
            .with_self_pid(4000)
            .select()
            .unwrap();
        assert!(victim.is_none());
    }

    #[test]
    fn test_prefer_pattern() {
        let mut chrome = MockProc::scored(100, 10, 100);
        chrome.comm = "chrome".to_string();
        let mut firefox = MockProc::scored(101, 200, 100);
        firefox.comm = "firefox".to_string();
        let dir = mock_root(&[chrome, firefox]);

        let config = Config {
            prefer: vec![Regex::new("^chrome$").unwrap()],
            ..Config::default()
        };
        let victim = select(&config, &dir).unwrap();
        assert_eq!(victim.pid, 100);
        assert_eq!(victim.badness, 10 + DEFAULT_PREFER_BADNESS_BONUS);
    }

    #[test]
    fn test_avoid_pattern() {
        let mut important = MockProc::scored(100, 250, 100);
        important.comm = "important-app".to_string();
        let mut regular = MockProc::scored(101, 50, 100);
        regular.comm = "regular-app".to_string();
        let dir = mock_root(&[important, regular]);

        let config = Config {
            avoid: vec![Regex::new("important").unwrap()],
            ..Config::default()
        };
        assert_eq!(select(&config, &dir).unwrap().pid, 101);
    }

    #[test]
    fn test_ignore_pattern() {
        let mut firefox = MockProc::scored(100, 900, 100);
        firefox.comm = "firefox".to_string();
        let dir = mock_root(&[firefox, MockProc::scored(101, 1, 1)]);

        let config = Config {
            ignore: vec![Regex::new("^firefox$").unwrap()],
            ..Config::default()
        };
        assert_eq!(select(&config, &dir).unwrap().pid, 101);
    }

    #[test]
    fn test_sort_by_rss() {
        let small = MockProc::scored(100, 900, 10);
        let large = MockProc::scored(101, 10, 10_000);
        let dir = mock_root(&[small, large]);

        let config = Config {
            sort_by_rss: true,
            ..Config::default()
        };
        assert_eq!(select(&config, &dir).unwrap().pid, 101);
    }

    #[test]
    fn test_sort_by_rss_prefer_uses_rss_bonus() {
        let mut small = MockProc::scored(100, 1, 10);
        small.comm = "victim".to_string();
        let large = MockProc::scored(101, 1, 10_000);
        let dir = mock_root(&[small, large]);

        let config = Config {
            sort_by_rss: true,
            prefer: vec![Regex::new("^victim$").unwrap()],
            ..Config::default()
        };
        let victim = select(&config, &dir).unwrap();
        assert_eq!(victim.pid, 100);
        // Bonus only moves the sort key, not the reported RSS
        assert_eq!(victim.badness, 1);
    }

    #[test]
    fn test_ignore_root_user() {
        // Mock directories are owned by whoever runs the tests
        let dir = mock_root(&[MockProc::scored(100, 100, 100)]);
        let config = Config {
            ignore_root_user: true,
            ..Config::default()
        };
        let running_as_root = nix::unistd::geteuid().is_root();
        assert_eq!(select(&config, &dir).is_none(), running_as_root);
    }

    #[test]
    fn test_empty_proc_root() {
        let dir = TempDir::new().unwrap();
        assert!(select(&Config::default(), &dir).is_none());
    }
}
