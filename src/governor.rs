//! Disk-Pressure Governor (spec §4.7): a node-wide budget on how many
//! spooled `log.<N>` files may exist across every container at once,
//! independent of the per-container `max_docker_files` quota the host
//! itself would otherwise enforce.
//!
//! Grounded on `original_source/containers.go`'s `numFiles`/
//! `maxDockerFiles`/`maxFiles` globals, generalized from a single mutex'd
//! `map[string]int` into a small registry plus an eviction-notification
//! channel per spool (the original has no node-wide eviction path; ours
//! adds one because spec §4.7 requires it).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Tracks, per spool directory, how many `log.<N>` files currently exist
/// and whether the spool has been marked terminated (which lowers its
/// live quota to 1 — the end sentinel itself).
pub struct NumFilesRegistry(Mutex<HashMap<PathBuf, (usize, bool)>>);

impl NumFilesRegistry {
    pub fn new() -> Self {
        NumFilesRegistry(Mutex::new(HashMap::new()))
    }

    pub fn set(&self, dir: &Path, count: usize) {
        self.0.lock().unwrap().entry(dir.to_path_buf()).or_insert((0, false)).0 = count;
    }

    pub fn increment(&self, dir: &Path) {
        self.0.lock().unwrap().entry(dir.to_path_buf()).or_insert((0, false)).0 += 1;
    }

    pub fn decrement(&self, dir: &Path) {
        if let Some(entry) = self.0.lock().unwrap().get_mut(dir) {
            entry.0 = entry.0.saturating_sub(1);
        }
    }

    pub fn mark_terminated(&self, dir: &Path) {
        self.0.lock().unwrap().entry(dir.to_path_buf()).or_insert((0, false)).1 = true;
    }

    pub fn remove(&self, dir: &Path) {
        self.0.lock().unwrap().remove(dir);
    }

    /// `(dir, excess)` for every spool currently over its live quota,
    /// largest excess first.
    fn excesses(&self, max_docker_files: usize) -> Vec<(PathBuf, usize)> {
        let mut out: Vec<_> = self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(dir, &(count, terminated))| {
                let quota = if terminated { 1 } else { max_docker_files };
                let excess = count.saturating_sub(quota);
                (excess > 0).then(|| (dir.clone(), excess))
            })
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    fn total_excess(&self, max_docker_files: usize) -> usize {
        self.excesses(max_docker_files).iter().map(|(_, e)| e).sum()
    }
}

/// Non-blocking, best-effort notification channels per spool: a bounded
/// channel a parser drains to learn it must re-synchronize past a file
/// the governor deleted out from under it (`evicted`), and another it
/// drains to learn the tailer just linked a new `log.<N>` in while it was
/// asleep in WAIT_DATA (`added`, spec §4.5's "file added" probe). Both are
/// tolerant of a parser that has already exited (send simply fails and is
/// ignored).
pub struct ParserRegistry(Mutex<HashMap<PathBuf, ParserChannels>>);

struct ParserChannels {
    evicted: mpsc::Sender<()>,
    added: mpsc::Sender<()>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        ParserRegistry(Mutex::new(HashMap::new()))
    }

    pub fn register(&self, dir: PathBuf, evicted_tx: mpsc::Sender<()>, added_tx: mpsc::Sender<()>) {
        self.0.lock().unwrap().insert(dir, ParserChannels { evicted: evicted_tx, added: added_tx });
    }

    pub fn unregister(&self, dir: &Path) {
        self.0.lock().unwrap().remove(dir);
    }

    fn notify_evicted(&self, dir: &Path) {
        if let Some(c) = self.0.lock().unwrap().get(dir) {
            let _ = c.evicted.try_send(());
        }
    }

    /// Wakes a parser sleeping in WAIT_DATA because the tailer just linked
    /// a new file into its spool.
    pub fn notify_added(&self, dir: &Path) {
        if let Some(c) = self.0.lock().unwrap().get(dir) {
            let _ = c.added.try_send(());
        }
    }
}

pub struct Governor {
    max_docker_files: usize,
    max_files: usize,
    numfiles: std::sync::Arc<NumFilesRegistry>,
    parsers: std::sync::Arc<ParserRegistry>,
}

impl Governor {
    pub fn new(max_docker_files: usize, max_files: usize, numfiles: std::sync::Arc<NumFilesRegistry>, parsers: std::sync::Arc<ParserRegistry>) -> Self {
        Governor { max_docker_files, max_files, numfiles, parsers }
    }

    pub fn numfiles(&self) -> &std::sync::Arc<NumFilesRegistry> {
        &self.numfiles
    }

    pub fn parsers(&self) -> &std::sync::Arc<ParserRegistry> {
        &self.parsers
    }

    /// Called by the tailer after every successful hard-link capture.
    /// Wakes a parser that may be asleep in WAIT_DATA, then enforces the
    /// node-wide budget, evicting the oldest file of the most-over-quota
    /// spool(s) until back under `max_files`.
    pub fn after_link(&self, dir: &Path) {
        self.numfiles.increment(dir);
        self.parsers.notify_added(dir);
        self.enforce();
    }

    fn enforce(&self) {
        while self.numfiles.total_excess(self.max_docker_files) > self.max_files {
            let Some((dir, _)) = self.numfiles.excesses(self.max_docker_files).into_iter().next() else { break };
            match crate::spool::list_logs(&dir) {
                Ok(logs) if !logs.is_empty() => {
                    let victim = &logs[0];
                    tracing::warn!(dir = %dir.display(), file = %victim.display(), "disk pressure: evicting oldest spooled file");
                    if std::fs::remove_file(victim).is_ok() {
                        self.numfiles.decrement(&dir);
                        self.parsers.notify_evicted(&dir);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn evicts_oldest_file_from_most_over_quota_spool() {
        let dir = tempdir().unwrap();
        for ext in 0..6 {
            std::fs::write(crate::spool::log_path(dir.path(), ext), b"x").unwrap();
        }
        let numfiles = Arc::new(NumFilesRegistry::new());
        numfiles.set(dir.path(), 6);
        let parsers = Arc::new(ParserRegistry::new());
        let gov = Governor::new(3, 2, numfiles.clone(), parsers);
        gov.enforce();
        let remaining = crate::spool::list_logs(dir.path()).unwrap();
        assert!(remaining.len() < 6);
    }

    #[test]
    fn within_budget_evicts_nothing() {
        let dir = tempdir().unwrap();
        std::fs::write(crate::spool::log_path(dir.path(), 0), b"x").unwrap();
        let numfiles = Arc::new(NumFilesRegistry::new());
        numfiles.set(dir.path(), 1);
        let parsers = Arc::new(ParserRegistry::new());
        let gov = Governor::new(3, 10, numfiles, parsers);
        gov.enforce();
        assert_eq!(crate::spool::list_logs(dir.path()).unwrap().len(), 1);
    }
}
