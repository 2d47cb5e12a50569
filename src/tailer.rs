//! Tailer (spec §4.4): defends log lines against host-driven rotation of
//! the JSON-file driver's log path by hard-linking the file currently at
//! that path into the container's agent-owned spool the moment the host
//! swaps it out for a new inode.
//!
//! Grounded on `original_source/tail.go` (`tail`, `logRef.save`): a
//! 250ms poll comparing `stat` identity, not a `notify`-driven watch,
//! because the docker/containerd log path is rewritten in place (rename +
//! recreate, or copy-truncate) rather than receiving its own filesystem
//! events the way the containers directory itself does.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::governor::Governor;
use crate::shutdown::ShutdownRx;
use crate::spool;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

fn identity_of(path: &Path) -> std::io::Result<FileIdentity> {
    let meta = fs::metadata(path)?;
    Ok(FileIdentity { dev: meta.dev(), ino: meta.ino() })
}

struct Followed {
    spool_dir: PathBuf,
    last: FileIdentity,
}

/// Tracks every currently-live container log path and periodically checks
/// whether the host has rotated it out from under us.
pub struct Tailer {
    followed: Mutex<HashMap<PathBuf, Followed>>,
    governor: std::sync::Arc<Governor>,
}

impl Tailer {
    pub fn new(governor: std::sync::Arc<Governor>) -> Self {
        Tailer { followed: Mutex::new(HashMap::new()), governor }
    }

    /// Starts following `source`, capturing whatever is there right now
    /// into `spool_dir` if it isn't already linked.
    pub fn follow(&self, source: PathBuf, spool_dir: PathBuf) -> std::io::Result<()> {
        let last = identity_of(&source)?;
        self.capture(&source, &spool_dir)?;
        self.followed.lock().unwrap().insert(source, Followed { spool_dir, last });
        Ok(())
    }

    pub fn stop(&self, source: &Path) {
        self.followed.lock().unwrap().remove(source);
    }

    /// Capture policy (spec §4.4): enumerate `source`, `source.1`,
    /// `source.2`, … (the host's rotation scheme) until a candidate
    /// doesn't exist or is identity-equal to the spool's highest existing
    /// link, then hard-link whatever was found into the spool oldest
    /// first, starting at `last_index+1`. A single poll can therefore
    /// catch up on more than one rotation that happened between ticks,
    /// instead of only ever capturing the file currently at `source`.
    fn capture(&self, source: &Path, spool_dir: &Path) -> std::io::Result<()> {
        let logs = spool::list_logs(spool_dir)?;
        let mut next_ext = logs.last().and_then(|p| spool::ext_of(p)).map(|e| e + 1).unwrap_or(0);
        let last_captured = logs.last().map(|p| identity_of(p)).transpose()?;

        let mut found = Vec::new();
        let mut n = 0u32;
        loop {
            let candidate = if n == 0 { source.to_path_buf() } else { rotated_path(source, n) };
            let id = match identity_of(&candidate) {
                Ok(id) => id,
                Err(_) => break,
            };
            if Some(id) == last_captured {
                break;
            }
            found.push(candidate);
            n += 1;
        }

        for candidate in found.into_iter().rev() {
            let dest = spool::log_path(spool_dir, next_ext);
            tracing::info!(source = %candidate.display(), dest = %dest.display(), "capturing rotated log file");
            fs::hard_link(&candidate, &dest)?;
            self.governor.after_link(spool_dir);
            next_ext += 1;
        }
        Ok(())
    }

    /// Runs the 250ms poll loop until shutdown is signaled.
    pub async fn run(&self, mut shutdown: ShutdownRx) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.signaled() => return,
                _ = ticker.tick() => self.poll_once(),
            }
        }
    }

    fn poll_once(&self) {
        let mut followed = self.followed.lock().unwrap();
        for (source, entry) in followed.iter_mut() {
            let current = match identity_of(source) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(source = %source.display(), error = %e, "failed to stat followed log file");
                    continue;
                }
            };
            if current != entry.last {
                entry.last = current;
                if let Err(e) = self.capture(source, &entry.spool_dir) {
                    tracing::warn!(source = %source.display(), error = %e, "failed to capture rotated log file");
                }
            }
        }
    }
}

fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    Ok(identity_of(a)? == identity_of(b)?)
}

/// The host's rotation naming: `source.1`, `source.2`, … appended after
/// the current, un-suffixed path (spec §4.4).
fn rotated_path(source: &Path, n: u32) -> PathBuf {
    let mut s = source.as_os_str().to_os_string();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{Governor, NumFilesRegistry, ParserRegistry};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn governor() -> Arc<Governor> {
        Arc::new(Governor::new(3, 10, Arc::new(NumFilesRegistry::new()), Arc::new(ParserRegistry::new())))
    }

    #[test]
    fn follow_links_current_file() {
        let src_dir = tempdir().unwrap();
        let spool_dir = tempdir().unwrap();
        let source = src_dir.path().join("a.log");
        fs::write(&source, b"hello\n").unwrap();

        let tailer = Tailer::new(governor());
        tailer.follow(source.clone(), spool_dir.path().to_path_buf()).unwrap();

        let logs = spool::list_logs(spool_dir.path()).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(same_file(&logs[0], &source).unwrap());
    }

    #[test]
    fn repeated_capture_of_same_file_is_noop() {
        let src_dir = tempdir().unwrap();
        let spool_dir = tempdir().unwrap();
        let source = src_dir.path().join("a.log");
        fs::write(&source, b"hello\n").unwrap();

        let tailer = Tailer::new(governor());
        tailer.follow(source.clone(), spool_dir.path().to_path_buf()).unwrap();
        tailer.capture(&source, spool_dir.path()).unwrap();
        assert_eq!(spool::list_logs(spool_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn rotation_captures_new_file_under_next_ext() {
        let src_dir = tempdir().unwrap();
        let spool_dir = tempdir().unwrap();
        let source = src_dir.path().join("a.log");
        fs::write(&source, b"first\n").unwrap();

        let tailer = Tailer::new(governor());
        tailer.follow(source.clone(), spool_dir.path().to_path_buf()).unwrap();

        fs::remove_file(&source).unwrap();
        fs::write(&source, b"second\n").unwrap();
        tailer.poll_once();

        let logs = spool::list_logs(spool_dir.path()).unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn multiple_rotations_between_polls_are_all_captured() {
        let src_dir = tempdir().unwrap();
        let spool_dir = tempdir().unwrap();
        let source = src_dir.path().join("a.log");
        fs::write(&source, b"first\n").unwrap();

        let tailer = Tailer::new(governor());
        tailer.follow(source.clone(), spool_dir.path().to_path_buf()).unwrap();

        // Two rotations happen before the next poll: the host renames the
        // captured file aside twice and writes a fresh one at `source`.
        fs::rename(&source, rotated_path(&source, 2)).unwrap();
        fs::write(src_dir.path().join("a.log.1"), b"second\n").unwrap();
        fs::rename(src_dir.path().join("a.log.1"), rotated_path(&source, 1)).unwrap();
        fs::write(&source, b"third\n").unwrap();
        tailer.poll_once();

        let logs = spool::list_logs(spool_dir.path()).unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(fs::read_to_string(&logs[0]).unwrap(), "first\n");
        assert_eq!(fs::read_to_string(&logs[1]).unwrap(), "second\n");
        assert_eq!(fs::read_to_string(&logs[2]).unwrap(), "third\n");
    }
}
