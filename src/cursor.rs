//! The per-spool `.pos` cursor file: a 16-byte big-endian `(ext: u64, pos:
//! u64)` pair, persisted with a single positional overwrite at offset 0
//! (spec §4.1). Grounded on `original_source/records.go` (`cursor`,
//! `newCursor`, `commit`, `delete`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::spool;

pub(crate) const CURSOR_FILE: &str = ".pos";

/// Reads `dir/.pos` for a parser's own initial resume point, without
/// opening the file for writing or pruning anything. Returns `(-1, 0)`
/// when no valid 16-byte checkpoint exists yet, so the caller falls back
/// to `(first available log, 0)` — mirrors the original's direct
/// `ioutil.ReadFile(".pos")` in `parseLogs`.
pub fn read_checkpoint(dir: &Path) -> (i64, u64) {
    match std::fs::read(dir.join(CURSOR_FILE)) {
        Ok(b) if b.len() == 16 => (
            i64::from_be_bytes(b[0..8].try_into().unwrap()),
            u64::from_be_bytes(b[8..16].try_into().unwrap()),
        ),
        _ => (-1, 0),
    }
}

/// Owns the open `.pos` file handle for one spool directory and tracks the
/// last value written to disk (`committed`) versus the value observed from
/// the most recently received [`crate::record::Record`] (`pending`).
pub struct Cursor {
    dir: PathBuf,
    file: File,
    committed: (i64, u64),
    pending: (i64, u64),
}

impl Cursor {
    /// Opens (creating if absent) `dir/.pos`, prunes any `log.<N>` files
    /// already fully committed by a prior run, and returns the cursor
    /// positioned at the last committed `(ext, pos)`.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(CURSOR_FILE);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut buf = [0u8; 16];
        let committed = match file.read_exact(&mut buf) {
            Ok(()) => (i64::from_be_bytes(buf[0..8].try_into().unwrap()), u64::from_be_bytes(buf[8..16].try_into().unwrap())),
            Err(_) => (0, 0),
        };
        prune_committed_logs(dir, 0, committed.0)?;
        Ok(Cursor { dir: dir.to_path_buf(), file, committed, pending: committed })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records the position a just-emitted (or termination) record
    /// reached. Does not touch disk.
    pub fn advance(&mut self, ext: i64, pos: u64) {
        self.pending = (ext, pos);
    }

    pub fn pending(&self) -> (i64, u64) {
        self.pending
    }

    /// Persists `pending` if it differs from `committed`, then prunes any
    /// `log.<N>` files it has rendered obsolete. Returns `true` if the
    /// spool is now fully drained and terminated and should be dropped
    /// from the registry (pending ext == -1).
    pub fn commit(&mut self) -> std::io::Result<bool> {
        if self.pending == self.committed {
            return Ok(false);
        }
        if self.pending.0 != -1 {
            let mut bytes = [0u8; 16];
            bytes[0..8].copy_from_slice(&self.pending.0.to_be_bytes());
            bytes[8..16].copy_from_slice(&self.pending.1.to_be_bytes());
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&bytes)?;
        }
        let old_ext = self.committed.0;
        self.committed = self.pending;
        if self.pending.0 == -1 {
            tracing::info!(dir = %self.dir.display(), "spool fully drained, removing");
            std::fs::remove_dir_all(&self.dir)?;
            return Ok(true);
        }
        prune_committed_logs(&self.dir, old_ext, self.pending.0)?;
        Ok(false)
    }
}

/// Removes `log.<i>` for `old_ext <= i < new_ext`: everything fully
/// consumed by the new checkpoint.
fn prune_committed_logs(dir: &Path, old_ext: i64, new_ext: i64) -> std::io::Result<()> {
    let mut i = old_ext;
    while i < new_ext {
        let path = spool::log_path(dir, i);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_cursor_starts_at_zero() {
        let dir = tempdir().unwrap();
        let cur = Cursor::open(dir.path()).unwrap();
        assert_eq!(cur.pending, (0, 0));
    }

    #[test]
    fn commit_persists_and_reopens() {
        let dir = tempdir().unwrap();
        {
            let mut cur = Cursor::open(dir.path()).unwrap();
            cur.advance(2, 128);
            assert!(!cur.commit().unwrap());
        }
        let cur = Cursor::open(dir.path()).unwrap();
        assert_eq!(cur.committed, (2, 128));
    }

    #[test]
    fn commit_prunes_consumed_logs() {
        let dir = tempdir().unwrap();
        std::fs::write(spool::log_path(dir.path(), 0), b"x").unwrap();
        std::fs::write(spool::log_path(dir.path(), 1), b"y").unwrap();
        let mut cur = Cursor::open(dir.path()).unwrap();
        cur.advance(2, 0);
        cur.commit().unwrap();
        assert!(!spool::log_path(dir.path(), 0).exists());
        assert!(!spool::log_path(dir.path(), 1).exists());
    }

    #[test]
    fn termination_commit_removes_whole_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let mut cur = Cursor::open(&path).unwrap();
        cur.advance(-1, 0);
        assert!(cur.commit().unwrap());
        assert!(!path.exists());
    }
}
