//! Records Hub (spec §4.6): the single channel every parser feeds into,
//! plus the per-spool cursor registry that turns "a record was received"
//! into "the spool's on-disk checkpoint should advance".
//!
//! Grounded on `original_source/records.go` (`records`, `next`, `commit`):
//! a termination record (`ext == -1`) updates the cursor but is never
//! handed back to the caller — the loop in `next()` simply continues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cursor::Cursor;
use crate::record::Record;

/// Default channel capacity between parsers and the exporter (spec §4.6).
pub const CHANNEL_CAPACITY: usize = 8000;

pub fn channel() -> (mpsc::Sender<Record>, mpsc::Receiver<Record>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

pub struct RecordsHub {
    rx: mpsc::Receiver<Record>,
    cursors: HashMap<PathBuf, Cursor>,
}

impl RecordsHub {
    pub fn new(rx: mpsc::Receiver<Record>) -> Self {
        RecordsHub { rx, cursors: HashMap::new() }
    }

    /// Waits up to `timeout` for the next exportable record. Internally
    /// loops past termination sentinels (which only update the cursor)
    /// and past a closed/empty channel within the timeout window.
    /// Returns `None` on timeout or if every parser has exited.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Record> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let rec = match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(rec)) => rec,
                Ok(None) | Err(_) => return None,
            };
            let cursor = match self.cursors.entry(rec.dir.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let c = match Cursor::open(&rec.dir) {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::error!(dir = %rec.dir.display(), error = %e, "failed to open cursor, dropping record");
                            continue;
                        }
                    };
                    v.insert(c)
                }
            };
            cursor.advance(rec.ext, rec.pos);
            if rec.is_termination() {
                continue;
            }
            return Some(rec);
        }
    }

    /// Persists every cursor whose pending position has advanced since
    /// the last commit, pruning consumed `log.<N>` files (and the whole
    /// spool directory once a termination has been committed).
    pub fn commit(&mut self) {
        self.cursors.retain(|dir, cursor| match cursor.commit() {
            Ok(finished) => !finished,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "failed to persist cursor");
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::tempdir;

    #[tokio::test]
    async fn termination_updates_cursor_without_surfacing_record() {
        let dir = tempdir().unwrap();
        let (tx, rx) = channel();
        let mut hub = RecordsHub::new(rx);

        tx.send(Record::termination(dir.path().to_path_buf())).await.unwrap();
        let got = hub.recv(Duration::from_millis(200)).await;
        assert!(got.is_none());
        hub.commit();
        assert!(!dir.path().exists());
    }

    #[tokio::test]
    async fn regular_record_is_returned_and_cursor_committed() {
        let dir = tempdir().unwrap();
        std::fs::write(crate::spool::log_path(dir.path(), 0), b"hi\n").unwrap();
        let (tx, rx) = channel();
        let mut hub = RecordsHub::new(rx);

        tx.send(Record { dir: dir.path().to_path_buf(), ext: 0, pos: 3, doc: Some(Map::new()) }).await.unwrap();
        let got = hub.recv(Duration::from_millis(200)).await;
        assert!(got.is_some());
        hub.commit();

        let saved = crate::cursor::read_checkpoint(dir.path());
        assert_eq!(saved, (0, 3));
    }

    #[tokio::test]
    async fn recv_times_out_on_empty_channel() {
        let (_tx, rx) = channel();
        let mut hub = RecordsHub::new(rx);
        let got = hub.recv(Duration::from_millis(50)).await;
        assert!(got.is_none());
    }
}
