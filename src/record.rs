//! The record/doc data model (spec §3): what flows from a `Parser` through
//! the `RecordsHub` to the `Exporter`.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// A single parsed log entry bound for the bulk exporter, or the sentinel
/// (`ext == -1`) a `Parser` sends once it has drained a terminated spool.
#[derive(Debug, Clone)]
pub struct Record {
    /// The spool directory this record was parsed from.
    pub dir: PathBuf,
    /// Sequence number of the `log.<ext>` file the record's last line was
    /// read from. `-1` marks the termination sentinel.
    pub ext: i64,
    /// Byte offset immediately following the last line consumed into this
    /// record (i.e. where the cursor should resume after this record is
    /// durably exported).
    pub pos: u64,
    /// `None` for the termination sentinel; `Some` otherwise.
    pub doc: Option<Map<String, Value>>,
}

impl Record {
    pub fn termination(dir: PathBuf) -> Self {
        Record { dir, ext: -1, pos: 0, doc: None }
    }

    pub fn is_termination(&self) -> bool {
        self.ext < 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
