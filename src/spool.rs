//! Spool Layout (spec §4.1): one directory per container holding a
//! monotonically-numbered sequence of `log.<N>` hard-linked files, a
//! `.k8s` metadata blob, and a `.terminated` sentinel once the source
//! container is gone.
//!
//! Grounded on `original_source/logdir.go` (`getLogFiles`, `IsEndFile`,
//! `markTerminated`, `hasLogs`, `createMetadataFile`) and `util.go`
//! (`extInt`, `glob`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

pub const TERMINATED_SENTINEL: &str = ".terminated";
pub const METADATA_FILE: &str = ".k8s";
const METADATA_FILE_LEGACY: &str = "k8s";
const END_CONTENTS: &[u8] = b"END\n";

/// Lists `log.<N>` files in `dir`, sorted by ascending numeric suffix.
pub fn list_logs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(ext) = name.strip_prefix("log.") {
            if ext.parse::<i64>().is_ok() {
                logs.push(entry.path());
            }
        }
    }
    logs.sort_by_key(|p| ext_of(p).unwrap_or(i64::MAX));
    Ok(logs)
}

/// Numeric suffix of a `log.<N>` path.
pub fn ext_of(path: &Path) -> Option<i64> {
    path.file_name()?.to_str()?.strip_prefix("log.")?.parse().ok()
}

pub fn log_path(dir: &Path, ext: i64) -> PathBuf {
    dir.join(format!("log.{ext}"))
}

pub fn next_log_path(current: &Path) -> PathBuf {
    let ext = ext_of(current).expect("log.<N> path");
    log_path(current.parent().expect("log file has a parent dir"), ext + 1)
}

/// True if `path` is exactly the 4-byte `END\n` terminal sentinel.
pub fn is_end_file(path: &Path) -> io::Result<bool> {
    let meta = fs::metadata(path)?;
    if meta.len() != END_CONTENTS.len() as u64 {
        return Ok(false);
    }
    Ok(fs::read(path)? == END_CONTENTS)
}

/// True if `dir` still has data worth parsing: at least one `log.<N>` file
/// that isn't the lone file of an already-terminated, fully-drained spool.
pub fn has_logs(dir: &Path) -> io::Result<bool> {
    let logs = list_logs(dir)?;
    if logs.is_empty() {
        return Ok(false);
    }
    if logs.len() == 1 && dir.join(TERMINATED_SENTINEL).exists() {
        return Ok(false);
    }
    Ok(true)
}

/// Marks `dir` as terminated: appends the `END\n` sentinel file if the
/// last log file isn't already one, then drops the `.terminated` marker.
/// Idempotent.
pub fn mark_terminated(dir: &Path) -> io::Result<()> {
    if dir.join(TERMINATED_SENTINEL).exists() {
        return Ok(());
    }
    let logs = list_logs(dir)?;
    match logs.last() {
        None => {
            fs::remove_dir_all(dir)?;
            return Ok(());
        }
        Some(last) => {
            if !is_end_file(last)? {
                fs::write(next_log_path(last), END_CONTENTS)?;
            }
        }
    }
    fs::File::create(dir.join(TERMINATED_SENTINEL))?;
    Ok(())
}

/// Reads `.k8s`, falling back to the legacy unhidden `k8s` name for
/// upgrade compatibility with older spool directories (spec_full §B).
pub fn read_metadata(dir: &Path) -> io::Result<Map<String, Value>> {
    let path = dir.join(METADATA_FILE);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let legacy = dir.join(METADATA_FILE_LEGACY);
            match fs::read(&legacy) {
                Ok(b) => {
                    tracing::debug!(dir = %dir.display(), "read legacy k8s metadata file");
                    b
                }
                Err(e2) if e2.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
                Err(e2) => return Err(e2),
            }
        }
        Err(e) => return Err(e),
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(m)) => Ok(m),
        _ => Ok(Map::new()),
    }
}

pub fn write_metadata(dir: &Path, meta: &Map<String, Value>) -> io::Result<()> {
    let path = dir.join(METADATA_FILE);
    if path.exists() {
        return Ok(());
    }
    let bytes = serde_json::to_vec(meta).unwrap_or_else(|_| b"{}".to_vec());
    fs::write(path, bytes)
}
