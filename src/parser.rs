//! Parser (spec §4.5): one blocking task per active spool, resuming from
//! its persisted cursor, merging multi-line records, annotating each line,
//! and forwarding finished record documents to the [`crate::hub::RecordsHub`].
//!
//! Grounded on `original_source/parser.go`'s `parseLogs` for the control
//! flow (EOF → roll-forward-or-wait, `END` sentinel → termination send,
//! multiline accumulate-or-flush) and run as a `spawn_blocking` task
//! because the read/seek/stat loop has no async equivalent worth chasing —
//! the same tradeoff `lib/file-source` makes by running its own
//! `FileServer` loop on a dedicated thread rather than as a `Future`.
//!
//! State names below mirror the spec's diagram
//! (`INIT → RESUME → RUN ↔ WAIT_DATA ↔ ROLL_FORWARD ↔ DRAINED → DONE`,
//! with `EVICTED` reachable from any read state) even though the actual
//! control flow is a single loop with early returns, not a literal enum —
//! the comments carry the state names so the two stay easy to cross-check.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::annotation::AnnotationConfig;
use crate::cursor;
use crate::governor::ParserRegistry;
use crate::lines::{LineReader, ReadOutcome};
use crate::record::Record;
use crate::shutdown::ShutdownRx;
use crate::spool;

const MAX_LINE_BYTES: usize = 1024 * 1024;
const MULTILINE_FLUSH_AFTER: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(100);
const WAIT_STEPS_PER_TICK: u32 = 10; // ~1s, matches the original's 1s re-check timer

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "time")]
    time: String,
    #[serde(rename = "log")]
    log: String,
}

/// Spawns the blocking parser task for `dir` and registers its
/// added/evicted notification channels with the governor's parser
/// registry (the tailer wakes it via `added` when a new file lands; the
/// governor wakes it via `evicted` when disk pressure reclaims a file it
/// has open).
pub fn spawn(dir: PathBuf, records_tx: mpsc::Sender<Record>, shutdown: ShutdownRx, parsers: Arc<ParserRegistry>) -> tokio::task::JoinHandle<()> {
    let (added_tx, added_rx) = mpsc::channel(1);
    let (evicted_tx, evicted_rx) = mpsc::channel(1);
    parsers.register(dir.clone(), evicted_tx, added_tx);
    let parsers_for_task = parsers;
    tokio::task::spawn_blocking(move || {
        run(&dir, &records_tx, shutdown, added_rx, evicted_rx);
        parsers_for_task.unregister(&dir);
    })
}

struct Pending {
    doc: Map<String, Value>,
    ext: i64,
    pos: u64,
}

fn run(dir: &Path, records_tx: &mpsc::Sender<Record>, shutdown: ShutdownRx, mut added_rx: mpsc::Receiver<()>, mut evicted_rx: mpsc::Receiver<()>) {
    tracing::info!(dir = %dir.display(), "parser starting");

    // INIT: a spool always has at least one captured log file by the time
    // its parser is spawned (the tailer links one before the supervisor
    // spawns this task) — an empty spool here is a supervisor bug.
    let logs = match spool::list_logs(dir) {
        Ok(logs) if !logs.is_empty() => logs,
        Ok(_) => crate::error::fatal(format!("parser started with no log files in {}", dir.display())),
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to list spool log files");
            return;
        }
    };

    // RESUME: load the persisted cursor, or start at the oldest file.
    let (saved_ext, saved_pos) = cursor::read_checkpoint(dir);
    let (mut ext, mut pos) = if saved_ext >= 0 { (saved_ext, saved_pos) } else { (spool::ext_of(&logs[0]).unwrap_or(0), 0) };

    let mut k8s = spool::read_metadata(dir).unwrap_or_default();
    let annotation_text = k8s.remove("annotation").and_then(|v| v.as_str().map(str::to_string));
    let annotation = match annotation_text {
        Some(text) => AnnotationConfig::parse(&text).unwrap_or_else(|e| {
            tracing::warn!(dir = %dir.display(), error = %e, "invalid per-container annotation config, using defaults");
            AnnotationConfig::default()
        }),
        None => AnnotationConfig::default(),
    };

    let mut file = match open_at(dir, ext, pos) {
        Ok((f, recovered_pos)) => {
            pos = recovered_pos;
            f
        }
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to open initial log file");
            return;
        }
    };

    let mut reader = LineReader::new(MAX_LINE_BYTES);
    let mut pending: Option<Pending> = None;
    let mut waited = Duration::ZERO;

    // RUN / WAIT_DATA / ROLL_FORWARD / DRAINED / EVICTED, looped.
    loop {
        if shutdown.is_shutdown() {
            return;
        }

        // EVICTED: the governor may have deleted our current file (or
        // files behind it) out from under us; resync forward.
        if evicted_rx.try_recv().is_ok() && !spool::log_path(dir, ext).exists() {
            match resync_after_eviction(dir, &mut ext, &mut pos) {
                Some(f) => {
                    file = f;
                    reader = LineReader::new(MAX_LINE_BYTES);
                }
                None => {
                    tracing::warn!(dir = %dir.display(), "evicted past all remaining spool files, stopping");
                    return;
                }
            }
        }

        match reader.read_from(&mut file) {
            Ok(ReadOutcome::Line(line)) => {
                pos += line.len() as u64 + 1;
                waited = Duration::ZERO;

                if line == b"END" {
                    // DONE: termination sentinel. Spec §4.5: flush any
                    // still-pending multiline record before announcing
                    // termination so its last record isn't lost.
                    if pending.is_some() && !flush_pending(&mut pending, &k8s, records_tx, dir) {
                        return;
                    }
                    let _ = records_tx.blocking_send(Record::termination(dir.to_path_buf()));
                    return;
                }

                // A malformed `{time, log}` envelope means the tailer or
                // the host wrote something other than valid JSON-file
                // driver output into the spool: a programmer-bug class
                // invariant violation (spec §7.1), not a user-data problem.
                let mut raw: RawLine = match serde_json::from_slice(&line) {
                    Ok(r) => r,
                    Err(e) => crate::error::fatal(format!("malformed raw log line in {}: {e}", dir.display())),
                };
                // Host idiosyncrasy: the JSON-file driver embeds a trailing
                // "\n" inside the payload itself (spec §4.5).
                if raw.log.ends_with('\n') {
                    raw.log.pop();
                }

                let continues_previous = pending.as_ref().is_some_and(|_| {
                    annotation.multiline_start.as_ref().map(|re| !re.is_match(&raw.log)).unwrap_or(false)
                });

                if continues_previous {
                    if let Some(p) = pending.as_mut() {
                        if let Some(Value::String(msg)) = p.doc.get_mut("@message") {
                            msg.push('\n');
                            msg.push_str(&raw.log);
                        }
                        p.ext = ext;
                        p.pos = pos;
                    }
                    continue;
                }

                if pending.is_some() && !flush_pending(&mut pending, &k8s, records_tx, dir) {
                    return;
                }

                let doc = annotation.parse_line(&raw.time, &raw.log);
                if annotation.multiline_start.is_none() {
                    if !send_doc(doc, ext, pos, &k8s, records_tx, dir) {
                        return;
                    }
                } else {
                    pending = Some(Pending { doc, ext, pos });
                }
            }
            Ok(ReadOutcome::NeedMore) => {
                if pending.is_some() && waited >= MULTILINE_FLUSH_AFTER {
                    if !flush_pending(&mut pending, &k8s, records_tx, dir) {
                        return;
                    }
                    continue;
                }

                // ROLL_FORWARD: the current file is exhausted; move on if
                // the tailer has already captured the next one.
                let next = spool::next_log_path(&spool::log_path(dir, ext));
                if next.exists() {
                    file = match File::open(&next) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::error!(dir = %dir.display(), error = %e, "failed to open next log file");
                            return;
                        }
                    };
                    ext += 1;
                    pos = 0;
                    continue;
                }

                // DRAINED: nothing more to read right now, wait for the
                // tailer to signal new data or for shutdown.
                wait_for_data(&mut added_rx, &shutdown);
                waited += WAIT_STEP * WAIT_STEPS_PER_TICK;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The file we had open vanished without an eviction
                // notification reaching us first (a benign race, spec
                // §4.5/§7.2) — resync the way EVICTED handling does.
                tracing::warn!(dir = %dir.display(), "open log file disappeared, resyncing");
                match resync_after_eviction(dir, &mut ext, &mut pos) {
                    Some(f) => {
                        file = f;
                        reader = LineReader::new(MAX_LINE_BYTES);
                    }
                    None => return,
                }
            }
            Err(e) => crate::error::fatal(format!("I/O error reading {}: {e}", dir.display())),
        }
    }
}

/// Opens `log.<ext>` for RESUME and recovers alignment from a possibly
/// mid-line checkpoint (spec §4.5 RESUME, §8 scenario 6): seeks to
/// `pos - 1` and scans forward to the next `\n`, returning the file
/// positioned right after it along with the recovered byte offset. A
/// checkpoint of `0` needs no recovery. If the scan reaches EOF without
/// finding a newline, the file is left positioned at EOF (nothing to
/// recover past — the next read naturally yields `NeedMore`).
fn open_at(dir: &Path, ext: i64, pos: u64) -> std::io::Result<(File, u64)> {
    let mut f = File::open(spool::log_path(dir, ext))?;
    if pos == 0 {
        return Ok((f, 0));
    }
    let mut offset = pos - 1;
    f.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8; 1];
    loop {
        let n = f.read(&mut byte)?;
        if n == 0 {
            break;
        }
        offset += 1;
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok((f, offset))
}

fn resync_after_eviction(dir: &Path, ext: &mut i64, pos: &mut u64) -> Option<File> {
    let logs = spool::list_logs(dir).ok()?;
    let first = logs.first()?;
    let new_ext = spool::ext_of(first)?;
    tracing::warn!(dir = %dir.display(), from_ext = *ext, to_ext = new_ext, "resyncing past evicted spool files");
    *ext = new_ext;
    *pos = 0;
    File::open(first).ok()
}

fn wait_for_data(added_rx: &mut mpsc::Receiver<()>, shutdown: &ShutdownRx) {
    for _ in 0..WAIT_STEPS_PER_TICK {
        if shutdown.is_shutdown() || added_rx.try_recv().is_ok() {
            return;
        }
        std::thread::sleep(WAIT_STEP);
    }
}

fn flush_pending(pending: &mut Option<Pending>, k8s: &Map<String, Value>, records_tx: &mpsc::Sender<Record>, dir: &Path) -> bool {
    let Some(p) = pending.take() else { return true };
    send_doc(p.doc, p.ext, p.pos, k8s, records_tx, dir)
}

fn send_doc(mut doc: Map<String, Value>, ext: i64, pos: u64, k8s: &Map<String, Value>, records_tx: &mpsc::Sender<Record>, dir: &Path) -> bool {
    doc.insert("@k8s".to_string(), Value::Object(k8s.clone()));
    records_tx.blocking_send(Record { dir: dir.to_path_buf(), ext, pos, doc: Some(doc) }).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::ParserRegistry;
    use std::fs;
    use tempfile::tempdir;

    fn write_line(dir: &Path, ext: i64, lines: &[&str]) {
        let mut body = String::new();
        for l in lines {
            body.push_str(l);
            body.push('\n');
        }
        fs::write(spool::log_path(dir, ext), body).unwrap();
    }

    #[test]
    fn resume_recovers_alignment_from_a_mid_line_checkpoint() {
        // Spec §8 scenario 6: log.3 is 200 bytes with the committed cursor
        // sitting mid-line at pos=123; recovery must seek to pos-1=122 and
        // scan forward to the next '\n' (here at byte 150) before resuming.
        let dir = tempdir().unwrap();
        let mut content = vec![b'a'; 200];
        content[150] = b'\n';
        fs::write(spool::log_path(dir.path(), 3), &content).unwrap();

        let (_file, recovered_pos) = open_at(dir.path(), 3, 123).unwrap();
        assert_eq!(recovered_pos, 151);
    }

    #[test]
    fn resume_at_a_line_boundary_is_a_noop() {
        let dir = tempdir().unwrap();
        fs::write(spool::log_path(dir.path(), 0), b"one\ntwo\n").unwrap();
        let (_file, recovered_pos) = open_at(dir.path(), 0, 4).unwrap();
        assert_eq!(recovered_pos, 4);
    }

    #[tokio::test]
    async fn flushes_pending_multiline_record_before_terminating() {
        let dir = tempdir().unwrap();
        let mut meta = Map::new();
        meta.insert("annotation".to_string(), Value::String(r#"multiline_start = /^\d/"#.to_string()));
        spool::write_metadata(dir.path(), &meta).unwrap();
        write_line(
            dir.path(),
            0,
            &[
                r#"{"time":"2024-01-01T00:00:00Z","log":"1 first"}"#,
                r#"{"time":"2024-01-01T00:00:01Z","log":"  continuation"}"#,
            ],
        );
        spool::mark_terminated(dir.path()).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = crate::shutdown::ShutdownTx::new();
        let parsers = Arc::new(ParserRegistry::new());
        let handle = spawn(dir.path().to_path_buf(), tx, shutdown_rx, parsers);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.doc.as_ref().unwrap()["@message"], Value::String("1 first\n  continuation".into()));
        let term = rx.recv().await.unwrap();
        assert!(term.is_termination());

        shutdown_tx.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn parses_single_line_records_and_terminates() {
        let dir = tempdir().unwrap();
        write_line(dir.path(), 0, &[r#"{"time":"2024-01-01T00:00:00Z","log":"hello"}"#]);
        spool::mark_terminated(dir.path()).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = crate::shutdown::ShutdownTx::new();
        let parsers = Arc::new(ParserRegistry::new());
        let handle = spawn(dir.path().to_path_buf(), tx, shutdown_rx, parsers);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.doc.as_ref().unwrap()["@message"], Value::String("hello".into()));
        let term = rx.recv().await.unwrap();
        assert!(term.is_termination());

        shutdown_tx.shutdown();
        let _ = handle.await;
    }
}
