//! Supervisor (spec §2): discovers `*.log` files under the containers
//! directory, stands up a spool + tailer + parser for each one, and tears
//! them down again once the host removes the source file.
//!
//! Grounded on `original_source/containers.go` (`watchContainers`,
//! `newContainer`, the `fsnotify` event loop) for the create/remove
//! lifecycle, and on `lib/file-source/src/paths_provider/notify.rs` for
//! pairing a `notify` watch with a periodic glob re-scan fallback — the
//! same belt-and-suspenders idiom `vector` uses because filesystem
//! notification backends are not uniformly reliable across platforms.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::governor::{Governor, NumFilesRegistry, ParserRegistry};
use crate::identity;
use crate::k8s::MetadataClient;
use crate::parser;
use crate::record::Record;
use crate::shutdown::ShutdownRx;
use crate::spool;
use crate::tailer::Tailer;

const FALLBACK_SCAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct Supervisor {
    containers_dir: PathBuf,
    spool_dir: PathBuf,
    dot_replacer: String,
    default_annotation: Option<String>,
    tailer: Arc<Tailer>,
    governor: Arc<Governor>,
    numfiles: Arc<NumFilesRegistry>,
    parsers: Arc<ParserRegistry>,
    metadata: Arc<MetadataClient>,
    records_tx: mpsc::Sender<Record>,
}

struct Active {
    spool_dir: PathBuf,
    handle: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    pub fn new(
        containers_dir: PathBuf,
        spool_dir: PathBuf,
        dot_replacer: String,
        default_annotation: Option<String>,
        governor: Arc<Governor>,
        metadata: Arc<MetadataClient>,
        records_tx: mpsc::Sender<Record>,
    ) -> Self {
        let numfiles = governor.numfiles().clone();
        let parsers = governor.parsers().clone();
        Supervisor {
            containers_dir,
            spool_dir,
            dot_replacer,
            default_annotation,
            tailer: Arc::new(Tailer::new(governor.clone())),
            governor,
            numfiles,
            parsers,
            metadata,
            records_tx,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) {
        if let Err(e) = std::fs::create_dir_all(&self.spool_dir) {
            crate::error::fatal(format!("cannot create spool directory {}: {e}", self.spool_dir.display()));
        }

        let tailer_task = {
            let tailer = self.tailer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { tailer.run(shutdown).await })
        };

        let mut active: HashMap<PathBuf, Active> = HashMap::new();
        for path in glob_logs(&self.containers_dir) {
            self.new_container(&path, &mut active, shutdown.clone()).await;
        }
        self.reconcile_leftover_spools(&active, shutdown.clone());

        let (events_tx, mut events_rx) = mpsc::channel(256);
        let _watcher = start_watch(&self.containers_dir, events_tx);
        let mut fallback = tokio::time::interval(FALLBACK_SCAN_INTERVAL);
        let mut shutdown_loop = shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown_loop.signaled() => break,
                Some(event) = events_rx.recv() => self.handle_event(event, &mut active, shutdown.clone()).await,
                _ = fallback.tick() => self.rescan(&mut active, shutdown.clone()).await,
            }
        }

        let _ = tailer_task.await;
        for active in active.into_values() {
            let _ = active.handle.await;
        }
    }

    async fn new_container(&self, log_file: &Path, active: &mut HashMap<PathBuf, Active>, shutdown: ShutdownRx) {
        if active.contains_key(log_file) {
            return;
        }
        let Some(stem) = log_file.file_stem().and_then(|s| s.to_str()) else { return };
        let spool_dir = self.spool_dir.join(stem);
        if let Err(e) = std::fs::create_dir_all(&spool_dir) {
            tracing::warn!(dir = %spool_dir.display(), error = %e, "failed to create spool directory");
            return;
        }

        if !spool_dir.join(spool::METADATA_FILE).exists() {
            let identity = identity::parse_log_name(stem);
            let mut meta = match identity {
                Some(ref id) => self.metadata.fetch(id, &self.dot_replacer, &id.container_name).await,
                None => Default::default(),
            };
            // Config-level fallback annotation (spec §6's `annotation` key)
            // for containers whose pod carries no `logflow.io/conf[_<cname>]`
            // annotation of its own.
            if !meta.contains_key("annotation") {
                if let Some(default) = &self.default_annotation {
                    meta.insert("annotation".to_string(), default.clone().into());
                }
            }
            if let Err(e) = spool::write_metadata(&spool_dir, &meta) {
                tracing::warn!(dir = %spool_dir.display(), error = %e, "failed to write metadata file");
            }
        }

        let canonical = std::fs::canonicalize(log_file).unwrap_or_else(|_| log_file.to_path_buf());
        if let Err(e) = self.tailer.follow(canonical, spool_dir.clone()) {
            tracing::warn!(source = %log_file.display(), error = %e, "failed to start following log file");
            return;
        }
        self.numfiles.set(&spool_dir, spool::list_logs(&spool_dir).map(|l| l.len()).unwrap_or(0));

        let handle = parser::spawn(spool_dir.clone(), self.records_tx.clone(), shutdown, self.parsers.clone());
        active.insert(log_file.to_path_buf(), Active { spool_dir, handle });
    }

    async fn terminate_container(&self, log_file: &Path, active: &mut HashMap<PathBuf, Active>) {
        if let Some(entry) = active.remove(log_file) {
            self.tailer.stop(log_file);
            if let Err(e) = spool::mark_terminated(&entry.spool_dir) {
                tracing::warn!(dir = %entry.spool_dir.display(), error = %e, "failed to mark spool terminated");
            }
            self.numfiles.mark_terminated(&entry.spool_dir);
            self.parsers.notify_added(&entry.spool_dir);
            // The parser task itself observes the END sentinel (or an
            // already-empty spool) and exits on its own; we don't await
            // it here to avoid blocking the event loop.
        }
    }

    fn reconcile_leftover_spools(&self, active: &HashMap<PathBuf, Active>, shutdown: ShutdownRx) {
        let known: std::collections::HashSet<&PathBuf> = active.values().map(|a| &a.spool_dir).collect();
        let Ok(entries) = std::fs::read_dir(&self.spool_dir) else { return };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) || known.contains(&dir) {
                continue;
            }
            if spool::mark_terminated(&dir).is_err() {
                continue;
            }
            match spool::has_logs(&dir) {
                Ok(true) => {
                    self.numfiles.set(&dir, spool::list_logs(&dir).map(|l| l.len()).unwrap_or(0));
                    self.numfiles.mark_terminated(&dir);
                    parser::spawn(dir, self.records_tx.clone(), shutdown.clone(), self.parsers.clone());
                }
                _ => {
                    let _ = std::fs::remove_dir_all(&dir);
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, active: &mut HashMap<PathBuf, Active>, shutdown: ShutdownRx) {
        match event {
            Event::Created(path) if is_log_file(&path) => self.new_container(&path, active, shutdown).await,
            Event::Removed(path) if is_log_file(&path) => self.terminate_container(&path, active).await,
            _ => {}
        }
    }

    async fn rescan(&self, active: &mut HashMap<PathBuf, Active>, shutdown: ShutdownRx) {
        let current: std::collections::HashSet<PathBuf> = glob_logs(&self.containers_dir).into_iter().collect();
        let gone: Vec<PathBuf> = active.keys().filter(|p| !current.contains(*p)).cloned().collect();
        for path in gone {
            self.terminate_container(&path, active).await;
        }
        for path in current {
            self.new_container(&path, active, shutdown.clone()).await;
        }
    }
}

fn is_log_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("log")
}

fn glob_logs(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.log");
    glob::glob(&pattern.to_string_lossy()).map(|paths| paths.flatten().collect()).unwrap_or_default()
}

enum Event {
    Created(PathBuf),
    Removed(PathBuf),
}

fn start_watch(dir: &Path, tx: mpsc::Sender<Event>) -> Option<RecommendedWatcher> {
    let (std_tx, std_rx) = std::sync::mpsc::channel();
    let mut watcher = match RecommendedWatcher::new(std_tx, notify::Config::default()) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start filesystem watcher, relying on periodic scan only");
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, dir = %dir.display(), "failed to watch containers directory");
        return None;
    }

    std::thread::spawn(move || {
        for res in std_rx {
            let Ok(event) = res else { continue };
            let mapped = match event.kind {
                notify::EventKind::Create(_) => event.paths.into_iter().map(Event::Created).collect::<Vec<_>>(),
                notify::EventKind::Remove(_) => event.paths.into_iter().map(Event::Removed).collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            for e in mapped {
                if tx.blocking_send(e).is_err() {
                    return;
                }
            }
        }
    });

    Some(watcher)
}
