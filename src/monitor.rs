use crate::archive;
use crate::deleter::DeleteQueue;
use crate::error::{Error, Result};
use crate::index::FileIndex;
use crate::pattern::{FilePattern, TaskKey};
use crate::processor::{process_file_set, SetSnapshot};
use crate::queue::TaskQueue;
use crate::scanner::Scanner;

use std::collections::HashSet;
use std::fs;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

const IDLE_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub watch_dir: std::path::PathBuf,
    pub output_dir: std::path::PathBuf,
    pub prefix: String,
    pub set_size: u32,
    pub read_threads: usize,
    pub max_workers: usize,
    pub delete_after: bool,
    /// Process what the initial scan finds, then exit once everything has
    /// drained instead of watching for new arrivals.
    pub once: bool,
}

struct Worker {
    key: TaskKey,
    handle: JoinHandle<Result<()>>,
}

/// Run the compress-side monitor: scanner feeding the queue, a bounded
/// pool of set workers, and the background delete queue.
pub fn run_monitor(cfg: &MonitorConfig) -> Result<()> {
    if cfg.set_size == 0 {
        return Err(Error::Config("set size must be at least 1".into()));
    }
    if !cfg.watch_dir.is_dir() {
        return Err(Error::Config(format!(
            "watch directory does not exist: {}",
            cfg.watch_dir.display()
        )));
    }
    fs::create_dir_all(&cfg.output_dir)?;
    // The index stores canonical paths so it stays valid across restarts
    // from a different working directory.
    let watch_dir = fs::canonicalize(&cfg.watch_dir)?;
    let output_dir = fs::canonicalize(&cfg.output_dir)?;

    info!("starting indexed directory monitor on {}", watch_dir.display());
    info!("output directory: {}", output_dir.display());
    info!("set size: {} files", cfg.set_size);
    info!("reader threads per set: {}", cfg.read_threads);
    info!("max concurrent sets: {}", cfg.max_workers);

    let index = Arc::new(Mutex::new(FileIndex::open(&watch_dir, cfg.set_size)));
    info!("loaded index with {} tracked files", index.lock().unwrap().len());
    let queue = Arc::new(TaskQueue::new());
    let deleter = Arc::new(DeleteQueue::new());
    let running = Arc::new(AtomicBool::new(true));

    let scanner_handle = Scanner::new(
        watch_dir.clone(),
        FilePattern::new(&cfg.prefix),
        cfg.set_size,
        Arc::clone(&index),
        Arc::clone(&queue),
        Arc::clone(&running),
    )
    .spawn();

    if !cfg.once && std::io::stdin().is_terminal() {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            info!("press Enter to stop the monitor");
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            info!("stopping monitor");
            running.store(false, Ordering::Relaxed);
        });
    }

    let mut workers: Vec<Worker> = Vec::new();
    let mut in_flight: HashSet<TaskKey> = HashSet::new();
    // In once mode a persistently failing set must not spin forever.
    let mut failed: HashSet<TaskKey> = HashSet::new();

    while running.load(Ordering::Relaxed) {
        reap_finished(&mut workers, &mut in_flight, &mut failed, &index, &queue);

        let mut dispatched = false;
        let mut drained = false;
        while workers.len() < cfg.max_workers.max(1) {
            let Some(key) = queue.pop() else {
                drained = true;
                break;
            };
            if in_flight.contains(&key) {
                continue;
            }
            if cfg.once && failed.contains(&key) {
                continue;
            }

            let Some(set) = index.lock().unwrap().get_file_set(key) else {
                continue;
            };
            if set.processed {
                continue;
            }
            if !set.is_complete(cfg.set_size) {
                warn!(
                    "incomplete set received: {key} ({}/{} files)",
                    set.files.len(),
                    cfg.set_size
                );
                continue;
            }
            let Some(first_file) = set.first_file().cloned() else {
                warn!("set {key} is missing its first frame, skipping");
                continue;
            };
            let snapshot = SetSnapshot {
                key,
                files: set.sorted_paths(),
                first_file,
            };

            // A leftover output from a previous process counts only when
            // its container is structurally sound; a torn write is removed
            // and the set is compressed again.
            let output = snapshot.output_path(&output_dir);
            if output.exists() {
                if archive::validate_container(&output) {
                    info!("set already processed: {key}");
                    index.lock().unwrap().mark_set_processed(key, true);
                    dispatched = true;
                    continue;
                }
                warn!("removing invalid output {}", output.display());
                let _ = fs::remove_file(&output);
            }

            info!("processing set {key} ({} files)", snapshot.files.len());
            // Pre-claim before dispatch so the next incremental scan
            // cannot enqueue the same set again.
            index.lock().unwrap().mark_set_processed(key, true);
            in_flight.insert(key);

            let output_dir = output_dir.clone();
            let delete_after = cfg.delete_after;
            let read_threads = cfg.read_threads.max(1);
            let worker_deleter = Arc::clone(&deleter);
            let handle = thread::Builder::new()
                .name(format!("set-{:02}-{:05}", key.run, key.set_number))
                .spawn(move || {
                    process_file_set(
                        &snapshot,
                        &output_dir,
                        delete_after,
                        read_threads,
                        &worker_deleter,
                    )
                })
                .expect("spawn set worker");
            workers.push(Worker { key, handle });
            dispatched = true;
        }

        if cfg.once && drained && workers.is_empty() {
            info!("initial backlog drained");
            break;
        }
        if !dispatched {
            thread::sleep(IDLE_SLEEP);
        }
    }

    running.store(false, Ordering::Relaxed);
    info!("waiting for remaining tasks to complete");
    let _ = scanner_handle.join();
    for worker in workers.drain(..) {
        let key = worker.key;
        match worker.handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("final task for set {key} failed, reverting: {e}");
                index.lock().unwrap().mark_set_processed(key, false);
            }
            Err(_) => {
                warn!("final worker for set {key} panicked, reverting");
                index.lock().unwrap().mark_set_processed(key, false);
            }
        }
    }

    info!("waiting for delete queue to finish ({} tasks pending)", deleter.len());
    drop(deleter);

    if let Err(e) = index.lock().unwrap().save() {
        warn!("failed to save index on shutdown: {e}");
    }
    info!("monitor stopped");
    Ok(())
}

fn reap_finished(
    workers: &mut Vec<Worker>,
    in_flight: &mut HashSet<TaskKey>,
    failed: &mut HashSet<TaskKey>,
    index: &Arc<Mutex<FileIndex>>,
    queue: &TaskQueue,
) {
    let mut i = 0;
    while i < workers.len() {
        if !workers[i].handle.is_finished() {
            i += 1;
            continue;
        }
        let worker = workers.remove(i);
        in_flight.remove(&worker.key);
        let error = match worker.handle.join() {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("worker panicked".into()),
        };
        if let Some(error) = error {
            warn!(
                "task for set {} completed with error, reverting processed flag: {error}",
                worker.key
            );
            failed.insert(worker.key);
            index.lock().unwrap().mark_set_processed(worker.key, false);
            // Incremental scans only enqueue touched sets, so the retry
            // has to come from here.
            queue.push(worker.key);
        }
    }
}
