use crate::error::Result;
use crate::index::FileIndex;
use crate::pattern::{set_number_for, FilePattern, TaskKey};
use crate::queue::TaskQueue;
use crate::util;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SCAN_INTERVAL: Duration = Duration::from_millis(300);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Dedicated thread performing one parallel full scan and then cheap
/// incremental rescans, feeding complete sets into the task queue.
pub struct Scanner {
    watch_dir: PathBuf,
    pattern: FilePattern,
    set_size: u32,
    index: Arc<Mutex<FileIndex>>,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(
        watch_dir: PathBuf,
        pattern: FilePattern,
        set_size: u32,
        index: Arc<Mutex<FileIndex>>,
        queue: Arc<TaskQueue>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            watch_dir,
            pattern,
            set_size,
            index,
            queue,
            running,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("scanner".into())
            .spawn(move || self.run())
            .expect("spawn scanner thread")
    }

    fn run(&self) {
        let mut first_scan = true;
        while self.running.load(Ordering::Relaxed) {
            let result = if first_scan {
                self.full_scan()
            } else {
                self.incremental_scan()
            };

            match result {
                Ok(()) => {
                    if first_scan {
                        first_scan = false;
                        self.queue.finish_producer();
                        info!("initial full scan completed, switching to incremental scanning");
                    }
                    thread::sleep(SCAN_INTERVAL);
                }
                Err(e) => {
                    error!("scan failed, retrying: {e}");
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        // Never leave a consumer blocked on the first-scan condvar.
        self.queue.finish_producer();
    }

    fn full_scan(&self) -> Result<()> {
        let started = Instant::now();
        info!("performing full scan of {}", self.watch_dir.display());

        // readdir is serialized by most filesystems; enumerate on one
        // thread and parallelize the per-entry work.
        let mut entries: Vec<(PathBuf, String)> = Vec::new();
        for entry in fs::read_dir(&self.watch_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push((entry.path(), name.to_string()));
            }
        }
        info!("found {} entries, matching in parallel", entries.len());

        let threads = num_cpus::get().max(1);
        let per_thread = (entries.len() + threads - 1) / threads.max(1);
        let matched = AtomicUsize::new(0);
        let updated = AtomicUsize::new(0);

        if !entries.is_empty() {
            thread::scope(|s| {
                for chunk in entries.chunks(per_thread.max(1)) {
                    let matched = &matched;
                    let updated = &updated;
                    s.spawn(move || {
                        for (path, name) in chunk {
                            if let Err(e) = self.index_one(path, name, matched, updated) {
                                warn!("error processing {}: {e}", path.display());
                            }
                        }
                    });
                }
            });
        }

        let ready: Vec<TaskKey> = {
            let mut index = self.index.lock().unwrap();
            index.cleanup();
            if let Err(e) = index.save() {
                warn!("could not persist index after full scan: {e}");
            }
            index
                .get_all_sets(false)
                .iter()
                .filter(|set| set.is_complete(self.set_size))
                .map(|set| set.key())
                .collect()
        };
        let ready_count = ready.len();
        for key in ready {
            self.queue.push(key);
        }

        info!(
            "full scan finished in {} ms: {} matched, {} new or updated, {} complete sets",
            started.elapsed().as_millis(),
            matched.load(Ordering::Relaxed),
            updated.load(Ordering::Relaxed),
            ready_count
        );
        Ok(())
    }

    fn index_one(
        &self,
        path: &Path,
        name: &str,
        matched: &AtomicUsize,
        updated: &AtomicUsize,
    ) -> Result<()> {
        let Some((run, frame)) = self.pattern.parse(name) else {
            return Ok(());
        };
        matched.fetch_add(1, Ordering::Relaxed);

        let mtime = util::mtime_millis(&fs::metadata(path)?);
        let mut index = self.index.lock().unwrap();
        if index.has_file_changed(path, mtime) {
            index.add_file(path, run, frame, mtime, false);
            updated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn incremental_scan(&self) -> Result<()> {
        let mut touched: BTreeSet<TaskKey> = BTreeSet::new();

        for entry in fs::read_dir(&self.watch_dir)? {
            // Entries vanishing mid-iteration are routine here; cleanup
            // prunes them from the index later.
            let Ok(entry) = entry else { continue };
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let Some((run, frame)) = self.pattern.parse(&name) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            let mtime = util::mtime_millis(&meta);
            let mut index = self.index.lock().unwrap();
            if index.has_file_changed(&path, mtime) {
                index.add_file(&path, run, frame, mtime, false);
                touched.insert(TaskKey::new(run, set_number_for(frame, self.set_size)));
            }
        }

        if touched.is_empty() {
            return Ok(());
        }

        let ready: Vec<TaskKey> = {
            let index = self.index.lock().unwrap();
            touched
                .into_iter()
                .filter(|key| {
                    index
                        .get_file_set(*key)
                        .map(|set| set.is_complete(self.set_size) && !set.processed)
                        .unwrap_or(false)
                })
                .collect()
        };
        for key in ready {
            if self.queue.push(key) {
                debug!("enqueued {key}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scanner_for(dir: &Path, set_size: u32) -> (Scanner, Arc<Mutex<FileIndex>>, Arc<TaskQueue>) {
        let index = Arc::new(Mutex::new(FileIndex::open(dir, set_size)));
        let queue = Arc::new(TaskQueue::new());
        let scanner = Scanner::new(
            dir.to_path_buf(),
            FilePattern::new("test"),
            set_size,
            Arc::clone(&index),
            Arc::clone(&queue),
            Arc::new(AtomicBool::new(true)),
        );
        (scanner, index, queue)
    }

    fn drop_frames(dir: &Path, run: u16, frames: std::ops::RangeInclusive<u32>) {
        for f in frames {
            fs::write(dir.join(format!("test_{run:02}_{f:05}.tif")), b"px").unwrap();
        }
    }

    #[test]
    fn full_scan_enqueues_complete_sets_in_order() {
        let tmp = TempDir::new().expect("tempdir");
        drop_frames(tmp.path(), 2, 1..=5);
        drop_frames(tmp.path(), 1, 1..=5);
        drop_frames(tmp.path(), 1, 6..=8); // incomplete second set
        fs::write(tmp.path().join("unrelated.txt"), b"skip me").unwrap();

        let (scanner, index, queue) = scanner_for(tmp.path(), 5);
        scanner.full_scan().expect("full scan");

        assert_eq!(index.lock().unwrap().len(), 13);
        assert_eq!(queue.len(), 2);
        queue.finish_producer();
        assert_eq!(queue.pop(), Some(TaskKey::new(1, 1)));
        assert_eq!(queue.pop(), Some(TaskKey::new(2, 1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn incremental_scan_enqueues_once_set_completes() {
        let tmp = TempDir::new().expect("tempdir");
        let (scanner, _index, queue) = scanner_for(tmp.path(), 4);
        scanner.full_scan().expect("full scan");
        assert_eq!(queue.len(), 0);

        drop_frames(tmp.path(), 1, 1..=3);
        scanner.incremental_scan().expect("scan 1");
        assert_eq!(queue.len(), 0, "incomplete set must not be enqueued");

        drop_frames(tmp.path(), 1, 4..=4);
        scanner.incremental_scan().expect("scan 2");
        assert_eq!(queue.len(), 1);

        // A re-scan without changes enqueues nothing new.
        scanner.incremental_scan().expect("scan 3");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn processed_sets_are_not_reenqueued() {
        let tmp = TempDir::new().expect("tempdir");
        drop_frames(tmp.path(), 1, 1..=4);

        let (scanner, index, queue) = scanner_for(tmp.path(), 4);
        scanner.full_scan().expect("full scan");
        queue.finish_producer();
        assert_eq!(queue.pop(), Some(TaskKey::new(1, 1)));

        index
            .lock()
            .unwrap()
            .mark_set_processed(TaskKey::new(1, 1), true);

        // Touch a member so the incremental scan sees a change.
        let member = tmp.path().join("test_01_00002.tif");
        fs::write(&member, b"rewritten").unwrap();
        filetime::set_file_mtime(&member, filetime::FileTime::from_unix_time(12345, 0)).unwrap();

        scanner.incremental_scan().expect("scan");
        assert_eq!(queue.pop(), None);
    }
}
