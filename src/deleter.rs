use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// Ten or more survivors go through the batch pass in one go.
const BATCH_THRESHOLD: usize = 10;

struct DeleteTask {
    files: Vec<PathBuf>,
    protected: PathBuf,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    tasks: VecDeque<DeleteTask>,
    running: bool,
}

/// Background best-effort deletion of verified originals. One worker
/// thread; every failure is logged and swallowed. Dropping the queue
/// drains all pending tasks first.
pub struct DeleteQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeleteQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                running: true,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("delete-queue".into())
            .spawn(move || worker_loop(&worker_shared))
            .expect("spawn delete worker");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queue a set's members for deletion. `protected` is never deleted;
    /// its copy next to the archive serves as the reference frame.
    pub fn push(&self, files: Vec<PathBuf>, protected: PathBuf) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.tasks.push_back(DeleteTask { files, protected });
        }
        self.shared.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeleteQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    let safety = Regex::new(r".*_[0-9]{2}_[0-9]{5}\.tif$").expect("valid safety pattern");

    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if !state.running {
                    return;
                }
                let (next, _timeout) = shared
                    .cv
                    .wait_timeout(state, Duration::from_secs(1))
                    .unwrap();
                state = next;
            }
        };

        let survivors: Vec<PathBuf> = task
            .files
            .iter()
            .filter(|p| **p != task.protected && is_safe_to_delete(p, &safety))
            .cloned()
            .collect();

        if survivors.is_empty() {
            debug!("no files to delete after filtering");
            continue;
        }

        let started = Instant::now();
        let deleted = if survivors.len() >= BATCH_THRESHOLD {
            delete_batch(&survivors)
        } else {
            survivors.iter().filter(|p| delete_single(p)).count()
        };
        info!(
            "deleted {}/{} files in {} ms",
            deleted,
            survivors.len(),
            started.elapsed().as_millis()
        );
    }
}

/// Deleting only strictly pattern-conforming regular `.tif` files keeps a
/// misconfigured watch directory from losing unrelated data.
fn is_safe_to_delete(path: &Path, safety: &Regex) -> bool {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        warn!("not a regular file, skipping: {}", path.display());
        return false;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("tif") {
        warn!("extension is not .tif, skipping: {}", path.display());
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if safety.is_match(name) => true,
        _ => {
            warn!("filename pattern mismatch, skipping: {}", path.display());
            false
        }
    }
}

fn delete_batch(paths: &[PathBuf]) -> usize {
    let mut deleted = 0usize;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => deleted += 1,
            Err(e) => warn!("batch delete failed for {}: {e}", path.display()),
        }
    }
    deleted
}

fn delete_single(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("delete failed for {}: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn safety_filter_rejects_everything_suspect() {
        let tmp = TempDir::new().expect("tempdir");
        let safety = Regex::new(r".*_[0-9]{2}_[0-9]{5}\.tif$").unwrap();

        let good = tmp.path().join("test_01_00002.tif");
        fs::write(&good, b"x").unwrap();
        assert!(is_safe_to_delete(&good, &safety));

        // Missing file.
        assert!(!is_safe_to_delete(&tmp.path().join("test_01_00003.tif"), &safety));

        // Wrong extension.
        let raw = tmp.path().join("test_01_00004.raw");
        fs::write(&raw, b"x").unwrap();
        assert!(!is_safe_to_delete(&raw, &safety));

        // Pattern mismatch.
        let loose = tmp.path().join("test_1_2.tif");
        fs::write(&loose, b"x").unwrap();
        assert!(!is_safe_to_delete(&loose, &safety));

        // Directory named like a frame.
        let dir = tmp.path().join("test_01_00005.tif");
        fs::create_dir(&dir).unwrap();
        assert!(!is_safe_to_delete(&dir, &safety));
    }

    #[test]
    fn drains_pending_tasks_on_drop_and_keeps_protected_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut files = Vec::new();
        for frame in 1..=12u32 {
            let p = tmp.path().join(format!("test_01_{frame:05}.tif"));
            fs::write(&p, b"frame").unwrap();
            files.push(p);
        }
        let protected = files[0].clone();

        {
            let queue = DeleteQueue::new();
            queue.push(files.clone(), protected.clone());
        }

        assert!(protected.exists());
        for p in &files[1..] {
            assert!(!p.exists(), "{} should be deleted", p.display());
        }
    }

    #[test]
    fn small_tasks_delete_individually() {
        let tmp = TempDir::new().expect("tempdir");
        let keep = tmp.path().join("test_02_00001.tif");
        let drop_me = tmp.path().join("test_02_00002.tif");
        fs::write(&keep, b"a").unwrap();
        fs::write(&drop_me, b"b").unwrap();

        {
            let queue = DeleteQueue::new();
            queue.push(vec![keep.clone(), drop_me.clone()], keep.clone());
        }

        assert!(keep.exists());
        assert!(!drop_me.exists());
    }
}
