use crate::pattern::FilePattern;

use std::fs;
use std::path::Path;
use sysinfo::System;
use tracing::info;

// The original deployment target pinned eight readers per set.
const DEFAULT_READ_THREADS: usize = 8;
// Typical detector frame when nothing can be sampled yet.
const FALLBACK_FRAME_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Tune {
    pub read_threads: usize,
    pub max_workers: usize,
}

/// Pick reader and worker counts from the machine. Workers each hold a
/// whole set in memory (raw members, the concatenation and the compressed
/// bound), so extra workers are only worth it with plenty of RAM; they
/// mostly contend on the disk otherwise.
pub fn tune_for_watch(watch_dir: &Path, pattern: &FilePattern, set_size: u32) -> Tune {
    let cores = num_cpus::get().max(1);

    let frame_bytes = sample_frame_size(watch_dir, pattern).unwrap_or(FALLBACK_FRAME_BYTES);
    let set_bytes = frame_bytes.saturating_mul(u64::from(set_size.max(1)));

    let mut sys = System::new();
    sys.refresh_memory();
    let avail = sys.available_memory();

    let tune = compute(cores, avail, set_bytes);
    info!(
        "auto-tune: cores={} avail={}MiB frame≈{}KiB set≈{}MiB readers={} workers={}",
        cores,
        avail / (1024 * 1024),
        frame_bytes / 1024,
        set_bytes / (1024 * 1024),
        tune.read_threads,
        tune.max_workers
    );
    tune
}

fn compute(cores: usize, avail_bytes: u64, set_bytes: u64) -> Tune {
    let read_threads = cores.clamp(1, DEFAULT_READ_THREADS);

    // One in-flight set costs roughly three times its raw size. A second
    // worker is only worth the disk contention on machines with room for
    // many sets; everyone else keeps the single-worker default.
    let worker_cost = set_bytes.saturating_mul(3).max(1);
    let max_workers = if avail_bytes / worker_cost >= 8 { 2 } else { 1 };

    Tune {
        read_threads,
        max_workers,
    }
}

/// Size of the first matching frame already present, if any.
fn sample_frame_size(watch_dir: &Path, pattern: &FilePattern) -> Option<u64> {
    for entry in fs::read_dir(watch_dir).ok()?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if pattern.parse(name).is_some() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    return Some(meta.len().max(1));
                }
            }
        }
    }
    None
}
