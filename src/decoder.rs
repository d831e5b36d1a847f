use crate::archive;
use crate::error::{Error, Result};
use crate::merger;
use crate::util::zero_pad;

use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub enum RunMode {
    /// Write the member TIFFs back out unchanged.
    Extract,
    /// Sum groups of consecutive frames into integrated TIFFs.
    Merge { group_frames: u32 },
}

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub start_run: u16,
    pub end_run: u16,
    pub start_frame: u32,
    pub end_frame: u32,
    /// Frames per archive, matching the compress-side set size.
    pub set_size: u32,
    /// Archives processed concurrently.
    pub tasks: usize,
    pub mode: RunMode,
}

struct ArchiveJob {
    path: PathBuf,
    prefix_with_run: String,
    /// First frame covered by this archive.
    first_frame: u32,
}

/// Process every archive in the configured run and frame window. Archive
/// names are derived, not discovered: `<prefix>_<RR>_<NNNNN>.lz4` starting
/// at frame 1, one per `set_size` frames. Per-archive failures are logged
/// and skipped so one bad file never stops a batch.
pub fn process_archives(cfg: &DecodeConfig) -> Result<()> {
    if cfg.set_size == 0 {
        return Err(Error::Config("set size must be at least 1".into()));
    }
    if cfg.end_run < cfg.start_run {
        return Err(Error::Config("end run precedes start run".into()));
    }
    if cfg.end_frame < cfg.start_frame {
        return Err(Error::Config("end frame precedes start frame".into()));
    }
    fs::create_dir_all(&cfg.output_dir)?;

    let frame_count = cfg.end_frame - cfg.start_frame + 1;
    let per_run = (f64::from(frame_count) / f64::from(cfg.set_size)).round() as u32;
    let per_run = per_run.max(1);

    let mut jobs: Vec<ArchiveJob> = Vec::new();
    for run in cfg.start_run..=cfg.end_run {
        let prefix_with_run = format!("{}_{}_", cfg.prefix, zero_pad(u32::from(run), 2));
        for i in 0..per_run {
            let first_frame = i * cfg.set_size + 1;
            jobs.push(ArchiveJob {
                path: cfg
                    .input_dir
                    .join(format!("{prefix_with_run}{}.lz4", zero_pad(first_frame, 5))),
                prefix_with_run: prefix_with_run.clone(),
                first_frame,
            });
        }
    }

    info!(
        "processing {} archives ({} runs, {} per run, {} concurrent tasks)",
        jobs.len(),
        cfg.end_run - cfg.start_run + 1,
        per_run,
        cfg.tasks.max(1)
    );

    let started = Instant::now();
    let pb = ProgressBar::new(jobs.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {pos}/{len} archives ({per_sec})",
        )
        .unwrap(),
    );

    // Waves of `tasks` archives, like the compress side schedules workers.
    for wave in jobs.chunks(cfg.tasks.max(1)) {
        thread::scope(|s| {
            for job in wave {
                let pb = pb.clone();
                s.spawn(move || {
                    process_one(cfg, job);
                    pb.inc(1);
                });
            }
        });
    }

    pb.finish_and_clear();
    info!(
        "processed {} archives in {} ms",
        jobs.len(),
        started.elapsed().as_millis()
    );
    Ok(())
}

fn process_one(cfg: &DecodeConfig, job: &ArchiveJob) {
    info!("processing {}", job.path.display());

    let entries = match archive::decode(&job.path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("skipping {}: {e}", job.path.display());
            return;
        }
    };
    if entries.is_empty() {
        warn!("no files extracted from {}", job.path.display());
        return;
    }

    let result = match cfg.mode {
        RunMode::Extract => merger::extract_entries(&entries, &cfg.output_dir),
        RunMode::Merge { group_frames } => merger::merge_entries(
            &entries,
            &job.prefix_with_run,
            &cfg.output_dir,
            job.first_frame,
            job.first_frame + cfg.set_size - 1,
            group_frames,
        ),
    };
    if let Err(e) = result {
        warn!("failed to process {}: {e}", job.path.display());
    }
}
