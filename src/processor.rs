use crate::archive;
use crate::deleter::DeleteQueue;
use crate::error::Result;
use crate::pattern::TaskKey;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Everything a worker needs, copied out of the index before dispatch.
#[derive(Debug, Clone)]
pub struct SetSnapshot {
    pub key: TaskKey,
    /// Member paths sorted by frame number.
    pub files: Vec<PathBuf>,
    pub first_file: PathBuf,
}

impl SetSnapshot {
    /// The archive filename reuses the first frame's stem, so a set maps
    /// to exactly one output path.
    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        let stem = self
            .first_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        output_dir.join(format!("{stem}.lz4"))
    }
}

/// Archive one complete set: read members in parallel, compress, verify
/// the written file by a full decode, copy the reference frame, and only
/// then queue the originals for deletion.
pub fn process_file_set(
    snapshot: &SetSnapshot,
    output_dir: &Path,
    delete_after: bool,
    read_threads: usize,
    deleter: &DeleteQueue,
) -> Result<()> {
    let started = Instant::now();
    let output = snapshot.output_path(output_dir);

    if output.exists() {
        info!("skipping already processed set: {}", output.display());
        return Ok(());
    }

    let sources = archive::read_set(&snapshot.files, read_threads)?;
    archive::write_archive(&sources, &output)?;

    if let Err(e) = archive::verify_roundtrip(&output, &sources) {
        // A bad archive must not satisfy the output-exists check on retry.
        if let Err(rm) = fs::remove_file(&output) {
            warn!("could not remove failed archive {}: {rm}", output.display());
        }
        return Err(e);
    }
    drop(sources);

    let reference = output_dir.join(snapshot.first_file.file_name().unwrap_or_default());
    if let Err(e) = fs::copy(&snapshot.first_file, &reference) {
        // The archive is the canonical output; a failed reference copy is
        // not fatal.
        warn!(
            "failed to copy first file {} -> {}: {e}",
            snapshot.first_file.display(),
            reference.display()
        );
    }

    if delete_after {
        deleter.push(snapshot.files.clone(), snapshot.first_file.clone());
    }

    info!(
        "created {} ({} files) in {} ms",
        output.display(),
        snapshot.files.len(),
        started.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn snapshot_for(dir: &Path, run: u16, frames: std::ops::RangeInclusive<u32>) -> SetSnapshot {
        let files: Vec<PathBuf> = frames
            .clone()
            .map(|f| {
                let p = dir.join(format!("test_{run:02}_{f:05}.tif"));
                fs::write(&p, format!("frame {f}").repeat(f as usize + 1)).unwrap();
                p
            })
            .collect();
        SetSnapshot {
            key: TaskKey::new(run, *frames.start()),
            first_file: files[0].clone(),
            files,
        }
    }

    #[test]
    fn archives_copies_reference_and_deletes_rest() {
        let tmp = TempDir::new().expect("tempdir");
        let watch = tmp.path().join("watch");
        let out = tmp.path().join("out");
        fs::create_dir_all(&watch).unwrap();
        fs::create_dir_all(&out).unwrap();

        let snapshot = snapshot_for(&watch, 1, 1..=10);
        let deleter = DeleteQueue::new();
        process_file_set(&snapshot, &out, true, 4, &deleter).expect("process");
        drop(deleter); // drain

        let archive_path = out.join("test_01_00001.lz4");
        assert!(archive_path.exists());
        assert!(out.join("test_01_00001.tif").exists());
        assert!(snapshot.files[0].exists(), "protected first file kept");
        for p in &snapshot.files[1..] {
            assert!(!p.exists(), "{} should be deleted", p.display());
        }

        let entries = archive::decode(&archive_path).expect("decode");
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].name, "test_01_00001.tif");
        assert_eq!(entries[9].name, "test_01_00010.tif");
    }

    #[test]
    fn existing_output_short_circuits_without_rewrite() {
        let tmp = TempDir::new().expect("tempdir");
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let snapshot = snapshot_for(tmp.path(), 2, 1..=3);
        let existing = out.join("test_02_00001.lz4");
        fs::write(&existing, b"placeholder").unwrap();

        let deleter = DeleteQueue::new();
        process_file_set(&snapshot, &out, true, 2, &deleter).expect("short circuit");
        thread::sleep(Duration::from_millis(100));

        assert_eq!(fs::read(&existing).unwrap(), b"placeholder");
        for p in &snapshot.files {
            assert!(p.exists(), "originals untouched on short circuit");
        }
    }

    #[test]
    fn missing_member_aborts_and_keeps_originals() {
        let tmp = TempDir::new().expect("tempdir");
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let mut snapshot = snapshot_for(tmp.path(), 3, 1..=4);
        snapshot
            .files
            .push(tmp.path().join("test_03_00005.tif")); // never written

        let deleter = DeleteQueue::new();
        let err = process_file_set(&snapshot, &out, true, 2, &deleter);
        assert!(matches!(err, Err(Error::ReadFailed { .. })));
        drop(deleter);

        assert!(!out.join("test_03_00001.lz4").exists());
        for p in &snapshot.files[..4] {
            assert!(p.exists(), "no originals deleted on failure");
        }
    }
}
