use crate::archive::ArchiveEntry;
use crate::error::{Error, Result};
use crate::tiff;
use crate::util::zero_pad;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, error, warn};

/// Write every TIFF member of a decoded archive into `out_dir` unchanged.
pub fn extract_entries(entries: &[ArchiveEntry], out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;
    for entry in entries {
        let ext = entry
            .name
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if ext != "tif" && ext != "tiff" {
            continue;
        }
        let out_path = out_dir.join(&entry.name);
        if let Err(e) = fs::write(&out_path, &entry.data) {
            warn!("failed to write {}: {e}", out_path.display());
        }
    }
    Ok(())
}

/// Sum groups of consecutive frames into integrated TIFFs.
///
/// With `n = group_frames` there are `round((e_img - s_img + 1) / n)`
/// groups; group `i` accumulates the frames `s_img + i*n + t` for
/// `t in 0..n`. A pixel summing to exactly `-n` was a sentinel in every
/// contributing frame and becomes `-1`; below `-n` means a partial
/// sentinel mix and becomes `-2`. Each group is emitted by splicing the
/// sums into a copy of the first readable frame, so downstream tools see
/// the original header bytes.
pub fn merge_entries(
    entries: &[ArchiveEntry],
    prefix_with_run: &str,
    out_dir: &Path,
    s_img: u32,
    e_img: u32,
    group_frames: u32,
) -> Result<()> {
    if group_frames == 0 {
        return Err(Error::Config("group frame count must be at least 1".into()));
    }
    if e_img < s_img {
        return Err(Error::Config("end frame precedes start frame".into()));
    }
    fs::create_dir_all(out_dir)?;

    let frame_count = e_img - s_img + 1;
    let group_count = (f64::from(frame_count) / f64::from(group_frames)).round() as usize;

    let by_name: HashMap<&str, &ArchiveEntry> =
        entries.iter().map(|e| (e.name.as_str(), e)).collect();

    let mut accumulators: Vec<Vec<f32>> = vec![Vec::new(); group_count];
    let mut width = 0u32;
    let mut height = 0u32;
    let mut template: Option<&ArchiveEntry> = None;

    for t in 0..group_frames {
        for i in 0..group_count {
            let idx = s_img + i as u32 * group_frames + t;
            let name = format!("{prefix_with_run}{}.tif", zero_pad(idx, 5));
            let Some(entry) = by_name.get(name.as_str()).copied() else {
                continue;
            };
            let img = match tiff::read_gray(&entry.data) {
                Ok(img) => img,
                Err(e) => {
                    debug!("unreadable frame {name}: {e}");
                    continue;
                }
            };

            // The first readable frame fixes the dimensions, seeds every
            // group accumulator and becomes the patch template.
            if template.is_none() {
                width = img.width;
                height = img.height;
                template = Some(entry);
                debug!(
                    "template {name}: {width}x{height} software {:?}",
                    img.header.software
                );
                let zeros = vec![0.0f32; (width as usize) * (height as usize)];
                for acc in accumulators.iter_mut() {
                    *acc = zeros.clone();
                }
            }
            if img.pixels.len() != (width as usize) * (height as usize) {
                warn!("image size mismatch: {name}");
                continue;
            }
            for (a, p) in accumulators[i].iter_mut().zip(&img.pixels) {
                *a += *p;
            }
        }
    }

    let threshold = -(group_frames as f32);
    for (i, acc) in accumulators.iter_mut().enumerate() {
        if acc.is_empty() {
            error!(
                "no readable frames for group {}",
                zero_pad(i as u32 + 1, 5)
            );
            continue;
        }
        for v in acc.iter_mut() {
            if *v == threshold {
                *v = -1.0;
            } else if *v < threshold {
                *v = -2.0;
            }
        }

        let out_name = format!(
            "{prefix_with_run}{}.tif",
            zero_pad(s_img / 10 + i as u32 + 1, 5)
        );
        let out_path = out_dir.join(&out_name);
        let template_entry = template.expect("template set with accumulator");
        if let Err(e) = tiff::write_i32_patched(&out_path, acc, &template_entry.data) {
            error!("TIFF output failed: {}: {e}", out_path.display());
        }
    }
    Ok(())
}
