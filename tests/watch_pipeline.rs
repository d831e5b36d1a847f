use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MAGIC: u32 = 0x4134_5A4C;

fn framepack() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("framepack"))
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn drop_frames(dir: &Path, run: u16, frames: std::ops::RangeInclusive<u32>) {
    for f in frames {
        let path = dir.join(format!("test_{run:02}_{f:05}.tif"));
        let mut payload = format!("frame {run}/{f} ").into_bytes();
        payload.extend(std::iter::repeat(f as u8).take(2048));
        fs::write(path, payload).expect("write frame");
    }
}

/// Minimal reader for the archive container: length-prefixed metadata
/// (magic, version, file records) followed by one LZ4 block.
fn decode_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
    let buf = fs::read(path).expect("read archive");
    let u32_at = |p: usize| u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
    let u64_at = |p: usize| u64::from_le_bytes(buf[p..p + 8].try_into().unwrap());

    let meta_len = u64_at(0) as usize;
    let mut pos = 8;
    assert_eq!(u32_at(pos), MAGIC, "archive magic");
    assert_eq!(u32_at(pos + 4), 1, "archive version");
    let count = u64_at(pos + 8) as usize;
    pos += 16;

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = u32_at(pos) as usize;
        pos += 4;
        let name = String::from_utf8(buf[pos..pos + name_len].to_vec()).expect("utf8 name");
        pos += name_len;
        let ext_len = u32_at(pos) as usize;
        pos += 4 + ext_len;
        let orig_size = u64_at(pos) as usize;
        pos += 8;
        let offset = u64_at(pos) as usize;
        pos += 8;
        records.push((name, orig_size, offset));
    }
    assert_eq!(pos, 8 + meta_len, "metadata length");

    let comp_len = u64_at(pos) as usize;
    pos += 8;
    let total: usize = records.iter().map(|(_, size, _)| size).sum();
    let raw =
        lz4_flex::block::decompress(&buf[pos..pos + comp_len], total).expect("lz4 decompress");

    records
        .into_iter()
        .map(|(name, size, offset)| (name, raw[offset..offset + size].to_vec()))
        .collect()
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn once_mode_packs_backlog_and_deletes_verified_originals() {
    let tmp = TempDir::new().expect("tempdir");
    let watch = tmp.path().join("watch");
    let out = tmp.path().join("out");
    fs::create_dir_all(&watch).expect("mkdir watch");
    drop_frames(&watch, 1, 1..=10);

    let run = framepack()
        .current_dir(tmp.path())
        .arg("--no-log-file")
        .arg("watch")
        .arg(&watch)
        .arg(&out)
        .arg("--set-size")
        .arg("10")
        .arg("--once")
        .stdin(Stdio::null())
        .output()
        .expect("run watch");
    assert!(run.status.success(), "{}", combined_output(&run));

    let archive = out.join("test_01_00001.lz4");
    assert!(archive.exists(), "archive missing");
    assert!(out.join("test_01_00001.tif").exists(), "reference copy missing");
    assert!(
        watch.join(".file_index.bin").exists(),
        "persistent index missing"
    );

    // First frame is protected, the other nine are gone.
    assert!(watch.join("test_01_00001.tif").exists());
    for f in 2..=10u32 {
        assert!(
            !watch.join(format!("test_01_{f:05}.tif")).exists(),
            "frame {f} should have been deleted"
        );
    }

    let entries = decode_archive(&archive);
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[0].0, "test_01_00001.tif");
    assert_eq!(entries[0].1, fs::read(out.join("test_01_00001.tif")).unwrap());
}

#[test]
fn interleaved_runs_produce_one_archive_per_set_in_frame_order() {
    let tmp = TempDir::new().expect("tempdir");
    let watch = tmp.path().join("watch");
    let out = tmp.path().join("out");
    fs::create_dir_all(&watch).expect("mkdir watch");

    // Interleave arrival of the two runs.
    for f in 1..=10u32 {
        drop_frames(&watch, 1, f..=f);
        drop_frames(&watch, 2, f..=f);
    }

    let run = framepack()
        .current_dir(tmp.path())
        .arg("--no-log-file")
        .arg("watch")
        .arg(&watch)
        .arg(&out)
        .arg("--set-size")
        .arg("10")
        .arg("--keep-originals")
        .arg("--once")
        .stdin(Stdio::null())
        .output()
        .expect("run watch");
    assert!(run.status.success(), "{}", combined_output(&run));

    for run_no in 1..=2u16 {
        let archive = out.join(format!("test_{run_no:02}_00001.lz4"));
        let entries = decode_archive(&archive);
        assert_eq!(entries.len(), 10, "run {run_no}");
        for (i, (name, data)) in entries.iter().enumerate() {
            let expected = format!("test_{run_no:02}_{:05}.tif", i + 1);
            assert_eq!(*name, expected, "member order in run {run_no}");
            assert_eq!(
                *data,
                fs::read(watch.join(&expected)).unwrap(),
                "bytes of {expected}"
            );
        }
    }
}

#[test]
fn corrupt_index_is_rebuilt_and_sets_still_process() {
    let tmp = TempDir::new().expect("tempdir");
    let watch = tmp.path().join("watch");
    let out = tmp.path().join("out");
    fs::create_dir_all(&watch).expect("mkdir watch");
    drop_frames(&watch, 1, 1..=5);
    fs::write(watch.join(".file_index.bin"), b"\xde\xad\xbe\xef garbage").expect("corrupt");

    let run = framepack()
        .current_dir(tmp.path())
        .arg("--no-log-file")
        .arg("watch")
        .arg(&watch)
        .arg(&out)
        .arg("--set-size")
        .arg("5")
        .arg("--once")
        .stdin(Stdio::null())
        .output()
        .expect("run watch");
    let text = combined_output(&run);
    assert!(run.status.success(), "{text}");
    assert!(text.contains("index file corrupt"), "missing corruption log: {text}");
    assert!(out.join("test_01_00001.lz4").exists());
}

#[test]
fn incomplete_set_is_left_untouched() {
    let tmp = TempDir::new().expect("tempdir");
    let watch = tmp.path().join("watch");
    let out = tmp.path().join("out");
    fs::create_dir_all(&watch).expect("mkdir watch");
    drop_frames(&watch, 1, 1..=9); // one frame short of a set of 10

    let run = framepack()
        .current_dir(tmp.path())
        .arg("--no-log-file")
        .arg("watch")
        .arg(&watch)
        .arg(&out)
        .arg("--set-size")
        .arg("10")
        .arg("--once")
        .stdin(Stdio::null())
        .output()
        .expect("run watch");
    assert!(run.status.success(), "{}", combined_output(&run));

    assert!(!out.join("test_01_00001.lz4").exists());
    for f in 1..=9u32 {
        assert!(watch.join(format!("test_01_{f:05}.tif")).exists());
    }
}

#[test]
fn continuous_watch_archives_only_after_the_set_completes() {
    let tmp = TempDir::new().expect("tempdir");
    let watch = tmp.path().join("watch");
    let out = tmp.path().join("out");
    fs::create_dir_all(&watch).expect("mkdir watch");
    drop_frames(&watch, 1, 1..=5);

    let mut child = framepack()
        .current_dir(tmp.path())
        .arg("--no-log-file")
        .arg("watch")
        .arg(&watch)
        .arg(&out)
        .arg("--set-size")
        .arg("10")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn watch");

    let archive = out.join("test_01_00001.lz4");
    std::thread::sleep(Duration::from_secs(2));
    assert!(!archive.exists(), "half a set must not be archived");

    drop_frames(&watch, 1, 6..=10);
    // The reference copy lands after the archive is written and verified,
    // so waiting on it avoids reading a file still being flushed.
    assert!(
        wait_for(&out.join("test_01_00001.tif"), Duration::from_secs(20)),
        "archive did not appear after set completed"
    );
    assert!(archive.exists());

    child.kill().expect("kill watch");
    let _ = child.wait();

    let entries = decode_archive(&archive);
    assert_eq!(entries.len(), 10);
}
