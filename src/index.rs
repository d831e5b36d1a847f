use crate::error::{Error, Result};
use crate::pattern::{set_number_for, TaskKey};

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub const INDEX_FILE_NAME: &str = ".file_index.bin";

// Paths are persisted in fixed NUL-padded fields.
const PATH_FIELD_LEN: usize = 512;

/// One set of frames grouped under a TaskKey. Snapshots of this struct are
/// handed to workers by value; the index keeps the authoritative copy.
#[derive(Debug, Clone)]
pub struct FileSet {
    pub run: u16,
    pub set_number: u32,
    /// frame number -> path, iterated in frame order.
    pub files: BTreeMap<u32, PathBuf>,
    pub processed: bool,
}

impl FileSet {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.run, self.set_number)
    }

    /// The member whose frame number equals the set number, if present.
    pub fn first_file(&self) -> Option<&PathBuf> {
        self.files.get(&self.set_number)
    }

    pub fn is_complete(&self, set_size: u32) -> bool {
        self.files.len() >= set_size as usize
    }

    pub fn sorted_paths(&self) -> Vec<PathBuf> {
        self.files.values().cloned().collect()
    }
}

/// In-memory file index with binary persistence in the watch directory.
/// Loaded at startup; rewritten when dropped if anything changed.
pub struct FileIndex {
    index_path: PathBuf,
    set_size: u32,
    file_sets: BTreeMap<TaskKey, FileSet>,
    path_keys: HashMap<PathBuf, TaskKey>,
    mod_times: HashMap<PathBuf, i64>,
    dirty: bool,
}

impl FileIndex {
    /// Load the index stored under `watch_dir`, starting empty when no
    /// index exists. A corrupt index is logged, discarded and rebuilt by
    /// the next full scan.
    pub fn open(watch_dir: &Path, set_size: u32) -> Self {
        let index_path = watch_dir.join(INDEX_FILE_NAME);
        let mut index = Self {
            index_path,
            set_size,
            file_sets: BTreeMap::new(),
            path_keys: HashMap::new(),
            mod_times: HashMap::new(),
            dirty: false,
        };

        if index.index_path.exists() {
            if let Err(e) = index.load() {
                error!("{e}");
                index.clear();
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.mod_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mod_times.is_empty()
    }

    /// Insert or update one file. `processed` only seeds the flag when the
    /// set does not exist yet; an existing set keeps its current state.
    pub fn add_file(&mut self, path: &Path, run: u16, frame: u32, mtime_millis: i64, processed: bool) {
        let key = TaskKey::new(run, set_number_for(frame, self.set_size));
        let set = self.file_sets.entry(key).or_insert_with(|| FileSet {
            run,
            set_number: key.set_number,
            files: BTreeMap::new(),
            processed,
        });
        set.files.insert(frame, path.to_path_buf());
        self.path_keys.insert(path.to_path_buf(), key);
        self.mod_times.insert(path.to_path_buf(), mtime_millis);
        self.dirty = true;
    }

    /// True for unknown paths and for paths whose stored mtime differs.
    pub fn has_file_changed(&self, path: &Path, mtime_millis: i64) -> bool {
        match self.mod_times.get(path) {
            Some(stored) => *stored != mtime_millis,
            None => true,
        }
    }

    pub fn mark_set_processed(&mut self, key: TaskKey, processed: bool) {
        if let Some(set) = self.file_sets.get_mut(&key) {
            if set.processed != processed {
                set.processed = processed;
                self.dirty = true;
            }
        }
    }

    pub fn get_file_set(&self, key: TaskKey) -> Option<FileSet> {
        self.file_sets.get(&key).cloned()
    }

    /// All sets in `(run, set_number)` order.
    pub fn get_all_sets(&self, include_processed: bool) -> Vec<FileSet> {
        self.file_sets
            .values()
            .filter(|s| include_processed || !s.processed)
            .cloned()
            .collect()
    }

    /// Drop every tracked path whose filesystem entry no longer exists,
    /// removing sets that end up empty.
    pub fn cleanup(&mut self) {
        let dead: Vec<PathBuf> = self
            .mod_times
            .keys()
            .filter(|p| !p.exists())
            .cloned()
            .collect();

        for path in dead {
            self.mod_times.remove(&path);
            if let Some(key) = self.path_keys.remove(&path) {
                if let Some(set) = self.file_sets.get_mut(&key) {
                    set.files.retain(|_, p| *p != path);
                    if set.files.is_empty() {
                        self.file_sets.remove(&key);
                    }
                }
            }
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        self.file_sets.clear();
        self.path_keys.clear();
        self.mod_times.clear();
        self.dirty = true;
    }

    fn load(&mut self) -> Result<()> {
        fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= buf.len())
                .ok_or_else(|| Error::IndexCorrupt("unexpected end of index".into()))?;
            let s = &buf[*pos..end];
            *pos = end;
            Ok(s)
        }

        let buf = fs::read(&self.index_path)
            .map_err(|e| Error::IndexCorrupt(format!("unreadable: {e}")))?;
        let suffix = Regex::new(r"_([0-9]{2})_([0-9]{5})\.tif$").expect("valid suffix pattern");

        let corrupt = |msg: &str| Error::IndexCorrupt(msg.to_string());
        let mut pos = 0usize;

        let set_count = u32::from_le_bytes(take(&buf, &mut pos, 4)?.try_into().unwrap());
        for _ in 0..set_count {
            let run = u16::from_le_bytes(take(&buf, &mut pos, 2)?.try_into().unwrap());
            let set_number = u32::from_le_bytes(take(&buf, &mut pos, 4)?.try_into().unwrap());
            let processed = match take(&buf, &mut pos, 1)?[0] {
                0 => false,
                1 => true,
                _ => return Err(corrupt("invalid processed flag")),
            };
            let file_count = u32::from_le_bytes(take(&buf, &mut pos, 4)?.try_into().unwrap());

            for _ in 0..file_count {
                let field = take(&buf, &mut pos, PATH_FIELD_LEN)?;
                let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
                let path_str = std::str::from_utf8(&field[..end])
                    .map_err(|_| corrupt("non-UTF-8 path"))?
                    .to_string();
                let mtime = i64::from_le_bytes(take(&buf, &mut pos, 8)?.try_into().unwrap());

                let caps = suffix
                    .captures(&path_str)
                    .ok_or_else(|| corrupt("path does not match frame pattern"))?;
                let file_run: u16 = caps[1].parse().map_err(|_| corrupt("bad run digits"))?;
                let frame: u32 = caps[2].parse().map_err(|_| corrupt("bad frame digits"))?;
                if file_run != run || set_number_for(frame, self.set_size) != set_number {
                    return Err(corrupt("file does not belong to its set"));
                }

                self.add_file(Path::new(&path_str), run, frame, mtime, processed);
                // add_file seeds the flag only on creation; enforce it for
                // sets resumed across multiple records.
                self.mark_set_processed(TaskKey::new(run, set_number), processed);
            }
        }

        if pos != buf.len() {
            return Err(corrupt("trailing bytes"));
        }
        self.dirty = false;
        Ok(())
    }

    /// Rewrite the on-disk index. Lossy by design: a crash between saves
    /// only costs a rescan.
    pub fn save(&mut self) -> Result<()> {
        let mut persistable: Vec<(&TaskKey, &FileSet, Vec<(&u32, &PathBuf)>)> = Vec::new();
        for (key, set) in &self.file_sets {
            let files: Vec<_> = set
                .files
                .iter()
                .filter(|(_, p)| match p.to_str() {
                    Some(s) if s.len() < PATH_FIELD_LEN => true,
                    _ => {
                        warn!("path too long for index, not persisted: {}", p.display());
                        false
                    }
                })
                .collect();
            if !files.is_empty() {
                persistable.push((key, set, files));
            }
        }

        let file = File::create(&self.index_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(&(persistable.len() as u32).to_le_bytes())?;
        for (_, set, files) in &persistable {
            w.write_all(&set.run.to_le_bytes())?;
            w.write_all(&set.set_number.to_le_bytes())?;
            w.write_all(&[u8::from(set.processed)])?;
            w.write_all(&(files.len() as u32).to_le_bytes())?;
            for (_, path) in files {
                let mut field = [0u8; PATH_FIELD_LEN];
                let bytes = path.to_str().expect("filtered to UTF-8").as_bytes();
                field[..bytes.len()].copy_from_slice(bytes);
                w.write_all(&field)?;
                let mtime = self.mod_times.get(*path).copied().unwrap_or(0);
                w.write_all(&mtime.to_le_bytes())?;
            }
        }
        w.flush()?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for FileIndex {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.save() {
                warn!("failed to save index {}: {e}", self.index_path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frame_path(dir: &Path, run: u16, frame: u32) -> PathBuf {
        dir.join(format!("test_{run:02}_{frame:05}.tif"))
    }

    #[test]
    fn groups_files_into_sets_with_first_file() {
        let tmp = TempDir::new().expect("tempdir");
        let mut index = FileIndex::open(tmp.path(), 10);

        for frame in [3u32, 1, 2, 11] {
            index.add_file(&frame_path(tmp.path(), 1, frame), 1, frame, 1000, false);
        }

        let sets = index.get_all_sets(true);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].key(), TaskKey::new(1, 1));
        assert_eq!(sets[0].files.len(), 3);
        assert_eq!(
            sets[0].first_file(),
            Some(&frame_path(tmp.path(), 1, 1))
        );
        assert_eq!(sets[1].key(), TaskKey::new(1, 11));
        assert_eq!(
            sets[1].first_file(),
            Some(&frame_path(tmp.path(), 1, 11))
        );
        assert!(!sets[0].is_complete(10));

        // Frame order, not insertion order.
        let paths = sets[0].sorted_paths();
        assert_eq!(paths[0], frame_path(tmp.path(), 1, 1));
        assert_eq!(paths[2], frame_path(tmp.path(), 1, 3));
    }

    #[test]
    fn change_detection_uses_stored_mtime() {
        let tmp = TempDir::new().expect("tempdir");
        let mut index = FileIndex::open(tmp.path(), 10);
        let p = frame_path(tmp.path(), 1, 1);

        assert!(index.has_file_changed(&p, 500));
        index.add_file(&p, 1, 1, 500, false);
        assert!(!index.has_file_changed(&p, 500));
        assert!(index.has_file_changed(&p, 501));
    }

    #[test]
    fn survives_save_and_reload() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let mut index = FileIndex::open(tmp.path(), 10);
            for frame in 1..=10u32 {
                index.add_file(&frame_path(tmp.path(), 2, frame), 2, frame, 7_000 + i64::from(frame), false);
            }
            index.add_file(&frame_path(tmp.path(), 3, 1), 3, 1, 9_000, false);
            index.mark_set_processed(TaskKey::new(2, 1), true);
            index.save().expect("save");
        }

        let index = FileIndex::open(tmp.path(), 10);
        assert_eq!(index.len(), 11);
        let set = index.get_file_set(TaskKey::new(2, 1)).expect("set");
        assert!(set.processed);
        assert!(set.is_complete(10));
        assert!(!index.has_file_changed(&frame_path(tmp.path(), 2, 4), 7_004));
        let other = index.get_file_set(TaskKey::new(3, 1)).expect("set");
        assert!(!other.processed);
    }

    #[test]
    fn corrupt_index_is_discarded() {
        let tmp = TempDir::new().expect("tempdir");
        fs::write(tmp.path().join(INDEX_FILE_NAME), b"not an index at all").expect("write");

        let index = FileIndex::open(tmp.path(), 10);
        assert!(index.is_empty());
        assert!(index.get_all_sets(true).is_empty());
    }

    #[test]
    fn cleanup_drops_vanished_files_and_empty_sets() {
        let tmp = TempDir::new().expect("tempdir");
        let mut index = FileIndex::open(tmp.path(), 10);

        let kept = frame_path(tmp.path(), 1, 1);
        fs::write(&kept, b"data").expect("write");
        let gone = frame_path(tmp.path(), 1, 11);

        index.add_file(&kept, 1, 1, 100, false);
        index.add_file(&gone, 1, 11, 100, false);
        index.cleanup();

        assert_eq!(index.len(), 1);
        assert!(index.get_file_set(TaskKey::new(1, 1)).is_some());
        assert!(index.get_file_set(TaskKey::new(1, 11)).is_none());
        assert!(index.has_file_changed(&gone, 100));
    }
}
