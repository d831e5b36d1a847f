use crate::error::{Error, Result};

use lz4_flex::block;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

// "LZ4A" in little endian.
pub const MAGIC: u32 = 0x4134_5A4C;
pub const VERSION: u32 = 1;

/// One member file read from disk, pending archival.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub ext: String,
    pub data: Vec<u8>,
}

/// One member recovered from an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

struct RecordMeta {
    name: String,
    orig_size: u64,
    offset: u64,
}

/// Read every member in parallel. The returned order equals the input
/// order, so the archive byte layout is deterministic.
pub fn read_set(paths: &[PathBuf], read_threads: usize) -> Result<Vec<SourceFile>> {
    if paths.is_empty() {
        return Err(Error::EmptyInput);
    }

    let threads = read_threads.clamp(1, paths.len());
    let per_thread = (paths.len() + threads - 1) / threads;
    let results: Mutex<Vec<(usize, Result<SourceFile>)>> =
        Mutex::new(Vec::with_capacity(paths.len()));

    thread::scope(|s| {
        for start in (0..paths.len()).step_by(per_thread) {
            let end = (start + per_thread).min(paths.len());
            let slice = &paths[start..end];
            let results = &results;
            s.spawn(move || {
                for (off, path) in slice.iter().enumerate() {
                    let item = (start + off, read_one(path));
                    results.lock().unwrap().push(item);
                }
            });
        }
    });

    let mut collected = results.into_inner().unwrap();
    collected.sort_by_key(|(idx, _)| *idx);
    collected.into_iter().map(|(_, r)| r).collect()
}

fn read_one(path: &Path) -> Result<SourceFile> {
    let read_err = |e| Error::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    };

    let expected = fs::metadata(path).map_err(read_err)?.len();
    let data = fs::read(path).map_err(read_err)?;
    if data.len() as u64 != expected {
        return Err(Error::ReadShort {
            path: path.to_path_buf(),
            expected,
            got: data.len() as u64,
        });
    }

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Parse(format!("non-UTF-8 file name: {}", path.display())))?
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{s}"))
        .unwrap_or_default();

    Ok(SourceFile { name, ext, data })
}

fn serialize_metadata(sources: &[SourceFile]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(sources.len() as u64).to_le_bytes());

    let mut offset = 0u64;
    for src in sources {
        out.extend_from_slice(&(src.name.len() as u32).to_le_bytes());
        out.extend_from_slice(src.name.as_bytes());
        out.extend_from_slice(&(src.ext.len() as u32).to_le_bytes());
        out.extend_from_slice(src.ext.as_bytes());
        out.extend_from_slice(&(src.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        offset += src.data.len() as u64;
    }
    out
}

/// Compress `sources` into the container at `out` and confirm the final
/// file size matches the layout exactly.
pub fn write_archive(sources: &[SourceFile], out: &Path) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::EmptyInput);
    }

    let metadata = serialize_metadata(sources);

    let total: usize = sources.iter().map(|s| s.data.len()).sum();
    let mut combined = Vec::with_capacity(total);
    for src in sources {
        combined.extend_from_slice(&src.data);
    }

    let mut compressed = vec![0u8; block::get_maximum_output_size(combined.len())];
    let written = block::compress_into(&combined, &mut compressed)
        .map_err(|e| Error::CompressFailed(e.to_string()))?;
    compressed.truncate(written);
    drop(combined);

    let write_err = |e| Error::WriteFailed {
        path: out.to_path_buf(),
        source: e,
    };

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    {
        let file = File::create(out).map_err(write_err)?;
        let mut w = BufWriter::new(file);
        w.write_all(&(metadata.len() as u64).to_le_bytes())
            .map_err(write_err)?;
        w.write_all(&metadata).map_err(write_err)?;
        w.write_all(&(compressed.len() as u64).to_le_bytes())
            .map_err(write_err)?;
        w.write_all(&compressed).map_err(write_err)?;
        w.flush().map_err(write_err)?;
    }

    let expected = 8 + metadata.len() as u64 + 8 + compressed.len() as u64;
    let actual = fs::metadata(out).map_err(write_err)?.len();
    if actual != expected {
        return Err(Error::SizeMismatch { expected, actual });
    }
    Ok(())
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(Error::TruncatedMetadata)?;
    if end > buf.len() {
        return Err(Error::TruncatedMetadata);
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap()))
}

fn take_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap()))
}

fn parse_metadata(buf: &[u8]) -> Result<Vec<RecordMeta>> {
    let mut pos = 0usize;

    let magic = take_u32(buf, &mut pos)?;
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = take_u32(buf, &mut pos)?;
    if version != VERSION {
        return Err(Error::VersionMismatch(version));
    }

    let count = take_u64(buf, &mut pos)?;
    let mut records = Vec::new();
    for _ in 0..count {
        let name_len = take_u32(buf, &mut pos)? as usize;
        let name = std::str::from_utf8(take(buf, &mut pos, name_len)?)
            .map_err(|_| Error::Parse("archive member name is not valid UTF-8".into()))?
            .to_string();
        let ext_len = take_u32(buf, &mut pos)? as usize;
        take(buf, &mut pos, ext_len)?;
        let orig_size = take_u64(buf, &mut pos)?;
        let offset = take_u64(buf, &mut pos)?;
        records.push(RecordMeta {
            name,
            orig_size,
            offset,
        });
    }
    Ok(records)
}

/// Decode a whole archive into in-memory entries.
pub fn decode(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let buf = fs::read(path).map_err(|e| Error::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut pos = 0usize;
    let meta_len = take_u64(&buf, &mut pos)? as usize;
    let metadata = take(&buf, &mut pos, meta_len)?;
    let records = parse_metadata(metadata)?;

    let comp_len = take_u64(&buf, &mut pos)? as usize;
    let compressed = take(&buf, &mut pos, comp_len)?;

    let mut total: u64 = 0;
    for rec in &records {
        total = total
            .checked_add(rec.orig_size)
            .ok_or(Error::TruncatedMetadata)?;
    }
    let decompressed = block::decompress(compressed, total as usize)
        .map_err(|e| Error::DecompressFailed(e.to_string()))?;
    if decompressed.len() as u64 != total {
        return Err(Error::SizeMismatch {
            expected: total,
            actual: decompressed.len() as u64,
        });
    }

    let mut entries = Vec::with_capacity(records.len());
    for rec in records {
        let start = rec.offset as usize;
        let end = start
            .checked_add(rec.orig_size as usize)
            .ok_or(Error::TruncatedMetadata)?;
        if end > decompressed.len() {
            return Err(Error::TruncatedMetadata);
        }
        entries.push(ArchiveEntry {
            name: rec.name,
            data: decompressed[start..end].to_vec(),
        });
    }
    Ok(entries)
}

/// Cheap structural check used before trusting a pre-existing output: the
/// declared section lengths must line up with the file size and the
/// metadata magic and version must be valid.
pub fn validate_container(path: &Path) -> bool {
    fn inner(path: &Path) -> Result<()> {
        let mut f = File::open(path)?;
        let file_len = f.metadata()?.len();

        let mut hdr = [0u8; 8];
        f.read_exact(&mut hdr)?;
        let meta_len = u64::from_le_bytes(hdr);
        // Lengths come from a possibly torn or corrupt file; keep the
        // arithmetic checked like take() does.
        let header_end = meta_len.checked_add(16).ok_or(Error::TruncatedMetadata)?;
        if meta_len < 16 || header_end > file_len {
            return Err(Error::TruncatedMetadata);
        }

        let mut mv = [0u8; 8];
        f.read_exact(&mut mv)?;
        let magic = u32::from_le_bytes(mv[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(mv[4..8].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        if version != VERSION {
            return Err(Error::VersionMismatch(version));
        }

        f.seek(SeekFrom::Start(header_end - 8))?;
        let mut cl = [0u8; 8];
        f.read_exact(&mut cl)?;
        let comp_len = u64::from_le_bytes(cl);
        let expected = header_end
            .checked_add(comp_len)
            .ok_or(Error::TruncatedMetadata)?;
        if expected != file_len {
            return Err(Error::SizeMismatch {
                expected,
                actual: file_len,
            });
        }
        Ok(())
    }
    inner(path).is_ok()
}

/// Decode the just-written archive and compare it member-for-member with
/// the source bytes. Called before any original may be deleted.
pub fn verify_roundtrip(archive: &Path, sources: &[SourceFile]) -> Result<()> {
    let entries = decode(archive)?;
    if entries.len() != sources.len() {
        return Err(Error::VerifyMismatch(format!(
            "member count: archived {}, expected {}",
            entries.len(),
            sources.len()
        )));
    }
    for (entry, src) in entries.iter().zip(sources) {
        if entry.name != src.name {
            return Err(Error::VerifyMismatch(format!(
                "member name: archived {:?}, expected {:?}",
                entry.name, src.name
            )));
        }
        if entry.data != src.data {
            return Err(Error::VerifyMismatch(format!(
                "member bytes differ: {}",
                entry.name
            )));
        }
    }
    Ok(())
}
