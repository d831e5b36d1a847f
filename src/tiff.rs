use crate::error::{Error, Result};

use std::fs;
use std::path::Path;

// Baseline TIFF tags used by this tool.
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_ORIENTATION: u16 = 274;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_X_RESOLUTION: u16 = 282;
const TAG_Y_RESOLUTION: u16 = 283;
const TAG_PLANAR_CONFIG: u16 = 284;
const TAG_RESOLUTION_UNIT: u16 = 296;
const TAG_SOFTWARE: u16 = 305;
const TAG_DATETIME: u16 = 306;
const TAG_ARTIST: u16 = 315;
const TAG_COPYRIGHT: u16 = 33432;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

const FMT_UINT: u16 = 1;
const FMT_INT: u16 = 2;
const FMT_IEEEFP: u16 = 3;

const COMPRESSION_NONE: u16 = 1;

/// Strip data in files written from scratch starts on a page boundary so
/// downstream mmap readers can map pixel data directly.
pub const STRIP_ALIGNMENT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    fn i32_bytes(self, v: i32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Header fields captured on read and replayed on scratch writes.
#[derive(Debug, Clone)]
pub struct TiffHeader {
    pub compression: u16,
    pub photometric: u16,
    pub orientation: u16,
    pub planar_config: u16,
    pub x_resolution: f32,
    pub y_resolution: f32,
    pub resolution_unit: u16,
    pub datetime: String,
    pub software: String,
    pub description: String,
    pub artist: String,
    pub copyright: String,
}

impl Default for TiffHeader {
    fn default() -> Self {
        Self {
            compression: COMPRESSION_NONE,
            photometric: 1, // min-is-black
            orientation: 1, // top-left
            planar_config: 1,
            x_resolution: 1.0,
            y_resolution: 1.0,
            resolution_unit: 2, // inch
            datetime: String::new(),
            software: String::new(),
            description: String::new(),
            artist: String::new(),
            copyright: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrayImage {
    pub pixels: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub header: TiffHeader,
}

struct Parsed {
    order: ByteOrder,
    width: u32,
    height: u32,
    bits: u16,
    sample_format: u16,
    strip_offsets: Vec<u64>,
    strip_byte_counts: Vec<u64>,
    header: TiffHeader,
}

fn bytes_at<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N]> {
    buf.get(pos..pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::TiffBackend("truncated TIFF".into()))
}

struct IfdField {
    ftype: u16,
    count: u32,
    value: [u8; 4],
}

impl IfdField {
    /// Integral values of a SHORT or LONG field, inline or external.
    fn ints(&self, buf: &[u8], order: ByteOrder) -> Result<Vec<u64>> {
        let size = match self.ftype {
            TYPE_SHORT => 2usize,
            TYPE_LONG => 4usize,
            _ => {
                return Err(Error::TiffBackend(format!(
                    "unexpected field type {}",
                    self.ftype
                )))
            }
        };
        let count = self.count as usize;
        let total = size * count;
        let start = if total <= 4 {
            None
        } else {
            Some(order.u32(self.value) as usize)
        };

        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let v = match start {
                None => {
                    let b = &self.value[i * size..(i + 1) * size];
                    if size == 2 {
                        u64::from(order.u16(b.try_into().unwrap()))
                    } else {
                        u64::from(order.u32(b.try_into().unwrap()))
                    }
                }
                Some(base) => {
                    if size == 2 {
                        u64::from(order.u16(bytes_at(buf, base + i * size)?))
                    } else {
                        u64::from(order.u32(bytes_at(buf, base + i * size)?))
                    }
                }
            };
            out.push(v);
        }
        Ok(out)
    }

    fn first_int(&self, buf: &[u8], order: ByteOrder) -> Result<u64> {
        self.ints(buf, order)?
            .first()
            .copied()
            .ok_or_else(|| Error::TiffBackend("empty tag value".into()))
    }

    fn rational(&self, buf: &[u8], order: ByteOrder) -> Result<f32> {
        if self.ftype != TYPE_RATIONAL {
            return Err(Error::TiffBackend("expected RATIONAL value".into()));
        }
        let base = order.u32(self.value) as usize;
        let num = order.u32(bytes_at(buf, base)?);
        let den = order.u32(bytes_at(buf, base + 4)?);
        if den == 0 {
            return Ok(0.0);
        }
        Ok(num as f32 / den as f32)
    }

    fn ascii(&self, buf: &[u8], order: ByteOrder) -> Result<String> {
        let count = self.count as usize;
        let raw: &[u8] = if count <= 4 {
            &self.value[..count]
        } else {
            let base = order.u32(self.value) as usize;
            buf.get(base..base + count)
                .ok_or_else(|| Error::TiffBackend("truncated TIFF".into()))?
        };
        let trimmed: Vec<u8> = raw.iter().copied().take_while(|b| *b != 0).collect();
        String::from_utf8(trimmed)
            .map_err(|_| Error::TiffBackend("non-UTF-8 ASCII tag".into()))
    }
}

fn parse_ifd(buf: &[u8]) -> Result<Parsed> {
    let order = match buf.get(0..2) {
        Some(b"II") => ByteOrder::Little,
        Some(b"MM") => ByteOrder::Big,
        _ => return Err(Error::TiffBackend("not a TIFF file".into())),
    };
    if order.u16(bytes_at(buf, 2)?) != 42 {
        return Err(Error::TiffBackend("bad TIFF magic".into()));
    }
    let ifd_offset = order.u32(bytes_at(buf, 4)?) as usize;

    let entry_count = order.u16(bytes_at(buf, ifd_offset)?) as usize;
    let mut parsed = Parsed {
        order,
        width: 0,
        height: 0,
        bits: 8,
        sample_format: FMT_UINT,
        strip_offsets: Vec::new(),
        strip_byte_counts: Vec::new(),
        header: TiffHeader::default(),
    };
    let mut samples_per_pixel = 1u64;

    for i in 0..entry_count {
        let at = ifd_offset + 2 + i * 12;
        let tag = order.u16(bytes_at(buf, at)?);
        let field = IfdField {
            ftype: order.u16(bytes_at(buf, at + 2)?),
            count: order.u32(bytes_at(buf, at + 4)?),
            value: bytes_at(buf, at + 8)?,
        };

        match tag {
            TAG_IMAGE_WIDTH => parsed.width = field.first_int(buf, order)? as u32,
            TAG_IMAGE_LENGTH => parsed.height = field.first_int(buf, order)? as u32,
            TAG_BITS_PER_SAMPLE => parsed.bits = field.first_int(buf, order)? as u16,
            TAG_SAMPLE_FORMAT => parsed.sample_format = field.first_int(buf, order)? as u16,
            TAG_SAMPLES_PER_PIXEL => samples_per_pixel = field.first_int(buf, order)?,
            TAG_STRIP_OFFSETS => parsed.strip_offsets = field.ints(buf, order)?,
            TAG_STRIP_BYTE_COUNTS => parsed.strip_byte_counts = field.ints(buf, order)?,
            TAG_COMPRESSION => parsed.header.compression = field.first_int(buf, order)? as u16,
            TAG_PHOTOMETRIC => parsed.header.photometric = field.first_int(buf, order)? as u16,
            TAG_ORIENTATION => parsed.header.orientation = field.first_int(buf, order)? as u16,
            TAG_PLANAR_CONFIG => parsed.header.planar_config = field.first_int(buf, order)? as u16,
            TAG_RESOLUTION_UNIT => {
                parsed.header.resolution_unit = field.first_int(buf, order)? as u16
            }
            TAG_X_RESOLUTION => parsed.header.x_resolution = field.rational(buf, order)?,
            TAG_Y_RESOLUTION => parsed.header.y_resolution = field.rational(buf, order)?,
            TAG_DATETIME => parsed.header.datetime = field.ascii(buf, order)?,
            TAG_SOFTWARE => parsed.header.software = field.ascii(buf, order)?,
            TAG_IMAGE_DESCRIPTION => parsed.header.description = field.ascii(buf, order)?,
            TAG_ARTIST => parsed.header.artist = field.ascii(buf, order)?,
            TAG_COPYRIGHT => parsed.header.copyright = field.ascii(buf, order)?,
            _ => {}
        }
    }

    if parsed.width == 0 || parsed.height == 0 {
        return Err(Error::TiffBackend("missing image dimensions".into()));
    }
    if samples_per_pixel != 1 {
        return Err(Error::TiffBackend(
            "only single-sample grayscale images are supported".into(),
        ));
    }
    if parsed.strip_offsets.is_empty() {
        return Err(Error::TiffBackend("missing strip offsets".into()));
    }
    if parsed.strip_byte_counts.len() != parsed.strip_offsets.len() {
        return Err(Error::TiffBackend("strip offset/count mismatch".into()));
    }
    Ok(parsed)
}

/// Read a single-sample grayscale TIFF from memory, converting every pixel
/// to `f32`. Accepts 32-bit float and 8/16/32-bit integer samples.
pub fn read_gray(bytes: &[u8]) -> Result<GrayImage> {
    let parsed = parse_ifd(bytes)?;
    if parsed.header.compression != COMPRESSION_NONE {
        return Err(Error::TiffBackend(format!(
            "unsupported compression {}",
            parsed.header.compression
        )));
    }

    let sample_size = match (parsed.sample_format, parsed.bits) {
        (FMT_IEEEFP, 32) => 4usize,
        (FMT_UINT, 8) | (FMT_INT, 8) => 1,
        (FMT_UINT, 16) | (FMT_INT, 16) => 2,
        (FMT_UINT, 32) | (FMT_INT, 32) => 4,
        (fmt, bits) => {
            return Err(Error::TiffBackend(format!(
                "unsupported sample format {fmt}/{bits}"
            )))
        }
    };

    let order = parsed.order;
    let npixels = parsed.width as usize * parsed.height as usize;
    let mut pixels = Vec::with_capacity(npixels);

    for (offset, count) in parsed
        .strip_offsets
        .iter()
        .zip(&parsed.strip_byte_counts)
    {
        let start = *offset as usize;
        let end = start
            .checked_add(*count as usize)
            .ok_or_else(|| Error::TiffBackend("strip out of range".into()))?;
        let strip = bytes
            .get(start..end)
            .ok_or_else(|| Error::TiffBackend("strip out of range".into()))?;

        for chunk in strip.chunks_exact(sample_size) {
            let v = match (parsed.sample_format, parsed.bits) {
                (FMT_IEEEFP, 32) => f32::from_bits(order.u32(chunk.try_into().unwrap())),
                (FMT_UINT, 8) => f32::from(chunk[0]),
                (FMT_UINT, 16) => f32::from(order.u16(chunk.try_into().unwrap())),
                (FMT_UINT, 32) => order.u32(chunk.try_into().unwrap()) as f32,
                (FMT_INT, 8) => f32::from(chunk[0] as i8),
                (FMT_INT, 16) => f32::from(order.u16(chunk.try_into().unwrap()) as i16),
                (FMT_INT, 32) => (order.u32(chunk.try_into().unwrap()) as i32) as f32,
                _ => unreachable!(),
            };
            pixels.push(v);
        }
    }

    if pixels.len() != npixels {
        return Err(Error::TiffBackend(format!(
            "pixel count mismatch: strips hold {}, dimensions need {}",
            pixels.len(),
            npixels
        )));
    }

    Ok(GrayImage {
        pixels,
        width: parsed.width,
        height: parsed.height,
        header: parsed.header,
    })
}

struct IfdEntry {
    tag: u16,
    ftype: u16,
    count: u32,
    value: Vec<u8>,
}

fn short(tag: u16, v: u16) -> IfdEntry {
    IfdEntry {
        tag,
        ftype: TYPE_SHORT,
        count: 1,
        value: v.to_le_bytes().to_vec(),
    }
}

fn long(tag: u16, v: u32) -> IfdEntry {
    IfdEntry {
        tag,
        ftype: TYPE_LONG,
        count: 1,
        value: v.to_le_bytes().to_vec(),
    }
}

fn rational(tag: u16, v: f32) -> IfdEntry {
    let (num, den) = if v <= 0.0 {
        (0u32, 1u32)
    } else {
        ((v * 10_000.0).round() as u32, 10_000u32)
    };
    let mut value = Vec::with_capacity(8);
    value.extend_from_slice(&num.to_le_bytes());
    value.extend_from_slice(&den.to_le_bytes());
    IfdEntry {
        tag,
        ftype: TYPE_RATIONAL,
        count: 1,
        value,
    }
}

fn ascii(tag: u16, s: &str) -> IfdEntry {
    let mut value = s.as_bytes().to_vec();
    value.push(0);
    IfdEntry {
        tag,
        ftype: TYPE_ASCII,
        count: value.len() as u32,
        value,
    }
}

/// Write a 32-bit signed, uncompressed, single-strip grayscale TIFF.
/// Pixel data is padded out to the next 4096-byte boundary so downstream
/// mmap readers can map it directly. Integrated outputs go through
/// [`write_i32_patched`] instead; this is the template-free writer.
#[allow(dead_code)]
pub fn write_i32_aligned(
    path: &Path,
    pixels: &[f32],
    width: u32,
    height: u32,
    hdr: &TiffHeader,
) -> Result<()> {
    if pixels.len() != width as usize * height as usize {
        return Err(Error::TiffBackend(format!(
            "pixel buffer holds {} samples, dimensions need {}",
            pixels.len(),
            width as usize * height as usize
        )));
    }

    let data_len = pixels.len() * 4;
    let mut entries = vec![
        long(TAG_IMAGE_WIDTH, width),
        long(TAG_IMAGE_LENGTH, height),
        short(TAG_BITS_PER_SAMPLE, 32),
        short(TAG_COMPRESSION, COMPRESSION_NONE),
        short(TAG_PHOTOMETRIC, hdr.photometric),
        long(TAG_STRIP_OFFSETS, 0), // patched below
        short(TAG_ORIENTATION, hdr.orientation),
        short(TAG_SAMPLES_PER_PIXEL, 1),
        long(TAG_ROWS_PER_STRIP, height),
        long(TAG_STRIP_BYTE_COUNTS, data_len as u32),
        rational(TAG_X_RESOLUTION, hdr.x_resolution),
        rational(TAG_Y_RESOLUTION, hdr.y_resolution),
        short(TAG_PLANAR_CONFIG, hdr.planar_config),
        short(TAG_RESOLUTION_UNIT, hdr.resolution_unit),
        short(TAG_SAMPLE_FORMAT, FMT_INT),
    ];
    if !hdr.description.is_empty() {
        entries.push(ascii(TAG_IMAGE_DESCRIPTION, &hdr.description));
    }
    if !hdr.software.is_empty() {
        entries.push(ascii(TAG_SOFTWARE, &hdr.software));
    }
    if !hdr.datetime.is_empty() {
        entries.push(ascii(TAG_DATETIME, &hdr.datetime));
    }
    if !hdr.artist.is_empty() {
        entries.push(ascii(TAG_ARTIST, &hdr.artist));
    }
    if !hdr.copyright.is_empty() {
        entries.push(ascii(TAG_COPYRIGHT, &hdr.copyright));
    }
    entries.sort_by_key(|e| e.tag);

    // Layout: header, IFD, external values, pad to page, strip data.
    let ifd_offset = 8usize;
    let ifd_len = 2 + entries.len() * 12 + 4;
    let mut external_at = ifd_offset + ifd_len;
    let mut externals: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut value_fields: Vec<[u8; 4]> = Vec::new();

    for entry in &entries {
        if entry.value.len() <= 4 {
            let mut field = [0u8; 4];
            field[..entry.value.len()].copy_from_slice(&entry.value);
            value_fields.push(field);
        } else {
            if external_at % 2 != 0 {
                external_at += 1;
            }
            value_fields.push((external_at as u32).to_le_bytes());
            externals.push((external_at, entry.value.clone()));
            external_at += entry.value.len();
        }
    }

    let strip_offset = external_at.div_ceil(STRIP_ALIGNMENT) * STRIP_ALIGNMENT;
    let mut out = vec![0u8; strip_offset + data_len];

    out[0..2].copy_from_slice(b"II");
    out[2..4].copy_from_slice(&42u16.to_le_bytes());
    out[4..8].copy_from_slice(&(ifd_offset as u32).to_le_bytes());

    out[ifd_offset..ifd_offset + 2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    for (i, entry) in entries.iter().enumerate() {
        let at = ifd_offset + 2 + i * 12;
        out[at..at + 2].copy_from_slice(&entry.tag.to_le_bytes());
        out[at + 2..at + 4].copy_from_slice(&entry.ftype.to_le_bytes());
        out[at + 4..at + 8].copy_from_slice(&entry.count.to_le_bytes());
        let field = if entry.tag == TAG_STRIP_OFFSETS {
            (strip_offset as u32).to_le_bytes()
        } else {
            value_fields[i]
        };
        out[at + 8..at + 12].copy_from_slice(&field);
    }
    // next-IFD pointer stays zero

    for (at, value) in externals {
        out[at..at + value.len()].copy_from_slice(&value);
    }

    for (i, v) in pixels.iter().enumerate() {
        let at = strip_offset + i * 4;
        out[at..at + 4].copy_from_slice(&(*v as i32).to_le_bytes());
    }

    fs::write(path, &out)?;
    Ok(())
}

/// Write a TIFF by splicing 32-bit signed pixel data into a byte-for-byte
/// copy of `original`, preserving its header exactly. Fails when the
/// template has no strips or the new data does not fit inside it.
pub fn write_i32_patched(path: &Path, pixels: &[f32], original: &[u8]) -> Result<()> {
    let parsed = parse_ifd(original)?;
    if parsed.strip_offsets.is_empty() {
        return Err(Error::TiffBackend("template has no strips".into()));
    }

    let strip0 = parsed.strip_offsets[0] as usize;
    let new_len = pixels.len() * 4;
    if strip0 + new_len > original.len() {
        return Err(Error::TiffBackend(format!(
            "pixel data ({} bytes at offset {}) exceeds template size {}",
            new_len,
            strip0,
            original.len()
        )));
    }

    let mut out = original.to_vec();
    for (i, v) in pixels.iter().enumerate() {
        let at = strip0 + i * 4;
        out[at..at + 4].copy_from_slice(&parsed.order.i32_bytes(*v as i32));
    }

    fs::write(path, &out)?;
    Ok(())
}
