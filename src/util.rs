use filetime::FileTime;
use std::fs::Metadata;

/// Zero-padded decimal rendering, e.g. `zero_pad(7, 5) == "00007"`.
pub fn zero_pad(number: u32, width: usize) -> String {
    format!("{:0width$}", number, width = width)
}

/// Portable epoch-millisecond mtime, stable across restarts and platforms.
pub fn mtime_millis(meta: &Metadata) -> i64 {
    let ft = FileTime::from_last_modification_time(meta);
    ft.unix_seconds() * 1000 + i64::from(ft.nanoseconds() / 1_000_000)
}

pub fn timestamp_for_filename() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}
