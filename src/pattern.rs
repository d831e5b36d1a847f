use regex::Regex;

/// Identifies one set of frames: the run it belongs to and the lowest
/// frame number of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub run: u16,
    pub set_number: u32,
}

impl TaskKey {
    pub fn new(run: u16, set_number: u32) -> Self {
        Self { run, set_number }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {:02} set {:05}", self.run, self.set_number)
    }
}

/// First frame number of the set containing `frame`. Frames are 1-based.
pub fn set_number_for(frame: u32, set_size: u32) -> u32 {
    ((frame - 1) / set_size) * set_size + 1
}

/// Matches `<prefix>_<RR>_<NNNNN>.tif` with a two-digit run number and a
/// five-digit frame number.
#[derive(Debug)]
pub struct FilePattern {
    regex: Regex,
}

impl FilePattern {
    pub fn new(prefix: &str) -> Self {
        let regex = Regex::new(&format!(
            "^{}_([0-9]{{2}})_([0-9]{{5}})\\.tif$",
            regex::escape(prefix)
        ))
        .expect("valid frame pattern");
        Self { regex }
    }

    /// Parse a bare filename into `(run, frame)`.
    pub fn parse(&self, filename: &str) -> Option<(u16, u32)> {
        let caps = self.regex.captures(filename)?;
        let run = caps.get(1)?.as_str().parse().ok()?;
        let frame = caps.get(2)?.as_str().parse().ok()?;
        Some((run, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matching_filenames() {
        let pat = FilePattern::new("test");
        assert_eq!(pat.parse("test_01_00001.tif"), Some((1, 1)));
        assert_eq!(pat.parse("test_12_34567.tif"), Some((12, 34567)));
    }

    #[test]
    fn rejects_non_matching_filenames() {
        let pat = FilePattern::new("test");
        assert_eq!(pat.parse("test_1_00001.tif"), None);
        assert_eq!(pat.parse("test_01_0001.tif"), None);
        assert_eq!(pat.parse("test_01_00001.tiff"), None);
        assert_eq!(pat.parse("other_01_00001.tif"), None);
        assert_eq!(pat.parse("test_01_00001.tif.bak"), None);
    }

    #[test]
    fn prefix_is_escaped() {
        let pat = FilePattern::new("a.b");
        assert_eq!(pat.parse("a.b_01_00001.tif"), Some((1, 1)));
        assert_eq!(pat.parse("axb_01_00001.tif"), None);
    }

    #[test]
    fn set_number_math() {
        assert_eq!(set_number_for(1, 100), 1);
        assert_eq!(set_number_for(100, 100), 1);
        assert_eq!(set_number_for(101, 100), 101);
        assert_eq!(set_number_for(250, 100), 201);
        assert_eq!(set_number_for(7, 1), 7);
    }

    #[test]
    fn task_keys_order_by_run_then_set() {
        let mut keys = vec![
            TaskKey::new(2, 1),
            TaskKey::new(1, 101),
            TaskKey::new(1, 1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                TaskKey::new(1, 1),
                TaskKey::new(1, 101),
                TaskKey::new(2, 1),
            ]
        );
    }
}
