//! Single-stream rolling CSV writer.
//!
//! Files are named `metrics_{id8}_{YYYY-MM-DD}.csv`; same-day overflow past
//! the size limit continues in `metrics_{id8}_{YYYY-MM-DD}_{n}.csv`. New
//! columns are appended to the header kept in memory only: rows already on
//! disk are not rewritten, so later rows may be wider than the header line.
//! Reopening an existing file starts from its on-disk header.
//!
//! Aged files are compressed to `.csv.zst` by an [`AgedSweep`], taken from
//! the writer with [`RollingWriter::sweep`] and runnable on another thread.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::model::Snapshot;
use crate::storage::error::StorageError;
use crate::storage::tabular::{HARDWARE_ID_COLUMN, TIMESTAMP_COLUMN};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
const FILE_PREFIX: &str = "metrics_";
const ZSTD_LEVEL: i32 = 3;

struct OpenFile {
    path: PathBuf,
    date: NaiveDate,
    index: u32,
    header: Vec<String>,
    writer: csv::Writer<File>,
    size: u64,
}

pub struct RollingWriter {
    dir: PathBuf,
    short_id: String,
    max_file_size: u64,
    current: Option<OpenFile>,
}

/// Compression pass over one rolling directory, detached from the writer.
///
/// Leaves alone the file being written when the sweep was taken and every
/// file the writer could open after it (same date with a higher index, or a
/// later date).
#[derive(Debug, Clone)]
pub struct AgedSweep {
    dir: PathBuf,
    open: Option<(NaiveDate, u32)>,
    after_days: u32,
    today: NaiveDate,
}

/// Result of a compression sweep.
#[derive(Debug, Default, PartialEq)]
pub struct CompressionResult {
    pub files_compressed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Files left uncompressed because of an error.
    pub failures: usize,
}

impl RollingWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        device_id: &str,
        max_file_size: u64,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            short_id: device_id.chars().take(8).collect(),
            max_file_size: max_file_size.max(1),
            current: None,
        })
    }

    fn file_path(&self, date: NaiveDate, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}_{}.csv", FILE_PREFIX, self.short_id, date.format("%Y-%m-%d"))
        } else {
            format!(
                "{}{}_{}_{}.csv",
                FILE_PREFIX,
                self.short_id,
                date.format("%Y-%m-%d"),
                index
            )
        };
        self.dir.join(name)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    /// Opens the first file of `date`, starting at `index`, that is neither
    /// full nor already compressed.
    fn open_file(&self, date: NaiveDate, mut index: u32) -> Result<OpenFile, StorageError> {
        loop {
            let path = self.file_path(date, index);
            let compressed = path.with_extension("csv.zst");
            let size = match fs::metadata(&path) {
                Ok(m) => Some(m.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            if compressed.exists() || size.is_some_and(|s| s >= self.max_file_size) {
                index += 1;
                continue;
            }

            let header = match size {
                Some(s) if s > 0 => {
                    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&path)?;
                    reader.headers()?.iter().map(String::from).collect()
                }
                _ => Vec::new(),
            };
            let handle = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(path = %path.display(), "rolling file opened");
            return Ok(OpenFile {
                path,
                date,
                index,
                header,
                writer: csv::WriterBuilder::new().flexible(true).from_writer(handle),
                size: size.unwrap_or(0),
            });
        }
    }

    /// Writes snapshots in order. Returns the number of rows written.
    pub fn write_batch(&mut self, records: &[Snapshot]) -> Result<usize, StorageError> {
        let mut written = 0;
        for record in records {
            self.write_one(record)?;
            written += 1;
        }
        if let Some(file) = self.current.as_mut() {
            file.writer.flush()?;
        }
        Ok(written)
    }

    fn write_one(&mut self, record: &Snapshot) -> Result<(), StorageError> {
        let date = record.timestamp.date_naive();
        let rollover = match &self.current {
            None => Some(0),
            Some(f) if f.date != date => Some(0),
            Some(f) if f.size >= self.max_file_size => Some(f.index + 1),
            Some(_) => None,
        };
        if let Some(index) = rollover {
            if let Some(mut old) = self.current.take() {
                old.writer.flush()?;
            }
            self.current = Some(self.open_file(date, index)?);
        }
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };

        let fresh = file.header.is_empty();
        if fresh {
            file.header = vec![TIMESTAMP_COLUMN.to_string(), HARDWARE_ID_COLUMN.to_string()];
        }
        let known = file.header.len();
        for key in record.values.keys() {
            if !file.header.contains(key) {
                file.header.push(key.clone());
            }
        }
        if fresh {
            file.writer.write_record(&file.header)?;
        } else if file.header.len() > known {
            debug!(path = %file.path.display(), columns = file.header.len(), "header extended in memory");
        }

        let row = file.header.iter().map(|column| match column.as_str() {
            TIMESTAMP_COLUMN => record.timestamp_string(),
            HARDWARE_ID_COLUMN => record.device_id.clone(),
            other => record.get(other).map(ToString::to_string).unwrap_or_default(),
        });
        file.writer.write_record(row)?;
        file.writer.flush()?;
        file.size = file.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Sweep of the files at least `after_days` older than `today`.
    pub fn sweep(&self, after_days: u32, today: NaiveDate) -> AgedSweep {
        AgedSweep {
            dir: self.dir.clone(),
            open: self.current.as_ref().map(|f| (f.date, f.index)),
            after_days,
            today,
        }
    }

    /// Runs [`sweep`](Self::sweep) on the calling thread.
    pub fn compress_aged(&self, after_days: u32, today: NaiveDate) -> Result<CompressionResult, StorageError> {
        self.sweep(after_days, today).run()
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.current.as_mut() {
            file.writer.flush()?;
        }
        Ok(())
    }
}

impl AgedSweep {
    /// Compresses every eligible file. The original is removed only after
    /// the compressed copy decompresses to identical bytes.
    pub fn run(&self) -> Result<CompressionResult, StorageError> {
        let mut result = CompressionResult::default();

        let mut candidates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(".csv") {
                continue;
            }
            let position = parse_position(name);
            if let (Some(open), Some(position)) = (self.open, position)
                && position >= open
            {
                continue;
            }
            let date = position.map(|(date, _)| date).or_else(|| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some(chrono::DateTime::<Utc>::from(modified).date_naive())
            });
            if let Some(date) = date
                && (self.today - date).num_days() >= self.after_days as i64
            {
                candidates.push(path);
            }
        }
        candidates.sort();

        for path in candidates {
            match compress_file(&path) {
                Ok((before, after)) => {
                    result.files_compressed += 1;
                    result.bytes_before += before;
                    result.bytes_after += after;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "compression failed, original kept");
                    result.failures += 1;
                }
            }
        }
        if result.files_compressed > 0 {
            info!(
                files = result.files_compressed,
                before = result.bytes_before,
                after = result.bytes_after,
                "compressed aged files"
            );
        }
        Ok(result)
    }
}

/// Compresses `path` to `path.zst` and removes `path` once verified.
/// Returns the sizes before and after.
fn compress_file(path: &Path) -> Result<(u64, u64), StorageError> {
    let data = fs::read(path)?;
    let compressed = zstd::encode_all(&data[..], ZSTD_LEVEL)?;

    let target = path.with_extension("csv.zst");
    let tmp = path.with_extension("csv.zst.tmp");
    fs::write(&tmp, &compressed)?;
    fs::rename(&tmp, &target)?;

    let verify = fs::read(&target).and_then(|bytes| zstd::decode_all(&bytes[..]));
    match verify {
        Ok(restored) if xxh3_64(&restored) == xxh3_64(&data) && restored.len() == data.len() => {
            fs::remove_file(path)?;
            Ok((data.len() as u64, compressed.len() as u64))
        }
        Ok(_) => {
            let _ = fs::remove_file(&target);
            Err(StorageError::Verify(format!("{} does not match", target.display())))
        }
        Err(e) => {
            let _ = fs::remove_file(&target);
            Err(e.into())
        }
    }
}

/// Parses date and overflow index out of `metrics_{id}_{YYYY-MM-DD}[_n].csv`.
fn parse_position(filename: &str) -> Option<(NaiveDate, u32)> {
    let stem = filename.strip_prefix(FILE_PREFIX)?.strip_suffix(".csv")?;
    let mut parts = stem.split('_');
    let _id = parts.next()?;
    let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let index = match parts.next() {
        Some(n) => n.parse().ok()?,
        None => 0,
    };
    Some((date, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn snap(day: u32, sec: u32, fields: &[(&str, f64)]) -> Snapshot {
        let ts = Utc.with_ymd_and_hms(2024, 5, day, 10, 0, sec).unwrap();
        let mut s = Snapshot::new("0123456789abcdef", ts);
        for (k, v) in fields {
            s.insert(*k, *v);
        }
        s
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    #[test]
    fn test_header_written_once_and_extended_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
        let n = writer
            .write_batch(&[snap(1, 0, &[("a", 1.0)]), snap(1, 1, &[("a", 2.0), ("b", 3.0)])])
            .unwrap();
        assert_eq!(n, 2);

        let path = dir.path().join("metrics_01234567_2024-05-01.csv");
        assert_eq!(writer.current_path(), Some(path.as_path()));
        let lines = lines(&path);
        assert_eq!(lines[0], "timestamp,hardware_id,a");
        assert_eq!(lines[1], "2024-05-01T10:00:00.000000Z,0123456789abcdef,1");
        assert_eq!(lines[2], "2024-05-01T10:00:01.000000Z,0123456789abcdef,2,3");
    }

    #[test]
    fn test_date_rollover_and_size_overflow() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", 100).unwrap();
        writer.write_batch(&[snap(1, 0, &[("a", 1.0)])]).unwrap();
        writer.write_batch(&[snap(1, 1, &[("a", 1.0)])]).unwrap();
        writer.write_batch(&[snap(1, 2, &[("a", 1.0)])]).unwrap();
        writer.write_batch(&[snap(2, 0, &[("a", 1.0)])]).unwrap();

        let day1 = dir.path().join("metrics_01234567_2024-05-01.csv");
        let overflow = dir.path().join("metrics_01234567_2024-05-01_1.csv");
        let day2 = dir.path().join("metrics_01234567_2024-05-02.csv");
        assert!(day1.exists() && overflow.exists() && day2.exists());
        assert_eq!(lines(&overflow)[0], "timestamp,hardware_id,a");
    }

    #[test]
    fn test_reopen_reuses_on_disk_header() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
            writer.write_batch(&[snap(1, 0, &[("a", 1.0)])]).unwrap();
        }
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
        writer.write_batch(&[snap(1, 5, &[("a", 7.0)])]).unwrap();

        let lines = lines(&dir.path().join("metrics_01234567_2024-05-01.csv"));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|l| l.starts_with("timestamp")).count(), 1);
    }

    #[test]
    fn test_compress_aged_skips_current_and_recent() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
        writer.write_batch(&[snap(1, 0, &[("a", 1.0)])]).unwrap();
        writer.write_batch(&[snap(3, 0, &[("a", 2.0)])]).unwrap();
        writer.write_batch(&[snap(5, 0, &[("a", 3.0)])]).unwrap();

        let old = dir.path().join("metrics_01234567_2024-05-01.csv");
        let original = fs::read(&old).unwrap();

        let result = writer.compress_aged(3, date(5)).unwrap();
        assert_eq!(result.files_compressed, 1);
        assert_eq!(result.failures, 0);
        assert!(!old.exists());
        let zst = dir.path().join("metrics_01234567_2024-05-01.csv.zst");
        let restored = zstd::decode_all(&fs::read(zst).unwrap()[..]).unwrap();
        assert_eq!(restored, original);

        // May 3rd is two days old; May 5th is open
        assert!(dir.path().join("metrics_01234567_2024-05-03.csv").exists());
        let result = writer.compress_aged(0, date(5)).unwrap();
        assert_eq!(result.files_compressed, 1);
        assert!(dir.path().join("metrics_01234567_2024-05-05.csv").exists());
    }

    #[test]
    fn test_compressed_day_is_not_reopened() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
            writer.write_batch(&[snap(1, 0, &[("a", 1.0)])]).unwrap();
            writer.write_batch(&[snap(2, 0, &[("a", 1.0)])]).unwrap();
            writer.compress_aged(1, date(2)).unwrap();
        }
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
        writer.write_batch(&[snap(1, 30, &[("a", 1.0)])]).unwrap();
        assert!(dir.path().join("metrics_01234567_2024-05-01_1.csv").exists());
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(
            parse_position("metrics_01234567_2024-05-01.csv"),
            Some((date(1), 0))
        );
        assert_eq!(
            parse_position("metrics_01234567_2024-05-01_3.csv"),
            Some((date(1), 3))
        );
        assert_eq!(parse_position("metrics_x.csv"), None);
        assert_eq!(parse_position("cpu.csv"), None);
    }

    #[test]
    fn test_detached_sweep_leaves_files_after_open_position() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingWriter::new(dir.path(), "0123456789abcdef", DEFAULT_MAX_FILE_SIZE).unwrap();
        writer.write_batch(&[snap(1, 0, &[("a", 1.0)])]).unwrap();
        writer.write_batch(&[snap(2, 0, &[("a", 2.0)])]).unwrap();
        let sweep = writer.sweep(0, date(3));

        // The writer moves on before the sweep runs elsewhere
        writer.write_batch(&[snap(3, 0, &[("a", 3.0)])]).unwrap();
        let result = std::thread::spawn(move || sweep.run()).join().unwrap().unwrap();

        assert_eq!(result.files_compressed, 1);
        assert!(dir.path().join("metrics_01234567_2024-05-01.csv.zst").exists());
        assert!(dir.path().join("metrics_01234567_2024-05-02.csv").exists());
        assert!(dir.path().join("metrics_01234567_2024-05-03.csv").exists());
    }
}
