//! Categorized tabular store: one append-only CSV file per hardware type.
//!
//! Columns only ever grow. When a batch brings a column the file has never
//! seen, the whole file is rewritten under the wider header through a `.tmp`
//! file and an atomic rename; older rows get empty cells. If that rewrite
//! fails the batch is written under the old header and the unknown columns
//! are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::model::{HardwareType, Snapshot, Value};
use crate::storage::categorize::split;
use crate::storage::error::StorageError;
use crate::storage::sync_state::SyncStateTracker;

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const HARDWARE_ID_COLUMN: &str = "hardware_id";

type Row<'a> = (&'a Snapshot, BTreeMap<String, Value>);

struct TypeFile {
    path: PathBuf,
    /// Empty until the header line has been written.
    header: Vec<String>,
    writer: csv::Writer<File>,
}

pub struct CategorizedStore {
    dir: PathBuf,
    device_id: String,
    tracker: Arc<SyncStateTracker>,
    files: Mutex<BTreeMap<HardwareType, TypeFile>>,
}

impl CategorizedStore {
    /// Opens the store in `dir` and reports the row count of every existing
    /// file to `tracker`.
    pub fn open(
        dir: impl Into<PathBuf>,
        device_id: impl Into<String>,
        tracker: Arc<SyncStateTracker>,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        // Leftovers of an interrupted header rewrite
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                let _ = fs::remove_file(&path);
            }
        }

        let store = Self {
            dir,
            device_id: device_id.into(),
            tracker,
            files: Mutex::new(BTreeMap::new()),
        };
        for t in HardwareType::ALL {
            let path = store.path(t);
            let result = if path.exists() {
                truncate_partial_row(&path).and_then(|()| store.recount(t))
            } else {
                store.forget_missing(t, &path)
            };
            if let Err(e) = result {
                warn!(hardware_type = %t, error = %e, "cannot count existing rows");
            }
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, hardware_type: HardwareType) -> PathBuf {
        self.dir.join(hardware_type.file_name())
    }

    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<HardwareType, TypeFile>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current header of a type's file, as written on disk.
    pub fn header(&self, hardware_type: HardwareType) -> Option<Vec<String>> {
        if let Some(file) = self.lock().get(&hardware_type) {
            return Some(file.header.clone());
        }
        read_header(&self.path(hardware_type)).ok()
    }

    /// Writes one snapshot. Returns rows written per type.
    pub fn write(&self, snapshot: &Snapshot) -> BTreeMap<HardwareType, u64> {
        self.write_batch(std::slice::from_ref(snapshot))
    }

    /// Writes a batch of snapshots, one row per snapshot per matching type.
    ///
    /// A failing type is logged and left out of the result; the other types
    /// are written regardless.
    pub fn write_batch(&self, snapshots: &[Snapshot]) -> BTreeMap<HardwareType, u64> {
        let mut grouped: BTreeMap<HardwareType, Vec<Row<'_>>> = BTreeMap::new();
        for snapshot in snapshots {
            for (t, fields) in split(snapshot) {
                grouped.entry(t).or_default().push((snapshot, fields));
            }
        }

        let mut files = self.lock();
        let mut written = BTreeMap::new();
        for (t, rows) in grouped {
            match self.append_rows(&mut files, t, &rows) {
                Ok(n) => {
                    written.insert(t, n);
                }
                Err(e) => {
                    warn!(hardware_type = %t, rows = rows.len(), error = %e, "write failed, rows skipped");
                    // Drop the handle; the next write reopens and the row
                    // count is taken from what actually reached the disk.
                    files.remove(&t);
                    if let Err(e) = self.recount(t) {
                        debug!(hardware_type = %t, error = %e, "recount failed");
                    }
                }
            }
        }
        written
    }

    fn open_type(&self, hardware_type: HardwareType) -> Result<TypeFile, StorageError> {
        let path = self.path(hardware_type);
        let header = if path.exists() {
            truncate_partial_row(&path)?;
            read_header(&path)?
        } else {
            self.forget_missing(hardware_type, &path)?;
            Vec::new()
        };
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(TypeFile {
            path,
            header,
            writer: csv::Writer::from_writer(handle),
        })
    }

    fn append_rows(
        &self,
        files: &mut BTreeMap<HardwareType, TypeFile>,
        hardware_type: HardwareType,
        rows: &[Row<'_>],
    ) -> Result<u64, StorageError> {
        if !files.contains_key(&hardware_type) {
            let opened = self.open_type(hardware_type)?;
            files.insert(hardware_type, opened);
        }
        let Some(file) = files.get_mut(&hardware_type) else {
            return Ok(0);
        };

        let unseen: BTreeSet<&String> = rows
            .iter()
            .flat_map(|(_, fields)| fields.keys())
            .filter(|k| !file.header.contains(k))
            .collect();

        if file.header.is_empty() {
            let mut header = vec![TIMESTAMP_COLUMN.to_string(), HARDWARE_ID_COLUMN.to_string()];
            header.extend(unseen.into_iter().cloned());
            file.writer.write_record(&header)?;
            file.header = header;
            info!(hardware_type = %hardware_type, columns = file.header.len(), "created tabular file");
        } else if !unseen.is_empty() {
            let mut header = file.header.clone();
            header.extend(unseen.into_iter().cloned());
            match rewrite_header(&file.path, &header) {
                Ok(()) => {
                    info!(hardware_type = %hardware_type, columns = header.len(), "header extended");
                }
                Err(e) => {
                    warn!(
                        hardware_type = %hardware_type,
                        error = %e,
                        "header rewrite failed, new columns dropped for this write"
                    );
                }
            }
            // Whatever happened, continue from what is on disk
            *file = self.open_type(hardware_type)?;
        }

        for (snapshot, fields) in rows {
            let record = file.header.iter().map(|column| match column.as_str() {
                TIMESTAMP_COLUMN => snapshot.timestamp_string(),
                HARDWARE_ID_COLUMN if snapshot.device_id.is_empty() => self.device_id.clone(),
                HARDWARE_ID_COLUMN => snapshot.device_id.clone(),
                other => fields.get(other).map(ToString::to_string).unwrap_or_default(),
            });
            file.writer.write_record(record)?;
        }
        file.writer.flush()?;
        file.writer.get_ref().sync_data()?;

        let n = rows.len() as u64;
        if let Err(e) = self.tracker.record_rows(hardware_type, &file.path, n) {
            warn!(hardware_type = %hardware_type, error = %e, "cannot persist row count");
        }
        Ok(n)
    }

    /// Re-reads a file's row count into the tracker.
    fn recount(&self, hardware_type: HardwareType) -> Result<(), StorageError> {
        let path = self.path(hardware_type);
        let rows = count_rows(&path)?;
        self.tracker.observe_total_rows(hardware_type, &path, rows)
    }

    /// A tracked file that is gone from disk starts over at zero rows, so
    /// rows written to its replacement are counted from the first line.
    fn forget_missing(&self, hardware_type: HardwareType, path: &Path) -> Result<(), StorageError> {
        match self.tracker.cursor(hardware_type) {
            Some(cursor) if cursor.total_rows > 0 || cursor.last_row_uploaded > 0 => {
                info!(
                    hardware_type = %hardware_type,
                    rows = cursor.total_rows,
                    "tracked file missing, counting from zero"
                );
                self.tracker.observe_total_rows(hardware_type, path, 0)
            }
            _ => Ok(()),
        }
    }

    /// Flushes every open file.
    pub fn flush(&self) -> Result<(), StorageError> {
        for file in self.lock().values_mut() {
            file.writer.flush()?;
        }
        Ok(())
    }
}

fn read_header(path: &Path) -> Result<Vec<String>, StorageError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    Ok(reader.headers()?.iter().map(String::from).collect())
}

/// Data rows in a file, header excluded.
pub fn count_rows(path: &Path) -> Result<u64, StorageError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut rows = 0;
    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        rows += 1;
    }
    Ok(rows)
}

/// Rewrites `path` under `header`, mapping existing cells by column name.
fn rewrite_header(path: &Path, header: &[String]) -> Result<(), StorageError> {
    let tmp = path.with_extension("csv.tmp");
    let result = (|| -> Result<(), StorageError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let old_header = reader.headers()?.clone();
        let positions: Vec<Option<usize>> = header
            .iter()
            .map(|column| old_header.iter().position(|h| h == column))
            .collect();

        let mut out = csv::Writer::from_path(&tmp)?;
        out.write_record(header)?;
        for record in reader.records() {
            let record = record?;
            out.write_record(
                positions
                    .iter()
                    .map(|pos| pos.and_then(|i| record.get(i)).unwrap_or("")),
            )?;
        }
        out.flush()?;
        out.get_ref().sync_data()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Cuts a row torn by a crash mid-write so the next append starts on a
/// fresh line.
fn truncate_partial_row(path: &Path) -> Result<(), StorageError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = [0u8; 4096];
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + i as u64 + 1;
            if keep < len {
                warn!(path = %path.display(), bytes = len - keep, "truncating partial row");
                file.set_len(keep)?;
            }
            return Ok(());
        }
        end = start;
    }
    if len > 0 {
        warn!(path = %path.display(), "no complete line, truncating file");
        file.set_len(0)?;
    }
    Ok(())
}
