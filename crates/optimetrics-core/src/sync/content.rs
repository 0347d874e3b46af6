//! CSV content handling for uploads: reading a row range from a local file,
//! and appending rows to the content already stored remotely.

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::storage::StorageError;

/// Header and data rows `[start, end)` of a local categorized file.
///
/// Returns fewer rows than requested when the file is shorter.
pub fn read_range(
    path: &Path,
    start: u64,
    end: u64,
) -> Result<(StringRecord, Vec<StringRecord>), StorageError> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_reader(File::open(path)?);
    let header = reader.headers()?.clone();
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let i = i as u64;
        if i >= end {
            break;
        }
        let record = record?;
        if i >= start {
            rows.push(record);
        }
    }
    Ok((header, rows))
}

/// Content for a file that does not exist remotely yet.
pub fn render_new(header: &StringRecord, rows: &[StringRecord]) -> Result<Vec<u8>, StorageError> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&project(row, header, header))?;
    }
    into_bytes(writer)
}

/// Appends `rows` (laid out by `header`) to existing remote content.
///
/// When the remote header already covers every local column the remote
/// bytes are kept as they are and the rows are projected onto it. Otherwise
/// the remote header is widened with the missing columns, sorted after the
/// existing ones, and the old remote rows are padded with empty cells.
pub fn append(
    remote: &[u8],
    header: &StringRecord,
    rows: &[StringRecord],
) -> Result<Vec<u8>, StorageError> {
    if remote.iter().all(|b| b.is_ascii_whitespace()) {
        return render_new(header, rows);
    }

    let mut reader = ReaderBuilder::new().flexible(true).from_reader(remote);
    let remote_header = reader.headers()?.clone();

    let mut added: Vec<&str> = header
        .iter()
        .filter(|c| !remote_header.iter().any(|r| r == *c))
        .collect();

    if added.is_empty() {
        let mut out = remote.to_vec();
        while out.last() == Some(&b'\n') || out.last() == Some(&b'\r') {
            out.pop();
        }
        out.push(b'\n');
        let mut writer = WriterBuilder::new().flexible(true).from_writer(out);
        for row in rows {
            writer.write_record(&project(row, header, &remote_header))?;
        }
        return into_bytes(writer);
    }

    added.sort_unstable();
    let mut merged = remote_header.clone();
    for column in added {
        merged.push_field(column);
    }

    let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer.write_record(&merged)?;
    for record in reader.records() {
        writer.write_record(&project(&record?, &remote_header, &merged))?;
    }
    for row in rows {
        writer.write_record(&project(row, header, &merged))?;
    }
    into_bytes(writer)
}

/// Reorders `row`, laid out by `from`, into the columns of `to`. Cells for
/// columns absent from `from` are empty.
fn project(row: &StringRecord, from: &StringRecord, to: &StringRecord) -> StringRecord {
    to.iter()
        .map(|column| {
            from.iter()
                .position(|c| c == column)
                .and_then(|i| row.get(i))
                .unwrap_or("")
        })
        .collect()
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, StorageError> {
    writer
        .into_inner()
        .map_err(|e| StorageError::Io(e.into_error()))
}
