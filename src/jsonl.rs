// JSONL file operations

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A JSONL line that supersedes earlier lines with the same key
pub trait Versioned {
    fn key(&self) -> &str;

    /// Milliseconds since epoch; later lines win ties
    fn updated_at(&self) -> i64;
}

/// Sidecar lock file guarding `path`. Compaction replaces the log itself,
/// so the lock has to live on a file that is never renamed.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Take the exclusive lock for `path`; released when the returned file is dropped
pub fn lock_jsonl(path: &Path) -> Result<File> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))
        .context("Failed to open JSONL lock file")?;
    lock.lock_exclusive().context("Failed to acquire file lock")?;
    Ok(lock)
}

/// Append a record to a JSONL file under an exclusive lock
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let _lock = lock_jsonl(path)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open JSONL file for appending")?;

    let json = serde_json::to_string(record)?;
    writeln!(file, "{}", json)?;
    file.sync_all()?; // Ensure data is flushed to disk

    // Lock is automatically released when dropped
    Ok(())
}

/// Read all records from a JSONL file, returning the latest version per key
///
/// Malformed lines are skipped with a warning.
pub fn read_jsonl_latest<T>(path: &Path) -> Result<HashMap<String, T>>
where
    T: DeserializeOwned + Versioned,
{
    if !path.exists() {
        // File doesn't exist yet, return empty map
        return Ok(HashMap::new());
    }

    let file = File::open(path).context("Failed to open JSONL file")?;
    let reader = BufReader::new(file);
    let mut records: HashMap<String, T> = HashMap::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to read line, skipping"
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let record: T = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to parse JSON, skipping"
                );
                continue;
            }
        };

        let supersedes = match records.get(record.key()) {
            Some(existing) => record.updated_at() >= existing.updated_at(),
            None => true,
        };
        if supersedes {
            records.insert(record.key().to_string(), record);
        }
    }

    info!(
        file = ?path,
        count = records.len(),
        "Loaded latest records from JSONL"
    );

    Ok(records)
}

/// Rewrite the file with only the latest line per key that `keep` accepts.
///
/// The lock is held from the read until the new file is in place, so an
/// append from another process either lands before the read or after the rename.
/// Returns the kept records sorted by key.
pub fn compact_jsonl<T, F>(path: &Path, keep: F) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned + Versioned,
    F: Fn(&T) -> bool,
{
    let _lock = lock_jsonl(path)?;

    let mut live: Vec<T> = read_jsonl_latest::<T>(path)?
        .into_values()
        .filter(|r| keep(r))
        .collect();
    live.sort_by(|a, b| a.key().cmp(b.key()));
    rewrite_jsonl(path, &live)?;

    Ok(live)
}

/// Replace the file with exactly `records`, one per line. Caller holds the lock.
fn rewrite_jsonl<'a, T, I>(path: &Path, records: I) -> Result<()>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let file = File::create(&tmp_path).context("Failed to create temporary JSONL file")?;
        let mut writer = BufWriter::new(&file);
        for record in records {
            let json = serde_json::to_string(record)?;
            writeln!(writer, "{}", json)?;
        }
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path).context("Failed to replace JSONL file")?;
    Ok(())
}
