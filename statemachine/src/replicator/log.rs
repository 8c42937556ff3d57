//! Durable log and snapshot files for the local replicator
//!
//! ```text
//! <dir>/log.jsonl       {"index":1,"data":"<base64>"} per line, fsynced on append
//! <dir>/snapshot.json   {"last_index":N,"state":"<base64>"} replaced atomically
//! ```
//!
//! A torn final line (crash mid-append) is dropped on read; a bad line anywhere
//! else is corruption.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LogEntry, ReplicatorError, ReplicatorResult};

const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";

/// Serde helper storing byte payloads as standard base64 strings
pub mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Persisted document snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub last_index: u64,
    #[serde(with = "base64_payload")]
    pub state: Vec<u8>,
}

/// Append-only entry log plus the latest snapshot for one database
pub struct LogStore {
    dir: PathBuf,
    log: File,
}

impl LogStore {
    /// Open or create the log under `dir`
    pub fn open(dir: impl Into<PathBuf>) -> ReplicatorResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        repair_tail(&dir.join(LOG_FILE))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        Ok(Self { dir, log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Latest snapshot, if one was ever written
    pub fn read_snapshot(&self) -> ReplicatorResult<Option<SnapshotFile>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        let snapshot = serde_json::from_slice(&raw)
            .map_err(|e| ReplicatorError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }

    /// All entries with `index > after`, in log order
    pub fn read_entries_after(&self, after: u64) -> ReplicatorResult<Vec<LogEntry>> {
        let file = File::open(self.dir.join(LOG_FILE))?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
        let total = lines.len();

        let mut entries = Vec::new();
        let mut previous = after;
        for (n, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) if n + 1 == total => {
                    warn!(line = n + 1, error = %e, "Dropping torn log tail");
                    break;
                }
                Err(e) => {
                    return Err(ReplicatorError::CorruptLog {
                        line: n + 1,
                        reason: e.to_string(),
                    })
                }
            };
            if entry.index <= after {
                continue;
            }
            if entry.index != previous + 1 {
                return Err(ReplicatorError::CorruptLog {
                    line: n + 1,
                    reason: format!("expected index {}, found {}", previous + 1, entry.index),
                });
            }
            previous = entry.index;
            entries.push(entry);
        }

        debug!(dir = %self.dir.display(), after, count = entries.len(), "Read log entries");
        Ok(entries)
    }

    /// Append one entry and flush it to disk
    pub fn append(&mut self, entry: &LogEntry) -> ReplicatorResult<()> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| ReplicatorError::Io(std::io::Error::other(e)))?;
        line.push(b'\n');
        self.log.write_all(&line)?;
        self.log.sync_data()?;
        Ok(())
    }

    /// Persist a snapshot covering every entry up to `last_index`, then
    /// truncate the log those entries lived in.
    pub fn write_snapshot(&mut self, last_index: u64, state: &[u8]) -> ReplicatorResult<()> {
        let snapshot = SnapshotFile {
            last_index,
            state: state.to_vec(),
        };
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| ReplicatorError::Snapshot(e.to_string()))?;

        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        self.log.set_len(0)?;
        self.log.sync_all()?;

        debug!(dir = %self.dir.display(), last_index, "Snapshot written, log truncated");
        Ok(())
    }
}

/// Cut a partially written last line so new appends start on a fresh line.
fn repair_tail(path: &Path) -> ReplicatorResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    warn!(
        path = %path.display(),
        dropped = bytes.len() - keep,
        "Truncating torn log tail"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, data: &[u8]) -> LogEntry {
        LogEntry {
            index,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(1, b"[]")).unwrap();
        store.append(&entry(2, b"[1]")).unwrap();

        let reopened = LogStore::open(dir.path()).unwrap();
        let entries = reopened.read_entries_after(0).unwrap();
        assert_eq!(entries, vec![entry(1, b"[]"), entry(2, b"[1]")]);
        assert_eq!(reopened.read_entries_after(1).unwrap(), vec![entry(2, b"[1]")]);
    }

    #[test]
    fn test_payload_is_base64_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(1, b"[]")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(raw.trim(), r#"{"index":1,"data":"W10="}"#);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(1, b"[]")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap()
            .write_all(b"{\"index\":2,\"da")
            .unwrap();

        let entries = store.read_entries_after(0).unwrap();
        assert_eq!(entries.len(), 1);

        // reopening repairs the tail so the next append starts on its own line
        drop(store);
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(2, b"[]")).unwrap();
        assert_eq!(store.read_entries_after(0).unwrap().len(), 2);
    }

    #[test]
    fn test_index_gap_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(1, b"[]")).unwrap();
        store.append(&entry(3, b"[]")).unwrap();

        assert!(matches!(
            store.read_entries_after(0),
            Err(ReplicatorError::CorruptLog { line: 2, .. })
        ));
    }

    #[test]
    fn test_snapshot_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&entry(1, b"[]")).unwrap();
        store.append(&entry(2, b"[]")).unwrap();
        store.write_snapshot(2, b"{\"entries\":{}}").unwrap();
        store.append(&entry(3, b"[]")).unwrap();

        let snapshot = store.read_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.last_index, 2);
        assert_eq!(snapshot.state, b"{\"entries\":{}}");
        assert_eq!(store.read_entries_after(2).unwrap(), vec![entry(3, b"[]")]);
    }
}
