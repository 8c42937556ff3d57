//! Marker files identifying database directories

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{DatabaseError, DatabaseResult};

pub const NAME_MARKER: &str = "name";
pub const SCHEMA_TYPE_MARKER: &str = "schema_type";

/// Identity of one database directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub id: String,
    pub name: String,
    pub schema_type: String,
    pub path: PathBuf,
}

/// Write markers for a new database. The name goes last so a crash in between
/// leaves a directory that `scan` ignores.
pub fn write_markers(path: &Path, name: &str, schema_type: &str) -> DatabaseResult<()> {
    fs::create_dir_all(path).map_err(|e| DatabaseError::io(path, e))?;
    write_marker(&path.join(SCHEMA_TYPE_MARKER), schema_type)?;
    write_marker(&path.join(NAME_MARKER), name)
}

fn write_marker(path: &Path, value: &str) -> DatabaseResult<()> {
    fs::write(path, value).map_err(|e| DatabaseError::io(path, e))
}

fn read_marker(path: &Path) -> DatabaseResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(value) => Ok(Some(value.trim_end().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DatabaseError::io(path, e)),
    }
}

/// Read the markers of one directory, or `None` if it is incomplete.
pub fn read_markers(path: &Path) -> DatabaseResult<Option<Markers>> {
    let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let (Some(name), Some(schema_type)) = (
        read_marker(&path.join(NAME_MARKER))?,
        read_marker(&path.join(SCHEMA_TYPE_MARKER))?,
    ) else {
        return Ok(None);
    };

    Ok(Some(Markers {
        id: id.to_string(),
        name,
        schema_type,
        path: path.to_path_buf(),
    }))
}

/// Every complete database under `root`, sorted by name. A missing root is empty.
pub fn scan(root: &Path) -> DatabaseResult<Vec<Markers>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DatabaseError::io(root, e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| DatabaseError::io(root, e))?.path();
        if !path.is_dir() {
            continue;
        }
        match read_markers(&path)? {
            Some(markers) => found.push(markers),
            None => warn!(path = %path.display(), "Skipping incomplete database directory"),
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}
