//! On-disk persistence for the process registry.
//!
//! The store owns a single project's `.devrack` directory:
//!
//! ```text
//! .devrack/index.json                  -- ProcessIndex, pretty-printed
//! .devrack/processes/<id>/meta.json    -- ProcessRecord, pretty-printed
//! .devrack/processes/<id>/stdout.log   -- append-only raw bytes
//! .devrack/processes/<id>/stderr.log   -- append-only raw bytes
//! ```
//!
//! Readers locate the directory by walking up from the working directory;
//! only the runner ever creates it. All JSON writes go through a temp file
//! and rename so a concurrent reader never sees a torn record. Whole-index
//! consistency across processes is last-writer-wins.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{RegistryError, Result};
use crate::project::DATA_DIR_NAME;
use crate::record::{ProcessIndex, ProcessRecord};

const INDEX_FILE: &str = "index.json";
const PROCESSES_DIR: &str = "processes";
const META_FILE: &str = "meta.json";

/// Handle to one project's registry data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    data_dir: PathBuf,
}

impl RecordStore {
    /// Locates an existing `.devrack` directory by walking up from `start`.
    ///
    /// Readers must never guess at a location, so this fails with
    /// `NotFound` instead of defaulting anywhere.
    pub fn discover_from(start: &Path) -> Result<Self> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(DATA_DIR_NAME);
            if candidate.is_dir() {
                return Ok(Self {
                    data_dir: candidate,
                });
            }
            if !dir.pop() {
                return Err(RegistryError::NotFound(format!(
                    "data directory ({} not found in any parent of {})",
                    DATA_DIR_NAME,
                    start.display()
                )));
            }
        }
    }

    /// Locates the data directory starting from the current working
    /// directory.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::discover_from(&cwd)
    }

    /// Opens the registry under `project_root`, creating the data
    /// directory if needed. Used by the runner, which establishes the
    /// project; readers use [`RecordStore::discover`] instead.
    pub fn open_or_init(project_root: &Path) -> Result<Self> {
        let data_dir = project_root.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding one record's metadata and log files.
    pub fn process_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(PROCESSES_DIR).join(id)
    }

    pub fn stdout_path(&self, id: &str) -> PathBuf {
        self.process_dir(id).join("stdout.log")
    }

    pub fn stderr_path(&self, id: &str) -> PathBuf {
        self.process_dir(id).join("stderr.log")
    }

    /// Writes the record's detail file and upserts it into the index.
    pub fn put(&self, record: &ProcessRecord) -> Result<()> {
        validate_id(&record.id)?;
        let dir = self.process_dir(&record.id);
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(META_FILE), record)?;

        let mut index = self.load_index()?;
        index.upsert(record.clone());
        self.save_index(&index)
    }

    /// Loads one record's detail file.
    pub fn get(&self, id: &str) -> Result<ProcessRecord> {
        validate_id(id)?;
        let path = self.process_dir(id).join(META_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(format!("process {}", id)));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&data).map_err(|err| RegistryError::corrupt(&path, err))
    }

    /// All records in stored (oldest-insertion-first) order.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.load_index()?.processes)
    }

    /// Loads the index, synthesizing an empty one when the file does not
    /// exist yet.
    pub fn load_index(&self) -> Result<ProcessIndex> {
        let path = self.data_dir.join(INDEX_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProcessIndex::default());
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&data).map_err(|err| RegistryError::corrupt(&path, err))
    }

    pub fn save_index(&self, index: &ProcessIndex) -> Result<()> {
        write_json_atomic(&self.data_dir.join(INDEX_FILE), index)
    }

    /// Removes the record's detail directory and its index entry.
    ///
    /// The id leaves the index even when the directory removal fails, so
    /// a batch clean can keep going; an already-missing directory is not
    /// an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let mut index = self.load_index()?;
        index.remove(id);
        self.save_index(&index)?;

        match fs::remove_dir_all(self.process_dir(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(id, error = %err, "failed to remove process directory");
                Err(err.into())
            }
        }
    }

    /// Returns up to the last `max_lines` lines of a file. A missing file
    /// is empty output, not an error; `max_lines <= 0` means the whole
    /// file. A trailing unterminated line counts as a line.
    pub fn read_tail(path: &Path, max_lines: i64) -> Result<Vec<String>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let mut lines: Vec<String> = data
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();
        if data.last() == Some(&b'\n') {
            lines.pop();
        }
        if max_lines > 0 && lines.len() > max_lines as usize {
            lines.drain(..lines.len() - max_lines as usize);
        }
        Ok(lines)
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
        return Err(RegistryError::InvalidArgument(format!(
            "invalid process id: {:?}",
            id
        )));
    }
    Ok(())
}

// Write to a uniquely-named sibling temp file, then rename over the
// target. Rename is atomic on the same filesystem, so readers see old or
// new, never partial. The temp name must be unique per write: the index
// has concurrent writers in separate OS processes, and a shared temp path
// would let one writer publish another's half-written bytes.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| RegistryError::Protocol(format!("failed to encode {}: {}", path.display(), err)))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.persist(path).map_err(|err| RegistryError::Io(err.error))?;
    Ok(())
}
