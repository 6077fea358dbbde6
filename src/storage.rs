//! Storage layer for taskvault
//!
//! All durable state lives in one project-local directory:
//!
//! ```text
//! <project>/.gemini-tasks/
//!   tasks/<taskId>.json                     # one document per task (tombstones included)
//!   sessions/session-<sessionId>.json       # session bookkeeping
//!   checkpoints/checkpoint-<checkpointId>.json
//!   agents/                                 # reserved for agent state
//!   metadata/
//!     persistence-metadata.json             # schema version, created/updated times
//!     transactions.jsonl                    # append-only transaction log
//!     conflicts.jsonl                       # flagged save conflicts
//! ```
//!
//! Writes are atomic (temp file + rename). Locking is the caller's concern;
//! see [`crate::lock::LockProvider`].

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock;

/// Name of the project-local state directory
pub const STATE_DIR: &str = ".gemini-tasks";

/// Schema version written to the metadata file
pub const SCHEMA_VERSION: u32 = 1;

const SESSION_PREFIX: &str = "session-";
const CHECKPOINT_PREFIX: &str = "checkpoint-";
const JSON_SUFFIX: &str = ".json";

/// Contents of `metadata/persistence-metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Storage manager for the `.gemini-tasks/` tree
#[derive(Debug, Clone)]
pub struct Storage {
    project_root: PathBuf,
    root: PathBuf,
}

impl Storage {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let root = project_root.join(STATE_DIR);
        Self { project_root, root }
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn task_file(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}{JSON_SUFFIX}"))
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{SESSION_PREFIX}{session_id}{JSON_SUFFIX}"))
    }

    pub fn checkpoint_file(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("{CHECKPOINT_PREFIX}{checkpoint_id}{JSON_SUFFIX}"))
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.metadata_dir().join("persistence-metadata.json")
    }

    pub fn transactions_file(&self) -> PathBuf {
        self.metadata_dir().join("transactions.jsonl")
    }

    pub fn conflicts_file(&self) -> PathBuf {
        self.metadata_dir().join("conflicts.jsonl")
    }

    // =========================================================================
    // Directory initialization
    // =========================================================================

    /// Create the directory tree and metadata file if absent.
    pub fn init(&self, now: DateTime<Utc>) -> Result<PersistenceMetadata> {
        fs::create_dir_all(self.tasks_dir())?;
        fs::create_dir_all(self.sessions_dir())?;
        fs::create_dir_all(self.checkpoints_dir())?;
        fs::create_dir_all(self.agents_dir())?;
        fs::create_dir_all(self.metadata_dir())?;

        let path = self.metadata_file();
        match self.read_json_opt::<PersistenceMetadata>(&path)? {
            Some(existing) => Ok(existing),
            None => {
                let metadata = PersistenceMetadata {
                    version: SCHEMA_VERSION,
                    created_at: now,
                    last_updated: now,
                };
                self.write_json(&path, &metadata)?;
                Ok(metadata)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.metadata_file().exists()
    }

    pub fn read_metadata(&self) -> Result<Option<PersistenceMetadata>> {
        self.read_json_opt(&self.metadata_file())
    }

    /// Refresh `lastUpdated` in the metadata file.
    pub fn touch_metadata(&self, now: DateTime<Utc>) -> Result<()> {
        let path = self.metadata_file();
        let mut metadata = self
            .read_json_opt::<PersistenceMetadata>(&path)?
            .unwrap_or(PersistenceMetadata {
                version: SCHEMA_VERSION,
                created_at: now,
                last_updated: now,
            });
        metadata.last_updated = now;
        self.write_json(&path, &metadata)
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Ids of all task documents, sorted.
    pub fn list_task_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.tasks_dir(), "")
    }

    /// Ids of all recorded sessions, sorted.
    pub fn list_session_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.sessions_dir(), SESSION_PREFIX)
    }

    /// Ids of all checkpoint files, sorted.
    pub fn list_checkpoint_ids(&self) -> Result<Vec<String>> {
        list_ids(&self.checkpoints_dir(), CHECKPOINT_PREFIX)
    }

    // =========================================================================
    // File I/O helpers
    // =========================================================================

    /// Write JSON atomically (temp file, then rename)
    pub fn write_json<T: Serialize + ?Sized>(&self, path: &Path, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        lock::write_atomic(path, json.as_bytes())
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Like [`Storage::read_json`], but a missing file is `None`.
    pub fn read_json_opt<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Append one record to a JSONL file. Not atomic; hold a lock when shared.
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(record)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        writeln!(file, "{json}")?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a JSONL file, skipping lines that fail to parse.
    ///
    /// Returns the parsed records and the number of lines skipped. A torn
    /// final line from a crash mid-append is the usual reason to skip.
    pub fn read_jsonl_lenient<T: DeserializeOwned>(&self, path: &Path) -> Result<(Vec<T>, usize)> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        let mut skipped = 0;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping malformed jsonl line");
                    skipped += 1;
                }
            }
        }
        Ok((records, skipped))
    }

    /// Remove a file; a missing file is not an error.
    pub fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reject ids that cannot safely name a file in the state tree.
pub fn validate_entity_id(entity: &'static str, id: &str) -> Result<()> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{entity} id cannot be empty")));
    }
    if trimmed != id
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.chars().any(char::is_control)
    {
        return Err(Error::Validation(format!("invalid {entity} id '{id}'")));
    }
    Ok(())
}

fn list_ids(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let id = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(JSON_SUFFIX));
        if let Some(id) = id {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
