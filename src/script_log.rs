//! Boot scripts and their execution history.
//!
//! A boot script is submitted alongside a create or rebuild and executed on
//! the new instance by the control plane. The execution history is an
//! ordered collection of records correlated by id; storage belongs to a
//! collaborator behind [`LogStore`], this module only appends, updates by
//! id, and reads with transparent base64 decoding of the output payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TIMESTAMP_FORMAT;

/// File the JSON store keeps inside the script directory.
pub const LOG_FILE_NAME: &str = "boot_script_log.json";

/// Lifecycle operation a script execution was attached to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOperation {
    /// The script ran during an instance deployment.
    Create,
    /// The script ran during an instance rebuild.
    Rebuild,
}

/// Execution status of a submitted script.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    /// Submitted, result not yet reported.
    Pending,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// One record of the script execution history.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Correlation id (the control plane's command uid when available).
    pub id: String,
    /// Instance the script ran on.
    pub instance_id: String,
    /// Local submission time.
    pub date_time: String,
    /// Operation the execution was attached to.
    pub operation: ScriptOperation,
    /// File name of the submitted script.
    pub script_name: String,
    /// Current execution status.
    pub status: ScriptStatus,
    /// Captured output; may be stored base64-encoded and is decoded
    /// transparently on read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl LogEntry {
    /// Builds a pending record stamped with the current local time.
    #[must_use]
    pub fn pending(
        instance_id: impl Into<String>,
        operation: ScriptOperation,
        script_name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            date_time: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            operation,
            script_name: script_name.into(),
            status: ScriptStatus::Pending,
            output: None,
        }
    }
}

/// Errors raised by the script library and execution history.
#[derive(Debug, Error)]
pub enum ScriptLogError {
    /// Raised when the script directory or log file cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the stored history cannot be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when an update names an id with no matching record.
    #[error("no log entry with id {id}")]
    UnknownEntry {
        /// Id that was not found.
        id: String,
    },
}

/// Storage collaborator for the execution history.
///
/// The storage format beyond the record shape is the collaborator's
/// business; the core reads and writes whole collections.
pub trait LogStore {
    /// Reads the full collection, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError`] when the backing storage cannot be read.
    fn read(&self) -> Result<Vec<LogEntry>, ScriptLogError>;

    /// Replaces the full collection.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError`] when the backing storage cannot be
    /// written.
    fn write(&self, entries: &[LogEntry]) -> Result<(), ScriptLogError>;
}

/// JSON-file store rooted in a capability-scoped directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: Dir,
    dir_path: Utf8PathBuf,
}

impl JsonFileStore {
    /// Opens the store inside the given script directory.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError::Io`] when the directory cannot be opened.
    pub fn open(path: &Utf8Path) -> Result<Self, ScriptLogError> {
        let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| {
            ScriptLogError::Io {
                path: path.to_owned(),
                message: err.to_string(),
            }
        })?;
        Ok(Self {
            dir,
            dir_path: path.to_owned(),
        })
    }

    fn log_path(&self) -> Utf8PathBuf {
        self.dir_path.join(LOG_FILE_NAME)
    }
}

impl LogStore for JsonFileStore {
    fn read(&self) -> Result<Vec<LogEntry>, ScriptLogError> {
        match self.dir.read_to_string(LOG_FILE_NAME) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|err| ScriptLogError::Parse {
                    path: self.log_path(),
                    message: err.to_string(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(ScriptLogError::Io {
                path: self.log_path(),
                message: err.to_string(),
            }),
        }
    }

    fn write(&self, entries: &[LogEntry]) -> Result<(), ScriptLogError> {
        let content =
            serde_json::to_string_pretty(entries).map_err(|err| ScriptLogError::Parse {
                path: self.log_path(),
                message: err.to_string(),
            })?;
        self.dir
            .write(LOG_FILE_NAME, content)
            .map_err(|err| ScriptLogError::Io {
                path: self.log_path(),
                message: err.to_string(),
            })
    }
}

/// Append/update/read facade over a [`LogStore`].
#[derive(Debug)]
pub struct ScriptLog<S: LogStore> {
    store: S,
}

impl<S: LogStore> ScriptLog<S> {
    /// Wraps a storage collaborator.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Prepends a new record to the history.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError`] when the history cannot be read or
    /// written.
    pub fn append(&self, entry: LogEntry) -> Result<(), ScriptLogError> {
        let mut entries = self.store.read()?;
        entries.insert(0, entry);
        self.store.write(&entries)
    }

    /// Updates the status (and optionally the output) of the record with the
    /// given id.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError::UnknownEntry`] when no record matches, and
    /// [`ScriptLogError`] when the history cannot be read or written.
    pub fn update(
        &self,
        id: &str,
        status: ScriptStatus,
        output: Option<String>,
    ) -> Result<(), ScriptLogError> {
        let mut entries = self.store.read()?;
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| ScriptLogError::UnknownEntry { id: id.to_owned() })?;
        entry.status = status;
        entry.output = output;
        self.store.write(&entries)
    }

    /// Records for one instance, newest first, with output payloads decoded.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError`] when the history cannot be read.
    pub fn entries_for_instance(&self, instance_id: &str) -> Result<Vec<LogEntry>, ScriptLogError> {
        Ok(self
            .store
            .read()?
            .into_iter()
            .filter(|entry| entry.instance_id == instance_id)
            .map(|mut entry| {
                if let Some(decoded) = entry.output.as_deref().and_then(decode_if_base64) {
                    entry.output = Some(decoded);
                }
                entry
            })
            .collect())
    }
}

/// Decodes `raw` when it is a plausible base64 payload that round-trips to
/// UTF-8; otherwise returns `None` and the caller keeps the original.
#[must_use]
pub fn decode_if_base64(raw: &str) -> Option<String> {
    let stripped: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
    if stripped.is_empty() || stripped.len() % 4 != 0 {
        return None;
    }
    let bytes = BASE64.decode(stripped.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Descriptor of one script file in the library.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptInfo {
    /// File name of the script.
    pub name: String,
    /// Description pulled from the script's second-line `#` comment.
    pub description: Option<String>,
}

/// Boot script ready for submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootScript {
    /// File name of the script.
    pub name: String,
    /// Raw script content; the gateway base64-encodes it on submission.
    pub content: String,
}

/// Read-only view of the operator's boot-script directory.
#[derive(Debug)]
pub struct ScriptLibrary {
    dir: Dir,
    dir_path: Utf8PathBuf,
}

impl ScriptLibrary {
    /// Opens the library at the given directory.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError::Io`] when the directory cannot be opened.
    pub fn open(path: &Utf8Path) -> Result<Self, ScriptLogError> {
        let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| {
            ScriptLogError::Io {
                path: path.to_owned(),
                message: err.to_string(),
            }
        })?;
        Ok(Self {
            dir,
            dir_path: path.to_owned(),
        })
    }

    /// Lists the scripts in the library, skipping the history's own JSON
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError::Io`] when the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ScriptInfo>, ScriptLogError> {
        let entries = self.dir.entries().map_err(|err| ScriptLogError::Io {
            path: self.dir_path.clone(),
            message: err.to_string(),
        })?;

        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ScriptLogError::Io {
                path: self.dir_path.clone(),
                message: err.to_string(),
            })?;
            let Ok(name) = entry.file_name() else {
                continue;
            };
            if name.ends_with(".json") {
                continue;
            }
            let description = self
                .dir
                .read_to_string(&name)
                .ok()
                .and_then(|content| second_line_comment(&content));
            scripts.push(ScriptInfo { name, description });
        }
        scripts.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(scripts)
    }

    /// Loads a script's content for submission.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptLogError::Io`] when the file cannot be read.
    pub fn load(&self, name: &str) -> Result<BootScript, ScriptLogError> {
        let content = self
            .dir
            .read_to_string(name)
            .map_err(|err| ScriptLogError::Io {
                path: self.dir_path.join(name),
                message: err.to_string(),
            })?;
        Ok(BootScript {
            name: name.to_owned(),
            content,
        })
    }
}

/// Extracts the description comment conventionally placed on a script's
/// second line.
fn second_line_comment(content: &str) -> Option<String> {
    let line = content.lines().nth(1)?.trim();
    let comment = line.strip_prefix('#')?.trim();
    if comment.is_empty() {
        None
    } else {
        Some(comment.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    /// In-memory store used to exercise the facade without a filesystem.
    #[derive(Debug, Default)]
    struct MemoryStore {
        entries: Mutex<Vec<LogEntry>>,
    }

    impl LogStore for MemoryStore {
        fn read(&self) -> Result<Vec<LogEntry>, ScriptLogError> {
            Ok(self
                .entries
                .lock()
                .map(|entries| entries.clone())
                .unwrap_or_default())
        }

        fn write(&self, entries: &[LogEntry]) -> Result<(), ScriptLogError> {
            if let Ok(mut stored) = self.entries.lock() {
                *stored = entries.to_vec();
            }
            Ok(())
        }
    }

    fn entry(id: &str, instance_id: &str, output: Option<&str>) -> LogEntry {
        LogEntry {
            id: id.to_owned(),
            instance_id: instance_id.to_owned(),
            date_time: String::from("2026-01-01 00:00:00"),
            operation: ScriptOperation::Create,
            script_name: String::from("install.sh"),
            status: ScriptStatus::Pending,
            output: output.map(str::to_owned),
        }
    }

    #[rstest]
    fn append_prepends_newest_first() {
        let log = ScriptLog::new(MemoryStore::default());
        log.append(entry("a", "99", None)).expect("append");
        log.append(entry("b", "99", None)).expect("append");

        let entries = log.entries_for_instance("99").expect("read");
        let ids: Vec<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[rstest]
    fn update_by_id_changes_status_and_output() {
        let log = ScriptLog::new(MemoryStore::default());
        log.append(entry("a", "99", None)).expect("append");
        log.update("a", ScriptStatus::Completed, Some(String::from("done")))
            .expect("update");

        let entries = log.entries_for_instance("99").expect("read");
        assert_eq!(entries[0].status, ScriptStatus::Completed);
        assert_eq!(entries[0].output.as_deref(), Some("done"));
    }

    #[rstest]
    fn update_of_unknown_id_is_an_error() {
        let log = ScriptLog::new(MemoryStore::default());
        let err = log
            .update("missing", ScriptStatus::Failed, None)
            .expect_err("unknown id must fail");
        assert!(matches!(err, ScriptLogError::UnknownEntry { ref id } if id == "missing"));
    }

    #[rstest]
    fn reads_filter_by_instance_and_decode_base64_output() {
        let log = ScriptLog::new(MemoryStore::default());
        log.append(entry("a", "99", Some("aGVsbG8="))).expect("append");
        log.append(entry("b", "7", Some("other"))).expect("append");

        let entries = log.entries_for_instance("99").expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].output.as_deref(), Some("hello"));
    }

    #[rstest]
    #[case("aGVsbG8=", Some("hello"))]
    #[case("aGVs\nbG8=", Some("hello"))]
    #[case("pending", None)]
    #[case("", None)]
    #[case("%%%%", None)]
    fn base64_detection_is_conservative(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(decode_if_base64(raw).as_deref(), expected);
    }

    #[rstest]
    fn json_file_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp path should be UTF-8");
        let store = JsonFileStore::open(&path).expect("open store");

        assert_eq!(store.read().expect("empty read").len(), 0);

        let entries = vec![entry("a", "99", Some("out"))];
        store.write(&entries).expect("write");
        assert_eq!(store.read().expect("read back"), entries);
    }

    #[rstest]
    fn library_lists_scripts_with_descriptions() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("install.sh"),
            "#!/bin/sh\n# installs the toolchain\n",
        )
        .expect("write script");
        std::fs::write(temp.path().join("boot_script_log.json"), "[]").expect("write log");

        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp path should be UTF-8");
        let library = ScriptLibrary::open(&path).expect("open library");
        let scripts = library.list().expect("list");

        assert_eq!(scripts.len(), 1, "the log file is not a script");
        assert_eq!(scripts[0].name, "install.sh");
        assert_eq!(
            scripts[0].description.as_deref(),
            Some("installs the toolchain")
        );

        let script = library.load("install.sh").expect("load");
        assert!(script.content.starts_with("#!/bin/sh"));
    }
}
