//! Shared key/value store through which the server publishes its state.
//!
//! Other processes at the site read the exposure time, gain and network
//! location of the server from here, and write telemetry values which the
//! server copies into image headers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub trait StatusStore: Send {
    /// Ensure `path` exists, recording `description` for it.
    fn touch(&mut self, path: &str, description: &str) -> Result<()>;
    /// Read the current value of `path`. `Ok(None)` if it was never set.
    fn get(&self, path: &str) -> Result<Option<String>>;
    fn put(&mut self, path: &str, value: &str) -> Result<()>;
}

/// The keys this server owns, below a configurable prefix.
#[derive(Debug, Clone)]
pub struct StatusPaths {
    prefix: String,
}

impl StatusPaths {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    pub fn etime(&self) -> String {
        self.key("etime")
    }
    pub fn gain(&self) -> String {
        self.key("gain")
    }
    pub fn hostname(&self) -> String {
        self.key("hostname")
    }
    pub fn ip_address(&self) -> String {
        self.key("ipAddress")
    }
    pub fn port(&self) -> String {
        self.key("port")
    }
    pub fn server_running(&self) -> String {
        self.key("serverRunning")
    }

    /// Every key with its description.
    pub fn all(&self) -> Vec<(String, &'static str)> {
        vec![
            (self.etime(), "Camera exposure time (seconds)"),
            (self.gain(), "Camera gain mode"),
            (self.hostname(), "Camera server hostname"),
            (self.ip_address(), "Camera server IP address"),
            (self.port(), "Camera server port"),
            (self.server_running(), "Camera server running"),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StatusEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// A [StatusStore] kept in a JSON file.
///
/// The file maps each key to its value, description and time of last update.
/// Every operation rereads the file so values written by other processes are
/// seen, and every write replaces the file atomically by renaming a
/// temporary file over it.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the store at `path`, creating its directory if needed.
    ///
    /// An existing file must parse.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let store = Self { path };
        let entries = store.load()?;
        debug!(
            "status store {} holds {} entries",
            store.path.display(),
            entries.len()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, StatusEntry>> {
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&buf).map_err(|e| {
            Error::Store(format!("parsing {}: {e}", self.path.display()))
        })
    }

    fn save(&self, entries: &BTreeMap<String, StatusEntry>) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let buf = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp_path, buf)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn modify<F>(&mut self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut StatusEntry),
    {
        let mut entries = self.load()?;
        f(entries.entry(path.to_string()).or_default());
        self.save(&entries)
    }
}

impl StatusStore for JsonFileStore {
    fn touch(&mut self, path: &str, description: &str) -> Result<()> {
        self.modify(path, |entry| {
            if entry.description.is_none() {
                entry.description = Some(description.to_string());
            }
        })
    }

    fn get(&self, path: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(path).and_then(|entry| entry.value))
    }

    fn put(&mut self, path: &str, value: &str) -> Result<()> {
        self.modify(path, |entry| {
            entry.value = Some(value.to_string());
            entry.updated = Some(chrono::Utc::now());
        })
    }
}

/// An in-process [StatusStore].
///
/// Writes can be made to fail, to exercise callers' handling of an
/// unreachable store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
    descriptions: HashMap<String, String>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn description(&self, path: &str) -> Option<&str> {
        self.descriptions.get(path).map(String::as_str)
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Store(format!("write to {path} refused")));
        }
        Ok(())
    }
}

impl StatusStore for MemoryStore {
    fn touch(&mut self, path: &str, description: &str) -> Result<()> {
        self.check_writable(path)?;
        self.descriptions
            .entry(path.to_string())
            .or_insert_with(|| description.to_string());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<String>> {
        Ok(self.values.get(path).cloned())
    }

    fn put(&mut self, path: &str, value: &str) -> Result<()> {
        self.check_writable(path)?;
        self.values.insert(path.to_string(), value.to_string());
        Ok(())
    }
}
