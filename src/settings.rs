//! Local settings files and the rolling log.
//!
//! Two JSON files live under the storage root: `settings.json` for the
//! block server and `backup.json` for the backup tool. Both tolerate
//! unknown keys. Neither is part of the wire format and both may evolve.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{LibernetError, Result};
use crate::timestamp;

pub const SETTINGS_NAME: &str = "settings.json";
pub const BACKUP_SETTINGS_NAME: &str = "backup.json";
pub const LOG_NAME: &str = "log.txt";

pub const DEFAULT_SERVER: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;

/// Logs larger than this roll into a monthly zip at startup.
pub const MAX_LOG_SIZE: u64 = 1024 * 1024;

fn is_false(value: &bool) -> bool {
    !*value
}

/// `settings.json`: the block server's knobs.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One remembered server in `backup.json`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// The server used most recently; at most one entry carries this.
    #[serde(default, skip_serializing_if = "is_false")]
    pub last: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// `backup.json`: the backup tool's remembered arguments.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BackupSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub server: BTreeMap<String, ServerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub months: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackupSettings {
    /// The server name to use when none was given: the one marked `last`,
    /// else the default.
    pub fn last_server(&self) -> Option<String> {
        self.server
            .iter()
            .find(|(_, entry)| entry.last)
            .map(|(name, _)| name.clone())
    }

    /// Mark `name` as the most recently used server.
    pub fn set_last_server(&mut self, name: &str) {
        for entry in self.server.values_mut() {
            entry.last = false;
        }

        self.server.entry(name.to_string()).or_default().last = true;
    }
}

fn load_json<T: for<'a> Deserialize<'a> + Default>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(error) => Err(LibernetError::io(error, path)),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LibernetError::io(e, parent))?;
    }

    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).map_err(|e| LibernetError::io(e, path))
}

pub fn load_server_settings(storage: &Path) -> Result<ServerSettings> {
    load_json(&storage.join(SETTINGS_NAME))
}

pub fn save_server_settings(storage: &Path, settings: &ServerSettings) -> Result<()> {
    save_json(&storage.join(SETTINGS_NAME), settings)
}

pub fn load_backup_settings(storage: &Path) -> Result<BackupSettings> {
    load_json(&storage.join(BACKUP_SETTINGS_NAME))
}

pub fn save_backup_settings(storage: &Path, settings: &BackupSettings) -> Result<()> {
    save_json(&storage.join(BACKUP_SETTINGS_NAME), settings)
}

/// Command line beats the stored value beats the default. Returns the
/// effective value and whether the stored value should be updated.
pub fn reconcile<T: Clone + PartialEq>(
    from_args: Option<T>,
    stored: Option<T>,
    default: T,
) -> (T, bool) {
    match from_args {
        Some(value) => {
            let changed = stored.as_ref() != Some(&value);
            (value, changed)
        }
        None => (stored.unwrap_or(default), false),
    }
}

/// The default storage root: the platform data directory, or a dot
/// directory as a last resort.
pub fn default_storage() -> PathBuf {
    dirs::data_dir()
        .map(|base| base.join("libernet"))
        .unwrap_or_else(|| PathBuf::from(".libernet"))
}

/// Archive an oversized `log.txt` into `log.txt_{YYYY-MM}.zip` and start
/// fresh. Returns the path the live log should append to.
pub fn roll_log(storage: &Path) -> Result<PathBuf> {
    let log_path = storage.join(LOG_NAME);
    let too_big = fs::metadata(&log_path)
        .map(|m| m.len() > MAX_LOG_SIZE)
        .unwrap_or(false);

    if !too_big {
        return Ok(log_path);
    }

    let month = timestamp::month_label(Utc::now(), 0);
    let archive_path = storage.join(format!("{LOG_NAME}_{month}.zip"));
    let archive =
        fs::File::create(&archive_path).map_err(|e| LibernetError::io(e, &archive_path))?;
    let mut writer = zip::ZipWriter::new(archive);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    writer
        .start_file(LOG_NAME, options)
        .map_err(|e| LibernetError::Invariant(format!("log archive failed: {e}")))?;
    let contents = fs::read(&log_path).map_err(|e| LibernetError::io(e, &log_path))?;
    writer
        .write_all(&contents)
        .map_err(|e| LibernetError::io(e, &archive_path))?;
    writer
        .finish()
        .map_err(|e| LibernetError::Invariant(format!("log archive failed: {e}")))?;

    fs::remove_file(&log_path).map_err(|e| LibernetError::io(e, &log_path))?;
    Ok(log_path)
}
