//! Access to the station's persisted settings.
//!
//! The settings file is shared with the management API and carries many
//! sections (model, OCR, tracking, PLC, ...). The relay only reads the
//! streaming flag and the camera index, and writes back the flag.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use toml::{Table, Value};

/// Errors from loading or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The slice of the settings store the relay depends on.
pub trait SettingsStore: Send + Sync {
    /// Whether streaming starts enabled.
    fn streaming_enabled(&self) -> bool;

    /// Index of the capture device.
    fn device_index(&self) -> u32;

    /// Persists a change of the streaming flag.
    fn set_streaming_enabled(&self, enabled: bool) -> Result<(), SettingsError>;
}

const VIDEO_SECTION: &str = "video";
const CAMERA_SECTION: &str = "camera";
const STREAMING_KEY: &str = "streaming_enabled";
const DEVICE_KEY: &str = "device_index";

/// Settings kept in a hierarchical TOML file.
///
/// Unknown sections are preserved on save.
pub struct TomlSettingsStore {
    path: PathBuf,
    table: Mutex<Table>,
}

impl TomlSettingsStore {
    /// Loads the file at `path`; a missing file yields default settings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let table = match std::fs::read_to_string(&path) {
            Ok(content) => content.parse::<Table>().map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Settings file not found, using defaults");
                Table::new()
            }
            Err(source) => return Err(SettingsError::Read { path, source }),
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(table: &Table, section: &str, key: &str) -> Option<Value> {
        table.get(section)?.as_table()?.get(key).cloned()
    }

    fn save(&self, table: &Table) -> Result<(), SettingsError> {
        let content = toml::to_string_pretty(table)?;
        std::fs::write(&self.path, content).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl SettingsStore for TomlSettingsStore {
    fn streaming_enabled(&self) -> bool {
        Self::lookup(&self.lock(), VIDEO_SECTION, STREAMING_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    fn device_index(&self) -> u32 {
        // The management UI stores the index as a string.
        match Self::lookup(&self.lock(), CAMERA_SECTION, DEVICE_KEY) {
            Some(Value::Integer(n)) => u32::try_from(n).unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn set_streaming_enabled(&self, enabled: bool) -> Result<(), SettingsError> {
        let mut table = self.lock();
        let section = table
            .entry(VIDEO_SECTION)
            .or_insert_with(|| Value::Table(Table::new()));
        if !section.is_table() {
            *section = Value::Table(Table::new());
        }
        if let Value::Table(video) = section {
            video.insert(STREAMING_KEY.into(), Value::Boolean(enabled));
        }
        self.save(&table)
    }
}

/// In-memory settings, for tests and `--mock` runs.
#[derive(Debug)]
pub struct MemorySettingsStore {
    streaming: Mutex<bool>,
    device_index: u32,
}

impl MemorySettingsStore {
    pub fn new(streaming_enabled: bool, device_index: u32) -> Self {
        Self {
            streaming: Mutex::new(streaming_enabled),
            device_index,
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(true, 0)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn streaming_enabled(&self) -> bool {
        *self.streaming.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn device_index(&self) -> u32 {
        self.device_index
    }

    fn set_streaming_enabled(&self, enabled: bool) -> Result<(), SettingsError> {
        *self.streaming.lock().unwrap_or_else(|p| p.into_inner()) = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("truck-relay-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn test_missing_file_defaults() {
        let store = TomlSettingsStore::load(temp_path("missing")).unwrap();
        assert!(store.streaming_enabled());
        assert_eq!(store.device_index(), 0);
    }

    #[test]
    fn test_reads_and_preserves_sections() {
        let path = temp_path("roundtrip");
        std::fs::write(
            &path,
            r#"
            [camera]
            device_index = "2"
            resolution = "1280x720"

            [video]
            streaming_enabled = false

            [plc]
            address = "192.168.0.10"
            "#,
        )
        .unwrap();

        let store = TomlSettingsStore::load(&path).unwrap();
        assert!(!store.streaming_enabled());
        assert_eq!(store.device_index(), 2);

        store.set_streaming_enabled(true).unwrap();
        let reloaded = TomlSettingsStore::load(&path).unwrap();
        assert!(reloaded.streaming_enabled());
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("192.168.0.10"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_parse_error_reported() {
        let path = temp_path("broken");
        std::fs::write(&path, "[camera\n").unwrap();
        assert!(matches!(
            TomlSettingsStore::load(&path),
            Err(SettingsError::Parse { .. })
        ));
        std::fs::remove_file(&path).ok();
    }
}
