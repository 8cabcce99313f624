//! OTA Upload Tool
//! Config store module for persisting upload parameters between runs
//!
//! The backing file is plain text, one `key = value` pair per line. Blank
//! lines and lines starting with `#` are ignored. Values supplied on the
//! command line override the file and are written straight back to it.

use log::{ debug, info, warn };
use std::collections::BTreeMap;
use std::fs::{ self, OpenOptions };
use std::io::Write;
use std::path::{ Path, PathBuf };
use thiserror::Error;

/// Default location of the backing file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = ".temp";

/// Custom error types for config store operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed entry on line {line_number}: {line:?}")]
    Malformed { line_number: usize, line: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The settings the tool knows how to persist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    File,
    Ip,
    Port,
    Auth,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [ConfigKey::File, ConfigKey::Ip, ConfigKey::Port, ConfigKey::Auth];

    /// Name the key is stored under in the backing file
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::File => "TEMP_OTA_FILE",
            ConfigKey::Ip => "TEMP_OTA_IP",
            ConfigKey::Port => "TEMP_OTA_PORT",
            ConfigKey::Auth => "TEMP_OTA_AUTH",
        }
    }
}

/// Key-value settings for the current session, mirrored to a flat file
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Open the store at `path`, creating the file if it does not exist.
    ///
    /// Never fails: an unreadable or malformed file yields an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = Self::load(&path);
        info!("Loaded {} config entries from {}", entries.len(), path.display());
        Self { path, entries }
    }

    /// Load the backing file into a map.
    ///
    /// Any failure (file cannot be created or read, a line without `=`)
    /// is logged and recovered as an empty map.
    pub fn load(path: &Path) -> BTreeMap<String, String> {
        match Self::try_load(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    fn try_load(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
        // Touch the file so the first write has somewhere to land
        OpenOptions::new().create(true).append(true).open(path)?;
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse `key = value` lines. Everything after the first `=` is the value.
    pub fn parse(contents: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut entries = BTreeMap::new();

        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line_number: index + 1,
                    line: raw.to_string(),
                });
            };

            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            entries.insert(key.to_string(), value.trim().to_string());
        }

        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value for `key`, or an empty string if it was never set
    pub fn read(&self, key: ConfigKey) -> &str {
        self.entries
            .get(key.as_str())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Set one value and rewrite the whole file
    pub fn write(&mut self, key: ConfigKey, value: impl Into<String>) -> Result<(), ConfigError> {
        self.entries.insert(key.as_str().to_string(), value.into());
        self.persist()
    }

    /// Set several values with a single rewrite of the file
    pub fn write_all<I, V>(&mut self, values: I) -> Result<(), ConfigError>
        where I: IntoIterator<Item = (ConfigKey, V)>, V: Into<String>
    {
        for (key, value) in values {
            self.entries.insert(key.as_str().to_string(), value.into());
        }
        self.persist()
    }

    /// Apply values supplied on the command line and persist them at once
    pub fn apply_overrides<I>(&mut self, overrides: I) -> Result<(), ConfigError>
        where I: IntoIterator<Item = (ConfigKey, String)>
    {
        for (key, value) in overrides {
            info!("Command line override for {}", key.as_str());
            self.write(key, value)?;
        }
        Ok(())
    }

    /// Serialize the in-memory map over the backing file.
    ///
    /// Written to a sibling file first and renamed into place, so an
    /// interrupted write leaves the previous contents untouched.
    fn persist(&self) -> Result<(), ConfigError> {
        let mut contents = String::new();
        for (key, value) in &self.entries {
            contents.push_str(key);
            contents.push_str(" = ");
            contents.push_str(value);
            contents.push('\n');
        }

        let tmp_path = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!("Wrote {} config entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
