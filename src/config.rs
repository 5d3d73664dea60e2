//! # Option Store
//!
//! Typed, validated configuration threaded explicitly through the
//! components that need it. A store is a plain value constructed at
//! process start — never an implicit global — so tests build isolated
//! stores without touching shared state.
//!
//! Options are declared with [`OptionStore::define`], carrying a type, a
//! default, and (for numeric options) a range. Values persist to a single
//! properties file (`key=value` lines, keys sorted) after every
//! successful set; loading a persisted value that no longer validates
//! logs a warning and keeps the default, so startup never fails on a bad
//! option.
//!
//! ## Example Usage
//!
//! ```rust
//! use tunerio::config::{OptionSpec, OptionStore, OptionValue};
//!
//! let store = OptionStore::new();
//! store.define(OptionSpec::integer("hdhr.retry_count", "probe retries", 2, 0, 10));
//! assert_eq!(store.get_integer("hdhr.retry_count"), Some(2));
//!
//! // An out-of-range set is rejected and the stored value is untouched.
//! assert!(store.set("hdhr.retry_count", OptionValue::Integer(99)).is_err());
//! assert_eq!(store.get_integer("hdhr.retry_count"), Some(2));
//! ```

use crate::{Result, TunerError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stable property keys for the options this crate defines.
pub mod keys {
    /// Seconds between periodic discovery broadcasts; 0 disables them.
    pub const BROADCAST_S: &str = "hdhr.broadcast_s";
    /// UDP port the discovery socket binds.
    pub const BROADCAST_PORT: &str = "hdhr.broadcast_port";
    /// Suppress periodic broadcasts unless one was requested.
    pub const SMART_BROADCAST: &str = "hdhr.smart_broadcast";
    /// Unicast probe targets outside the broadcast domain.
    pub const STATIC_ADDRESSES: &str = "hdhr.static_addresses";
    /// Device models dropped at registration.
    pub const IGNORE_MODELS: &str = "hdhr.ignore_models";
    /// Device IDs (hex) dropped at registration.
    pub const IGNORE_DEVICE_IDS: &str = "hdhr.ignore_device_ids";
    /// Seconds between retune liveness polls.
    pub const RETUNE_POLL_S: &str = "hdhr.retune_poll_s";
    /// Always take the tuner hardware lock when capturing.
    pub const ALWAYS_FORCE_LOCKOUT: &str = "hdhr.always_force_lockout";
    /// Attempts for failed tuner operations.
    pub const RETRY_COUNT: &str = "hdhr.retry_count";
    /// TCP port of the recorder's upload service.
    pub const UPLOAD_PORT: &str = "upload.port";
    /// Ring buffer capacity in bytes.
    pub const STREAM_BUFFER_SIZE: &str = "consumer.raw.stream_buffer_size";
    /// Minimum bytes per streaming transfer.
    pub const MIN_TRANSFER_SIZE: &str = "consumer.raw.min_transfer_size";
    /// Maximum bytes per streaming transfer.
    pub const MAX_TRANSFER_SIZE: &str = "consumer.raw.max_transfer_size";
    /// Bytes written before the file sink's direct-flush check.
    pub const DIRECT_FLUSH_MIN: &str = "consumer.raw.direct_flush_min";
}

/// A typed option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean flag.
    Bool(bool),
    /// 32-bit integer, range-checked against its spec.
    Integer(i32),
    /// 64-bit integer, range-checked against its spec.
    Long(i64),
    /// Free-form string.
    Text(String),
    /// List of strings, persisted comma-joined.
    TextArray(Vec<String>),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Integer(_) => "integer",
            OptionValue::Long(_) => "long",
            OptionValue::Text(_) => "text",
            OptionValue::TextArray(_) => "text array",
        }
    }

    fn encode(&self) -> String {
        match self {
            OptionValue::Bool(v) => v.to_string(),
            OptionValue::Integer(v) => v.to_string(),
            OptionValue::Long(v) => v.to_string(),
            OptionValue::Text(v) => v.clone(),
            OptionValue::TextArray(v) => v.join(","),
        }
    }
}

/// Declaration of one option: key, description, default, and constraints.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Stable property key.
    pub key: String,
    /// Human description for configuration UIs.
    pub description: String,
    /// Value used until a set or a valid persisted value arrives.
    pub default: OptionValue,
    /// Inclusive lower bound for numeric options.
    pub min: Option<i64>,
    /// Inclusive upper bound for numeric options.
    pub max: Option<i64>,
}

impl OptionSpec {
    /// A boolean option.
    pub fn bool(key: &str, description: &str, default: bool) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            default: OptionValue::Bool(default),
            min: None,
            max: None,
        }
    }

    /// An integer option constrained to `min..=max`.
    pub fn integer(key: &str, description: &str, default: i32, min: i32, max: i32) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            default: OptionValue::Integer(default),
            min: Some(min as i64),
            max: Some(max as i64),
        }
    }

    /// A long option constrained to `min..=max`.
    pub fn long(key: &str, description: &str, default: i64, min: i64, max: i64) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            default: OptionValue::Long(default),
            min: Some(min),
            max: Some(max),
        }
    }

    /// A string option.
    pub fn text(key: &str, description: &str, default: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            default: OptionValue::Text(default.to_string()),
            min: None,
            max: None,
        }
    }

    /// A string-array option, empty by default.
    pub fn text_array(key: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            default: OptionValue::TextArray(Vec::new()),
            min: None,
            max: None,
        }
    }

    fn validate(&self, value: &OptionValue) -> Result<()> {
        let numeric = match (&self.default, value) {
            (OptionValue::Bool(_), OptionValue::Bool(_)) => None,
            (OptionValue::Integer(_), OptionValue::Integer(v)) => Some(*v as i64),
            (OptionValue::Long(_), OptionValue::Long(v)) => Some(*v),
            (OptionValue::Text(_), OptionValue::Text(_)) => None,
            (OptionValue::TextArray(_), OptionValue::TextArray(_)) => None,
            _ => {
                return Err(TunerError::Config(format!(
                    "option {} expects {}, got {}",
                    self.key,
                    self.default.type_name(),
                    value.type_name()
                )))
            }
        };
        if let Some(v) = numeric {
            if let Some(min) = self.min {
                if v < min {
                    return Err(TunerError::Config(format!(
                        "option {} value {} below minimum {}",
                        self.key, v, min
                    )));
                }
            }
            if let Some(max) = self.max {
                if v > max {
                    return Err(TunerError::Config(format!(
                        "option {} value {} above maximum {}",
                        self.key, v, max
                    )));
                }
            }
        }
        Ok(())
    }

    fn parse(&self, raw: &str) -> Result<OptionValue> {
        let value = match self.default {
            OptionValue::Bool(_) => match raw.trim() {
                "true" => OptionValue::Bool(true),
                "false" => OptionValue::Bool(false),
                other => {
                    return Err(TunerError::Config(format!(
                        "option {}: not a boolean: {}",
                        self.key, other
                    )))
                }
            },
            OptionValue::Integer(_) => OptionValue::Integer(raw.trim().parse()?),
            OptionValue::Long(_) => OptionValue::Long(raw.trim().parse()?),
            OptionValue::Text(_) => OptionValue::Text(raw.to_string()),
            OptionValue::TextArray(_) => {
                if raw.trim().is_empty() {
                    OptionValue::TextArray(Vec::new())
                } else {
                    OptionValue::TextArray(
                        raw.split(',').map(|part| part.trim().to_string()).collect(),
                    )
                }
            }
        };
        self.validate(&value)?;
        Ok(value)
    }
}

struct Entry {
    spec: OptionSpec,
    value: OptionValue,
}

/// Process-wide option map with validation and properties persistence.
pub struct OptionStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, Entry>>,
    /// Raw persisted values waiting for their option to be defined.
    pending: RwLock<BTreeMap<String, String>>,
}

impl OptionStore {
    /// An in-memory store with no backing file.
    pub fn new() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(BTreeMap::new()),
        }
    }

    /// A store backed by the properties file at `path`. Existing values
    /// load lazily as their options are defined; a missing file is simply
    /// an empty store.
    pub fn with_file(path: &Path) -> Self {
        let mut pending = BTreeMap::new();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        pending.insert(key.trim().to_string(), value.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("cannot read options from {}: {}", path.display(), e),
        }
        Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(pending),
        }
    }

    /// Declares an option. A persisted value that parses and validates
    /// replaces the default; anything else logs a warning and the default
    /// stands, so construction never fails.
    pub fn define(&self, spec: OptionSpec) {
        let persisted = self.pending.write().remove(&spec.key);
        let value = match persisted {
            Some(raw) => match spec.parse(&raw) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("persisted option {} rejected ({}), using default", spec.key, e);
                    spec.default.clone()
                }
            },
            None => spec.default.clone(),
        };
        self.entries
            .write()
            .insert(spec.key.clone(), Entry { spec, value });
    }

    /// Current value of `key`, if the option is defined.
    pub fn get(&self, key: &str) -> Option<OptionValue> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }

    /// Boolean value of `key`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(OptionValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    /// Integer value of `key`.
    pub fn get_integer(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(OptionValue::Integer(v)) => Some(v),
            _ => None,
        }
    }

    /// Long value of `key`.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(OptionValue::Long(v)) => Some(v),
            _ => None,
        }
    }

    /// Text value of `key`.
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(OptionValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    /// Text-array value of `key`.
    pub fn get_text_array(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key) {
            Some(OptionValue::TextArray(v)) => Some(v),
            _ => None,
        }
    }

    /// Sets one option and persists the store.
    ///
    /// A validation failure is returned to the caller and leaves both the
    /// in-memory and the persisted value untouched.
    pub fn set(&self, key: &str, value: OptionValue) -> Result<()> {
        self.set_options(&[(key, value)])
    }

    /// Sets several options atomically, persisting once afterwards. The
    /// first validation failure aborts the whole call with nothing
    /// changed.
    pub fn set_options(&self, updates: &[(&str, OptionValue)]) -> Result<()> {
        {
            let mut entries = self.entries.write();
            for (key, value) in updates {
                let entry = entries
                    .get(*key)
                    .ok_or_else(|| TunerError::Config(format!("unknown option {}", key)))?;
                entry.spec.validate(value)?;
            }
            for (key, value) in updates {
                if let Some(entry) = entries.get_mut(*key) {
                    entry.value = value.clone();
                }
            }
        }
        self.save()
    }

    /// Writes the properties file, keys sorted, one `key=value` per line.
    /// Round-trips idempotently. A store without a backing file is a
    /// no-op.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut content = String::new();
        {
            let entries = self.entries.read();
            for (key, entry) in entries.iter() {
                content.push_str(key);
                content.push('=');
                content.push_str(&entry.value.encode());
                content.push('\n');
            }
            // Keep values for options nobody has defined this run.
            for (key, raw) in self.pending.read().iter() {
                if !entries.contains_key(key) {
                    content.push_str(key);
                    content.push('=');
                    content.push_str(raw);
                    content.push('\n');
                }
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for OptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionStore")
            .field("path", &self.path)
            .field("defined", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn define_samples(store: &OptionStore) {
        store.define(OptionSpec::integer(keys::BROADCAST_S, "broadcast interval", 58, 0, 3600));
        store.define(OptionSpec::bool(keys::SMART_BROADCAST, "smart broadcast", true));
        store.define(OptionSpec::text_array(keys::STATIC_ADDRESSES, "static addresses"));
        store.define(OptionSpec::long(
            keys::STREAM_BUFFER_SIZE,
            "ring capacity",
            2 * 1024 * 1024,
            1024 * 1024,
            i64::MAX,
        ));
    }

    #[test]
    fn test_defaults_and_typed_getters() {
        let store = OptionStore::new();
        define_samples(&store);

        assert_eq!(store.get_integer(keys::BROADCAST_S), Some(58));
        assert_eq!(store.get_bool(keys::SMART_BROADCAST), Some(true));
        assert_eq!(store.get_text_array(keys::STATIC_ADDRESSES), Some(vec![]));
        assert_eq!(store.get_long(keys::STREAM_BUFFER_SIZE), Some(2 * 1024 * 1024));
        // Wrong-type getters return None rather than panicking.
        assert_eq!(store.get_bool(keys::BROADCAST_S), None);
        assert_eq!(store.get_integer("no.such.key"), None);
    }

    #[test]
    fn test_rejected_set_changes_nothing() {
        let store = OptionStore::new();
        define_samples(&store);

        assert!(store.set(keys::BROADCAST_S, OptionValue::Integer(-5)).is_err());
        assert!(store.set(keys::BROADCAST_S, OptionValue::Bool(true)).is_err());
        assert!(store
            .set(keys::STREAM_BUFFER_SIZE, OptionValue::Long(1))
            .is_err());
        assert_eq!(store.get_integer(keys::BROADCAST_S), Some(58));

        // A multi-set fails whole when any value is invalid.
        assert!(store
            .set_options(&[
                (keys::BROADCAST_S, OptionValue::Integer(30)),
                (keys::SMART_BROADCAST, OptionValue::Integer(1)),
            ])
            .is_err());
        assert_eq!(store.get_integer(keys::BROADCAST_S), Some(58));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunerio.properties");

        let store = OptionStore::with_file(&path);
        define_samples(&store);
        store
            .set_options(&[
                (keys::BROADCAST_S, OptionValue::Integer(30)),
                (
                    keys::STATIC_ADDRESSES,
                    OptionValue::TextArray(vec!["10.0.0.9".into(), "10.0.0.10".into()]),
                ),
            ])
            .unwrap();

        let first = std::fs::read_to_string(&path).unwrap();

        let reloaded = OptionStore::with_file(&path);
        define_samples(&reloaded);
        assert_eq!(reloaded.get_integer(keys::BROADCAST_S), Some(30));
        assert_eq!(
            reloaded.get_text_array(keys::STATIC_ADDRESSES),
            Some(vec!["10.0.0.9".to_string(), "10.0.0.10".to_string()])
        );

        // Saving the reloaded store reproduces the file byte for byte.
        reloaded.save().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_persisted_value_reverts_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunerio.properties");
        std::fs::write(&path, "hdhr.broadcast_s=not-a-number\nhdhr.smart_broadcast=false\n")
            .unwrap();

        let store = OptionStore::with_file(&path);
        define_samples(&store);

        // The bad value reverts, the good one loads.
        assert_eq!(store.get_integer(keys::BROADCAST_S), Some(58));
        assert_eq!(store.get_bool(keys::SMART_BROADCAST), Some(false));
    }
}
