//! Stream configuration.
//!
//! A `StreamConfig` is plain data: build it with `Default`, load it from JSON,
//! then layer `OSLOG_STREAM_*` environment overrides on top.

use std::fs;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LogStreamError, LogStreamResult};
use crate::ffi::types::{
    OsActivityStreamFlag, OS_ACTIVITY_STREAM_HISTORICAL, OS_ACTIVITY_STREAM_PROCESS_ONLY,
};
use crate::resolver::LOGGING_SUPPORT_PATH;

/// Overrides `library_path`.
pub const ENV_LIBRARY: &str = "OSLOG_STREAM_LIBRARY";
/// Overrides `process_id`.
pub const ENV_PID: &str = "OSLOG_STREAM_PID";
/// Overrides `include_history` (`1/true/yes/on`, `0/false/no/off`).
pub const ENV_HISTORY: &str = "OSLOG_STREAM_HISTORY";

/// Flags passed to `os_activity_stream_for_pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(OsActivityStreamFlag);

impl StreamFlags {
    /// Deliver entries already buffered before the stream was opened.
    pub const HISTORICAL: Self = Self(OS_ACTIVITY_STREAM_HISTORICAL);
    /// Restrict delivery to the filtered process.
    pub const PROCESS_ONLY: Self = Self(OS_ACTIVITY_STREAM_PROCESS_ONLY);

    /// No flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw value for the native call.
    #[must_use]
    pub const fn bits(self) -> OsActivityStreamFlag {
        self.0
    }

    /// Wraps a raw value.
    #[must_use]
    pub const fn from_bits(bits: OsActivityStreamFlag) -> Self {
        Self(bits)
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StreamFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What the trampoline does with a record whose message cannot be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// End the whole stream on the first undecodable record.
    #[default]
    StopStream,
    /// Drop the record and keep streaming.
    SkipRecord,
}

/// Configuration for one live log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Shared library providing the activity-stream entry points.
    pub library_path: PathBuf,
    /// Process to stream; `None` means the current process.
    pub process_id: Option<i32>,
    /// Include entries buffered before the stream opened.
    pub include_history: bool,
    /// Restrict delivery to `process_id`.
    pub process_only: bool,
    /// Reaction to an undecodable record.
    pub decode_failure: DecodeFailurePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from(LOGGING_SUPPORT_PATH),
            process_id: None,
            include_history: true,
            process_only: true,
            decode_failure: DecodeFailurePolicy::StopStream,
        }
    }
}

impl StreamConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> LogStreamResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| LogStreamError::config(format!("invalid stream config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> LogStreamResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            LogStreamError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Applies `OSLOG_STREAM_*` environment overrides.
    pub fn apply_env(self) -> LogStreamResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(mut self, lookup: F) -> LogStreamResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_LIBRARY) {
            self.library_path = PathBuf::from(path);
        }

        if let Some(raw) = lookup(ENV_PID) {
            let pid = raw.trim().parse::<i32>().map_err(|_| {
                LogStreamError::config(format!("{ENV_PID} must be a process id, got '{raw}'"))
            })?;
            self.process_id = Some(pid);
        }

        if let Some(raw) = lookup(ENV_HISTORY) {
            self.include_history = parse_bool(&raw).ok_or_else(|| {
                LogStreamError::config(format!("{ENV_HISTORY} must be a boolean, got '{raw}'"))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks field invariants.
    pub fn validate(&self) -> LogStreamResult<()> {
        if self.library_path.as_os_str().is_empty() {
            return Err(LogStreamError::config("library_path cannot be empty"));
        }
        if let Some(pid) = self.process_id {
            if pid <= 0 {
                return Err(LogStreamError::config(format!(
                    "process_id must be positive, got {pid}"
                )));
            }
        }
        Ok(())
    }

    /// Native flags derived from `include_history` and `process_only`.
    #[must_use]
    pub fn flags(&self) -> StreamFlags {
        let mut flags = StreamFlags::empty();
        if self.include_history {
            flags |= StreamFlags::HISTORICAL;
        }
        if self.process_only {
            flags |= StreamFlags::PROCESS_ONLY;
        }
        flags
    }

    /// The configured process id, or the current process.
    #[must_use]
    pub fn resolved_pid(&self) -> i32 {
        // SAFETY: getpid has no preconditions.
        self.process_id.unwrap_or_else(|| unsafe { libc::getpid() })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_flags_are_historical_and_process_only() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.flags(), StreamFlags::HISTORICAL | StreamFlags::PROCESS_ONLY);
        assert_eq!(cfg.flags().bits(), 0x9);
        assert_eq!(cfg.decode_failure, DecodeFailurePolicy::StopStream);
    }

    #[test]
    fn test_flags_without_history() {
        let cfg = StreamConfig {
            include_history: false,
            ..StreamConfig::default()
        };
        assert!(!cfg.flags().contains(StreamFlags::HISTORICAL));
        assert!(cfg.flags().contains(StreamFlags::PROCESS_ONLY));
    }

    #[test]
    fn test_resolved_pid_defaults_to_self() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.resolved_pid() as u32, std::process::id());

        let cfg = StreamConfig {
            process_id: Some(77),
            ..StreamConfig::default()
        };
        assert_eq!(cfg.resolved_pid(), 77);
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let json = r#"{"process_id": 12, "decode_failure": "skip_record"}"#;
        let cfg = StreamConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.process_id, Some(12));
        assert_eq!(cfg.decode_failure, DecodeFailurePolicy::SkipRecord);
        assert_eq!(cfg.library_path, PathBuf::from(LOGGING_SUPPORT_PATH));
        assert!(cfg.include_history);
    }

    #[test]
    fn test_json_invalid() {
        let err = StreamConfig::from_json_str("{not json").unwrap_err();
        assert!(err.is_config());

        let err = StreamConfig::from_json_str(r#"{"process_id": -3}"#).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        let mut file = std::fs::File::create(&path).unwrap();
        let json = r#"{"library_path": "/tmp/libfake.dylib", "include_history": false}"#;
        writeln!(file, "{json}").unwrap();

        let cfg = StreamConfig::from_file(&path).unwrap();
        assert_eq!(cfg.library_path, PathBuf::from("/tmp/libfake.dylib"));
        assert!(!cfg.include_history);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = StreamConfig::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_overrides() {
        let cfg = StreamConfig::default()
            .apply_overrides(env(&[
                (ENV_LIBRARY, "/opt/LoggingSupport"),
                (ENV_PID, " 4242 "),
                (ENV_HISTORY, "off"),
            ]))
            .unwrap();
        assert_eq!(cfg.library_path, PathBuf::from("/opt/LoggingSupport"));
        assert_eq!(cfg.process_id, Some(4242));
        assert!(!cfg.include_history);
    }

    #[test]
    fn test_bad_overrides() {
        let err = StreamConfig::default()
            .apply_overrides(env(&[(ENV_PID, "self")]))
            .unwrap_err();
        assert!(err.is_config());

        let err = StreamConfig::default()
            .apply_overrides(env(&[(ENV_HISTORY, "maybe")]))
            .unwrap_err();
        assert!(err.is_config());
    }
}
