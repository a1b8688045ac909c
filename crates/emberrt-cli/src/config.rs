//! Simulator configuration – reads/writes `~/.emberrt/config.toml`.

use emberrt_types::BINARY_COUNT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted simulator configuration stored in `~/.emberrt/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of binary slots to provision, capped at [`BINARY_COUNT`].
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    /// Size of each binary partition, in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u32,

    /// Size of the reserved metadata partition, in bytes.
    #[serde(default = "default_metadata_part_size")]
    pub metadata_part_size: u32,

    /// Message-size cap declared when registering the shell's response
    /// channel.
    #[serde(default = "default_max_msg_bytes")]
    pub max_msg_bytes: usize,
}

fn default_slot_count() -> usize {
    3
}
fn default_part_size() -> u32 {
    64 * 1024
}
fn default_metadata_part_size() -> u32 {
    8192
}
fn default_max_msg_bytes() -> usize {
    16 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            part_size: default_part_size(),
            metadata_part_size: default_metadata_part_size(),
            max_msg_bytes: default_max_msg_bytes(),
        }
    }
}

impl Config {
    /// Clamp values that would make boot fail outright.
    pub fn sanitized(mut self) -> Self {
        self.slot_count = self.slot_count.clamp(1, BINARY_COUNT);
        self
    }
}

/// Return the path to `~/.emberrt/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".emberrt").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `EMBERRT_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `EMBERRT_SLOT_COUNT` | `slot_count` |
/// | `EMBERRT_PART_SIZE` | `part_size` |
/// | `EMBERRT_MAX_MSG_BYTES` | `max_msg_bytes` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("EMBERRT_SLOT_COUNT")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.slot_count = n;
    }
    if let Ok(v) = std::env::var("EMBERRT_PART_SIZE")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.part_size = n;
    }
    if let Ok(v) = std::env::var("EMBERRT_MAX_MSG_BYTES")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_msg_bytes = n;
    }
}

/// Save the config to disk, creating `~/.emberrt/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.slot_count, 3);
        assert_eq!(loaded.part_size, 64 * 1024);
    }

    #[test]
    fn config_path_points_to_emberrt_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".emberrt"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn sanitized_caps_slot_count() {
        let cfg = Config {
            slot_count: 99,
            ..Config::default()
        };
        assert_eq!(cfg.sanitized().slot_count, BINARY_COUNT);

        let cfg = Config {
            slot_count: 0,
            ..Config::default()
        };
        assert_eq!(cfg.sanitized().slot_count, 1);
    }

    #[test]
    fn apply_env_overrides_changes_slot_count() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("EMBERRT_SLOT_COUNT", "2") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.slot_count, 2);
        unsafe { std::env::remove_var("EMBERRT_SLOT_COUNT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_value() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("EMBERRT_PART_SIZE", "not-a-size") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.part_size, default_part_size());
        unsafe { std::env::remove_var("EMBERRT_PART_SIZE") };
    }
}
