//! Configuration – reads/writes `~/.cairn/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cairn_runtime::CoreConfig;

/// Persisted user configuration stored in `~/.cairn/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the memory namespace.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Maximum memory leaf size in bytes.
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,

    /// Path-lock TTL in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Let `append` create a missing leaf.
    #[serde(default)]
    pub create_on_append: bool,

    /// Default discovery relevance cut-off.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Default number of tools returned by discovery.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    /// Cache entry lifetime; absent keeps entries until the session ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,

    /// SQLite database for the memory tree; absent keeps memory in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,

    /// TOML tool catalog; absent loads the built-in demo catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<String>,

    #[serde(default)]
    pub allow_secrets: bool,

    #[serde(default = "default_repeat_query_threshold")]
    pub repeat_query_threshold: usize,
}

fn default_path_prefix() -> String {
    CoreConfig::default().path_prefix
}
fn default_chunk_limit() -> usize {
    CoreConfig::default().chunk_limit
}
fn default_lock_ttl_ms() -> u64 {
    u64::try_from(CoreConfig::default().lock_ttl.as_millis()).unwrap_or(u64::MAX)
}
fn default_threshold() -> f64 {
    CoreConfig::default().threshold
}
fn default_top_k() -> usize {
    CoreConfig::default().top_k
}
fn default_cache_enabled() -> bool {
    true
}
fn default_repeat_query_threshold() -> usize {
    CoreConfig::default().repeat_query_threshold
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            chunk_limit: default_chunk_limit(),
            lock_ttl_ms: default_lock_ttl_ms(),
            create_on_append: false,
            threshold: default_threshold(),
            top_k: default_top_k(),
            cache_enabled: default_cache_enabled(),
            cache_ttl_secs: None,
            db_path: None,
            catalog_path: None,
            allow_secrets: false,
            repeat_query_threshold: default_repeat_query_threshold(),
        }
    }
}

impl Config {
    /// The core configuration this file describes.
    pub fn to_core_config(&self) -> CoreConfig {
        let mut core = CoreConfig {
            path_prefix: self.path_prefix.clone(),
            chunk_limit: self.chunk_limit,
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            create_on_append: self.create_on_append,
            threshold: self.threshold,
            top_k: self.top_k,
            persistence_path: self.db_path.clone(),
            allow_secrets: self.allow_secrets,
            repeat_query_threshold: self.repeat_query_threshold,
            ..CoreConfig::default()
        };
        core.cache.enabled = self.cache_enabled;
        core.cache.ttl = self.cache_ttl_secs.map(Duration::from_secs);
        core
    }
}

/// Directory holding the config file and the default database.
pub fn cairn_dir() -> PathBuf {
    cairn_dir_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Return the path to `~/.cairn/config.toml`.
pub fn config_path() -> PathBuf {
    cairn_dir().join("config.toml")
}

pub(crate) fn cairn_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cairn")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
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

/// Apply `CAIRN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CAIRN_PATH_PREFIX` | `path_prefix` |
/// | `CAIRN_CHUNK_LIMIT` | `chunk_limit` |
/// | `CAIRN_LOCK_TTL_MS` | `lock_ttl_ms` |
/// | `CAIRN_DB_PATH` | `db_path` |
/// | `CAIRN_CATALOG` | `catalog_path` |
/// | `CAIRN_THRESHOLD` | `threshold` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CAIRN_PATH_PREFIX") {
        cfg.path_prefix = v;
    }
    if let Ok(v) = std::env::var("CAIRN_CHUNK_LIMIT")
        && let Ok(limit) = v.parse::<usize>()
    {
        cfg.chunk_limit = limit;
    }
    if let Ok(v) = std::env::var("CAIRN_LOCK_TTL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.lock_ttl_ms = ms;
    }
    if let Ok(v) = std::env::var("CAIRN_DB_PATH") {
        cfg.db_path = Some(v);
    }
    if let Ok(v) = std::env::var("CAIRN_CATALOG") {
        cfg.catalog_path = Some(v);
    }
    if let Ok(v) = std::env::var("CAIRN_THRESHOLD")
        && let Ok(t) = v.parse::<f64>()
    {
        cfg.threshold = t;
    }
}

/// Save the config to disk, creating `~/.cairn/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // The directory may also hold the memory database (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_path_in(dir: &tempfile::TempDir) -> PathBuf {
        cairn_dir_for_home(&dir.path().to_string_lossy()).join("config.toml")
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_in(&dir);

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_in(&dir);

        let cfg = Config {
            top_k: 3,
            cache_ttl_secs: Some(60),
            repeat_query_threshold: 4,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.top_k, 3);
        assert_eq!(loaded.cache_ttl_secs, Some(60));
        assert_eq!(loaded.repeat_query_threshold, 4);
        assert!(loaded.cache_enabled);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("top_k = 2\n").expect("parse");
        assert_eq!(cfg.top_k, 2);
        assert_eq!(cfg.path_prefix, "/memories");
        assert_eq!(cfg.chunk_limit, 64 * 1024);
        assert_eq!(cfg.lock_ttl_ms, 30_000);
        assert_eq!(cfg.repeat_query_threshold, 3);
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn core_config_conversion() {
        let cfg = Config {
            lock_ttl_ms: 250,
            cache_enabled: false,
            cache_ttl_secs: Some(5),
            db_path: Some("/tmp/cairn.db".into()),
            ..Config::default()
        };
        let core = cfg.to_core_config();
        assert_eq!(core.lock_ttl, Duration::from_millis(250));
        assert!(!core.cache.enabled);
        assert_eq!(core.cache.ttl, Some(Duration::from_secs(5)));
        assert_eq!(core.persistence_path.as_deref(), Some("/tmp/cairn.db"));
        assert_eq!(core.path_prefix, "/memories");
    }

    #[test]
    fn zero_lock_ttl_does_not_start_the_core() {
        let cfg = Config {
            lock_ttl_ms: 0,
            ..Config::default()
        };
        assert!(cairn_runtime::Dispatcher::new(cfg.to_core_config()).is_err());
    }

    #[test]
    fn config_path_points_to_cairn_dir() {
        let p = cairn_dir_for_home("/home/testuser").join("config.toml");
        assert!(p.to_string_lossy().contains(".cairn"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&config_path_in(&dir)).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_prefix() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("CAIRN_PATH_PREFIX", "/agent-notes") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.path_prefix, "/agent-notes");
        unsafe { std::env::remove_var("CAIRN_PATH_PREFIX") };
    }

    #[test]
    fn apply_env_overrides_changes_lock_ttl() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("CAIRN_LOCK_TTL_MS", "1500") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.lock_ttl_ms, 1500);
        unsafe { std::env::remove_var("CAIRN_LOCK_TTL_MS") };
    }

    #[test]
    fn apply_env_overrides_sets_paths() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("CAIRN_DB_PATH", "/var/lib/cairn/memory.db");
            std::env::set_var("CAIRN_CATALOG", "/etc/cairn/tools.toml");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.db_path.as_deref(), Some("/var/lib/cairn/memory.db"));
        assert_eq!(cfg.catalog_path.as_deref(), Some("/etc/cairn/tools.toml"));
        unsafe {
            std::env::remove_var("CAIRN_DB_PATH");
            std::env::remove_var("CAIRN_CATALOG");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_numbers() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("CAIRN_CHUNK_LIMIT", "lots");
            std::env::set_var("CAIRN_THRESHOLD", "0.4");
        }
        let mut cfg = Config::default();
        let original_limit = cfg.chunk_limit;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.chunk_limit, original_limit);
        assert_eq!(cfg.threshold, 0.4);
        unsafe {
            std::env::remove_var("CAIRN_CHUNK_LIMIT");
            std::env::remove_var("CAIRN_THRESHOLD");
        }
    }
}
