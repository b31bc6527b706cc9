//! Broker configuration – reads/writes `~/.nodebus/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nodebus_broker::BrokerConfig;
use nodebus_middleware::LinkConfig;
use serde::{Deserialize, Serialize};

/// Persisted configuration stored in `~/.nodebus/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Interface the broker binds to.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Delay between reconnect attempts of nodes started by this tool.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: f64,

    /// Time a connection has to send NODE_ANNOUNCE.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: f64,

    /// Lifetime of an unanswered request's requester entry.
    #[serde(default = "default_pending_request_ttl")]
    pub pending_request_ttl_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_reconnect_interval() -> f64 {
    5.0
}
fn default_handshake_timeout() -> f64 {
    5.0
}
fn default_pending_request_ttl() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            reconnect_interval_secs: default_reconnect_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            pending_request_ttl_secs: default_pending_request_ttl(),
        }
    }
}

/// Seconds to a [`Duration`], treating negative or non-finite values as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default()
            .with_handshake_timeout(secs(self.handshake_timeout_secs))
            .with_pending_request_ttl(Duration::from_secs(self.pending_request_ttl_secs))
    }

    /// Link settings for a node talking to this broker.  A wildcard bind
    /// address is reached through loopback.
    pub fn link_config(&self) -> LinkConfig {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        LinkConfig::new(host, self.port)
            .with_reconnect_interval(secs(self.reconnect_interval_secs))
            .with_handshake_timeout(secs(self.handshake_timeout_secs))
    }
}

/// Return the path to `~/.nodebus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".nodebus").join("config.toml")
}

/// Load the config from disk, falling back to defaults when the file is
/// absent.  Environment overrides are applied in both cases.
pub fn load_or_default() -> Result<(Config, bool), String> {
    load_or_default_from(&config_path())
}

pub(crate) fn load_or_default_from(path: &Path) -> Result<(Config, bool), String> {
    let (mut cfg, found) = match load_from(path)? {
        Some(cfg) => (cfg, true),
        None => (Config::default(), false),
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, found))
}

/// Load the config file at `path`.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `NODEBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NODEBUS_HOST` | `host` |
/// | `NODEBUS_PORT` | `port` |
/// | `NODEBUS_RECONNECT_INTERVAL` | `reconnect_interval_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("NODEBUS_HOST")
        && !v.is_empty()
    {
        cfg.host = v;
    }
    if let Ok(v) = std::env::var("NODEBUS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("NODEBUS_RECONNECT_INTERVAL")
        && let Ok(secs) = v.parse::<f64>()
        && secs.is_finite()
        && secs >= 0.0
    {
        cfg.reconnect_interval_secs = secs;
    }
}

/// Save the config to disk, creating `~/.nodebus/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, Config::default());
        assert_eq!(loaded.port, 3000);
        assert_eq!(loaded.host, "0.0.0.0");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 3100\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.port, 3100);
        assert_eq!(loaded.pending_request_ttl_secs, 300);
        assert_eq!(loaded.reconnect_interval_secs, 5.0);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"three thousand\"\n").expect("write");
        assert!(load_from(&path).unwrap_err().contains("Failed to parse config"));
    }

    #[test]
    fn config_path_points_to_nodebus_dir() {
        let p = config_path_for_home("/home/robot");
        assert_eq!(p, PathBuf::from("/home/robot/.nodebus/config.toml"));
    }

    #[test]
    fn derived_configs_carry_durations() {
        let cfg = Config {
            reconnect_interval_secs: 0.25,
            handshake_timeout_secs: 2.0,
            pending_request_ttl_secs: 60,
            ..Config::default()
        };
        let broker = cfg.broker_config();
        assert_eq!(broker.handshake_timeout, Duration::from_secs(2));
        assert_eq!(broker.pending_request_ttl, Duration::from_secs(60));

        let link = cfg.link_config();
        assert_eq!(link.url(), "ws://127.0.0.1:3000/nodes");
        assert_eq!(link.reconnect_interval, Duration::from_millis(250));
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        let cfg = Config {
            handshake_timeout_secs: -1.0,
            ..Config::default()
        };
        assert_eq!(cfg.broker_config().handshake_timeout, Duration::ZERO);
    }

    // Env-var tests share process state, so they run as one test.
    #[test]
    fn env_overrides_apply_and_ignore_invalid_values() {
        // SAFETY: no other test reads or writes the NODEBUS_* variables.
        unsafe {
            std::env::set_var("NODEBUS_HOST", "10.0.0.5");
            std::env::set_var("NODEBUS_PORT", "not-a-port");
            std::env::set_var("NODEBUS_RECONNECT_INTERVAL", "0.5");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.host, "10.0.0.5");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.reconnect_interval_secs, 0.5);

        unsafe { std::env::set_var("NODEBUS_PORT", "3200") };
        let dir = tempfile::tempdir().expect("tmp dir");
        let (cfg, found) = load_or_default_from(&dir.path().join("absent.toml")).expect("defaults");
        assert!(!found);
        assert_eq!(cfg.port, 3200);

        unsafe {
            std::env::remove_var("NODEBUS_HOST");
            std::env::remove_var("NODEBUS_PORT");
            std::env::remove_var("NODEBUS_RECONNECT_INTERVAL");
        }
    }
}
