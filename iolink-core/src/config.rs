//! Transport configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::IoError;
use crate::route::{RouteTable, SecurityLevel};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub jobs: JobsConfig,
    pub heartbeat: HeartbeatConfig,
    pub writer: WriterConfig,
    pub security: SecurityConfig,
    pub handshake: HandshakeConfig,
}

/// `[jobs]`: per-connection job pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Ceiling on queued-or-writing user jobs per connection.
    pub max_active_jobs: usize,
    /// Responses buffered per job before the reader backs off.
    pub response_history: usize,
}

/// `[heartbeat]`: liveness packages sent while the connection is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Send heartbeats to peers that understand them (version 1.1+).
    pub enabled: bool,
    /// Fixed cadence between heartbeats. `0` disables them as well.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Budget for writing one package, all partial writes included.
    pub write_timeout_ms: u64,
    /// How long start and stop wait for the writer task to settle.
    pub start_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Picks the route table; `high` refuses to run without TLS.
    pub level: SecurityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Free text sent to the peer; truncated to 64 bytes on the wire.
    pub description: String,
    /// Budget for sending and receiving the handshake record.
    pub timeout_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: 64,
            response_history: 16,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 30_000,
            start_timeout_ms: 10_000,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            description: concat!("iolink ", env!("CARGO_PKG_VERSION")).into(),
            timeout_ms: 10_000,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl TransportConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, IoError> {
        Ok(toml::from_str(text)?)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::for_level(self.security.level)
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat.enabled && self.heartbeat.interval_ms > 0)
            .then(|| Duration::from_millis(self.heartbeat.interval_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.writer.write_timeout_ms.max(1))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.writer.start_timeout_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.timeout_ms.max(1))
    }

    /// The ceiling, never below one job.
    pub fn max_active_jobs(&self) -> usize {
        self.jobs.max_active_jobs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::TransportMode;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&TransportConfig::default()).unwrap();
        assert!(text.contains("max_active_jobs"));
        assert!(text.contains("interval_ms"));
        assert!(text.contains("level = \"normal\""));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = TransportConfig::from_toml_str(
            "[security]\nlevel = \"high\"\n[heartbeat]\nenabled = false\n",
        )
        .unwrap();
        assert_eq!(cfg.security.level, SecurityLevel::High);
        assert_eq!(cfg.heartbeat_interval(), None);
        assert_eq!(cfg.jobs.max_active_jobs, 64);
        assert_eq!(cfg.route_table().default_route().mode, TransportMode::Ssl);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(matches!(
            TransportConfig::from_toml_str("[jobs\nmax_active_jobs = 1"),
            Err(IoError::Config(_))
        ));
    }

    #[test]
    fn load_falls_back_when_missing() {
        let cfg = TransportConfig::load(Path::new("/nonexistent/iolink.toml"));
        assert_eq!(cfg.writer.write_timeout_ms, 30_000);
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("iolink-{}.toml", uuid::Uuid::new_v4()));
        TransportConfig::write_default(&path).unwrap();
        let cfg = TransportConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.heartbeat_interval(), Some(Duration::from_millis(5000)));
        assert_eq!(cfg.max_active_jobs(), 64);
    }
}
