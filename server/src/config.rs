//! Server configuration with typed getters.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables consumed by the tick-budget computation and the session layer.
/// Loaded from a JSON file; anything missing keeps its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Block-update packets the server may emit per second, across all ticks.
    pub packets_per_second: u32,
    /// Upload bandwidth cap in KB/s, shared by a world's observers.
    pub upload_bandwidth: u32,
    /// World tick interval in milliseconds.
    pub tick_interval_ms: u64,
    pub max_players: usize,
    /// Rank assigned to new connections; the graph's lowest rank if unset
    /// or unresolvable.
    pub default_rank: Option<String>,
    pub world_name: String,
    pub world_width: i16,
    pub world_length: i16,
    pub world_height: i16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            packets_per_second: 2000,
            upload_bandwidth: 100,
            tick_interval_ms: 100,
            max_players: 32,
            default_rank: None,
            world_name: "main".to_string(),
            world_width: 128,
            world_length: 128,
            world_height: 64,
        }
    }
}

impl ServerConfig {
    /// Derived tick rate; never below one tick per second.
    pub fn ticks_per_second(&self) -> u32 {
        (1000 / self.tick_interval_ms.max(1)).max(1) as u32
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }

    /// Loads configuration from a JSON file, falling back to defaults (with
    /// a logged reason) when the file is missing or malformed.
    pub fn load(path: &Path) -> ServerConfig {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Malformed configuration {}: {}; using defaults",
                        path.display(),
                        e
                    );
                    ServerConfig::default()
                }
            },
            Err(_) => {
                info!(
                    "No configuration at {}; using defaults",
                    path.display()
                );
                ServerConfig::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ServerConfig::default();
        assert!(config.packets_per_second > 0);
        assert!(config.tick_interval_ms > 0);
        assert_eq!(config.ticks_per_second(), 10);
    }

    #[test]
    fn test_ticks_per_second_bounds() {
        let mut config = ServerConfig::default();
        config.tick_interval_ms = 0;
        assert!(config.ticks_per_second() >= 1);
        config.tick_interval_ms = 5000;
        assert_eq!(config.ticks_per_second(), 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"packets_per_second": 500}"#).unwrap();
        assert_eq!(config.packets_per_second, 500);
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.world_name, "main");
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = ServerConfig::load(Path::new("/nonexistent/config.json"));
        assert_eq!(config.max_players, 32);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut config = ServerConfig::default();
        config.max_players = 7;
        config.default_rank = Some("builder".to_string());

        let path = std::env::temp_dir().join("blockworld-config-test.json");
        config.save(&path).unwrap();
        let loaded = ServerConfig::load(&path);
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.max_players, 7);
        assert_eq!(loaded.default_rank.as_deref(), Some("builder"));
    }
}
