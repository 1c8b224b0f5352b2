use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub bluetooth: BluetoothConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Timeout for a single D-Bus method call.
    pub call_timeout_secs: u64,
    /// Pause after a device command before re-reading device state.
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub auto_scan: bool,
    pub auto_duration_secs: u64,
    pub interval_secs: u64,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub default_duration_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            cors_origins: vec!["*".to_string()],
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            settle_ms: 1000,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            auto_scan: true,
            auto_duration_secs: 10,
            interval_secs: 30,
            min_duration_secs: 1,
            max_duration_secs: 60,
            default_duration_secs: 15,
        }
    }
}

impl BluetoothConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config: Self = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::debug!("Could not write default config to {}: {}", path, e);
                }
                config
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scan = &self.scan;
        if scan.min_duration_secs == 0 || scan.min_duration_secs > scan.max_duration_secs {
            bail!(
                "scan duration range {}..={} is invalid",
                scan.min_duration_secs,
                scan.max_duration_secs
            );
        }
        if !(scan.min_duration_secs..=scan.max_duration_secs).contains(&scan.default_duration_secs) {
            bail!(
                "default_duration_secs {} is outside {}..={}",
                scan.default_duration_secs,
                scan.min_duration_secs,
                scan.max_duration_secs
            );
        }
        if scan.auto_scan && scan.auto_duration_secs == 0 {
            bail!("auto_duration_secs must be positive");
        }
        if scan.auto_scan && scan.interval_secs == 0 {
            bail!("interval_secs must be positive");
        }
        Ok(())
    }
}
