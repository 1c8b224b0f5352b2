/*!
 * Background Scanner
 * Periodic discovery keeping the device cache fresh
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::BluetoothManager;
use crate::bus::BluetoothBus;
use crate::config::ScanConfig;
use crate::error::BluetoothError;

pub struct ScanLoop<B> {
    manager: Arc<BluetoothManager<B>>,
    duration: Duration,
    interval: Duration,
}

impl<B: BluetoothBus + 'static> ScanLoop<B> {
    pub fn new(manager: Arc<BluetoothManager<B>>, config: &ScanConfig) -> Self {
        Self {
            manager,
            duration: Duration::from_secs(config.auto_duration_secs),
            interval: Duration::from_secs(config.interval_secs),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(
            "Background scanning every {}s ({}s sessions)",
            self.interval.as_secs(),
            self.duration.as_secs()
        );

        loop {
            self.cycle().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One scan-then-refresh pass. Never fails: errors are logged and the
    /// next cycle tries again.
    async fn cycle(&self) {
        match self.manager.discovery().start_discovery(self.duration).await {
            Ok(()) => {}
            Err(BluetoothError::AlreadyDiscovering) => {
                debug!("Skipping background discovery, a scan is already running")
            }
            Err(e) => warn!("Background discovery failed: {}", e),
        }

        match self.manager.refresh_devices().await {
            Ok(count) => debug!("Background refresh found {} devices", count),
            Err(e) => warn!("Background refresh failed: {}", e),
        }
    }
}
