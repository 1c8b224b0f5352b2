/*!
 * Bluetooth Device Management
 * Discovery, pairing and connection via BlueZ D-Bus
 */

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::{BluetoothBus, BusError, DeviceCommand, Properties, ADAPTER_INTERFACE};
use crate::cache::{DeviceCache, DeviceRecord};
use crate::discovery::DiscoveryController;
use crate::error::BluetoothError;

pub struct BluetoothManager<B> {
    bus: Arc<B>,
    discovery: DiscoveryController<B>,
    cache: DeviceCache<B>,
    settle: Duration,
}

impl<B: BluetoothBus + 'static> BluetoothManager<B> {
    pub fn new(bus: Arc<B>, settle: Duration) -> Self {
        Self {
            discovery: DiscoveryController::new(Arc::clone(&bus)),
            cache: DeviceCache::new(Arc::clone(&bus)),
            bus,
            settle,
        }
    }

    pub fn discovery(&self) -> &DiscoveryController<B> {
        &self.discovery
    }

    pub async fn adapter_properties(&self) -> Result<Properties, BluetoothError> {
        let adapter = self.discovery.adapter().await?;

        match self.bus.properties(&adapter.path, ADAPTER_INTERFACE).await {
            Ok(props) => Ok(props),
            Err(e) => {
                warn!("Failed to read adapter properties: {}", e);
                self.discovery.note_bus_error(&e).await;
                Err(BluetoothError::AdapterUnavailable)
            }
        }
    }

    pub async fn refresh_devices(&self) -> Result<usize, BluetoothError> {
        self.cache.refresh().await
    }

    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.cache.all().await
    }

    /// Runs a discovery session and returns how many devices are known after it.
    pub async fn scan(&self, duration: Duration) -> Result<usize, BluetoothError> {
        self.discovery.start_discovery(duration).await?;

        match self.cache.refresh().await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!("Device refresh after scan failed: {}", e);
                Ok(self.cache.len().await)
            }
        }
    }

    pub async fn connect(&self, path: &str) -> Result<(), BluetoothError> {
        self.device_command(path, DeviceCommand::Connect).await
    }

    pub async fn disconnect(&self, path: &str) -> Result<(), BluetoothError> {
        self.device_command(path, DeviceCommand::Disconnect).await
    }

    pub async fn pair(&self, path: &str) -> Result<(), BluetoothError> {
        self.device_command(path, DeviceCommand::Pair).await
    }

    /// Removal goes through the adapter, not the device object.
    pub async fn remove(&self, path: &str) -> Result<(), BluetoothError> {
        let device = self.lookup(path).await?;
        let adapter = self.discovery.adapter().await?;

        info!("Removing device: {}", device.path);
        if let Err(e) = self.bus.remove_device(&adapter.path, &device.path).await {
            self.discovery.note_bus_error(&e).await;
            return Err(self.command_failed(&device.path, e).await);
        }

        self.settle_and_refresh().await;
        Ok(())
    }

    async fn device_command(&self, path: &str, command: DeviceCommand) -> Result<(), BluetoothError> {
        let device = self.lookup(path).await?;

        info!("{} device: {}", command.method(), device.path);
        if let Err(e) = self.bus.device_command(&device.path, command).await {
            return Err(self.command_failed(&device.path, e).await);
        }

        self.settle_and_refresh().await;
        Ok(())
    }

    /// Cache lookup with a single refresh-and-retry on a miss.
    async fn lookup(&self, path: &str) -> Result<DeviceRecord, BluetoothError> {
        if let Some(device) = self.cache.get(path).await {
            return Ok(device);
        }

        debug!("Device {} not cached, refreshing", path);
        if let Err(e) = self.cache.refresh().await {
            warn!("Device refresh failed: {}", e);
        }

        self.cache
            .get(path)
            .await
            .ok_or_else(|| BluetoothError::DeviceNotFound(path.to_string()))
    }

    async fn command_failed(&self, path: &str, err: BusError) -> BluetoothError {
        error!("Command on {} failed: {}", path, err);

        if err.is_stale() {
            // The handle outlived the object; drop it from the cache.
            match self.cache.refresh().await {
                Ok(_) if !self.cache.contains(path).await => {
                    return BluetoothError::DeviceNotFound(path.to_string());
                }
                Ok(_) => {}
                Err(e) => warn!("Device refresh failed: {}", e),
            }
        }

        BluetoothError::CommandFailed(err.to_string())
    }

    async fn settle_and_refresh(&self) {
        tokio::time::sleep(self.settle).await;
        if let Err(e) = self.cache.refresh().await {
            warn!("Device refresh after command failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, ADAPTER_PATH};

    const SPEAKER: &str = "/org/bluez/hci0/dev_11_22_33_44_55_66";

    fn manager(bus: &Arc<MockBus>) -> BluetoothManager<MockBus> {
        BluetoothManager::new(Arc::clone(bus), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_refreshes_exactly_once() {
        let bus = Arc::new(MockBus::with_adapter());
        let manager = manager(&bus);

        let err = manager.connect("/unknown").await.unwrap_err();

        assert!(matches!(err, BluetoothError::DeviceNotFound(ref p) if p == "/unknown"));
        assert_eq!(err.to_string(), "device not found: /unknown");
        assert_eq!(bus.count("GetManagedObjects"), 1);
        assert_eq!(bus.count("Connect"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_miss_is_recovered_by_refresh() {
        let bus = Arc::new(MockBus::with_adapter());
        let manager = manager(&bus);
        bus.add_device(SPEAKER, "Speaker");

        manager.pair(SPEAKER).await.unwrap();

        assert_eq!(bus.count("Pair"), 1);
        let device = manager.devices().await.pop().unwrap();
        assert_eq!(device.properties["Paired"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn command_refreshes_cache_after_settling() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);
        manager.refresh_devices().await.unwrap();
        bus.clear_calls();

        let before = tokio::time::Instant::now();
        manager.connect(SPEAKER).await.unwrap();

        assert!(before.elapsed() >= Duration::from_secs(1));
        assert_eq!(
            bus.calls(),
            vec![format!("Connect {}", SPEAKER), "GetManagedObjects".to_string()]
        );
        assert_eq!(manager.devices().await[0].properties["Connected"], true);

        manager.disconnect(SPEAKER).await.unwrap();
        assert_eq!(manager.devices().await[0].properties["Connected"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn bus_rejection_is_reported_with_message() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        bus.fail(
            "Connect",
            BusError::Failed("org.bluez.Error.Failed: br-connection-page-timeout".into()),
        );
        let manager = manager(&bus);

        let err = manager.connect(SPEAKER).await.unwrap_err();

        match err {
            BluetoothError::CommandFailed(msg) => {
                assert_eq!(msg, "org.bluez.Error.Failed: br-connection-page-timeout")
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(bus.count("Connect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_drops_device_from_cache() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);
        manager.refresh_devices().await.unwrap();

        bus.remove_object(SPEAKER);
        let err = manager.connect(SPEAKER).await.unwrap_err();

        assert!(matches!(err, BluetoothError::DeviceNotFound(_)));
        assert!(manager.devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_goes_through_adapter() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);

        manager.remove(SPEAKER).await.unwrap();

        assert_eq!(bus.count("RemoveDevice"), 1);
        assert!(manager.devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_without_adapter_is_adapter_unavailable() {
        let bus = Arc::new(MockBus::new());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);

        let err = manager.remove(SPEAKER).await.unwrap_err();

        assert!(matches!(err, BluetoothError::AdapterUnavailable));
        assert_eq!(bus.count("RemoveDevice"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_vanished_device_keeps_adapter_handle() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);
        manager.refresh_devices().await.unwrap();
        manager.discovery().adapter().await.unwrap();

        bus.remove_object(SPEAKER);
        bus.clear_calls();
        let err = manager.remove(SPEAKER).await.unwrap_err();
        assert!(matches!(err, BluetoothError::DeviceNotFound(_)));

        // One refresh for the vanished device, no adapter re-resolution.
        manager.discovery().adapter().await.unwrap();
        assert_eq!(bus.count("GetManagedObjects"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_on_vanished_adapter_reresolves_it() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        let manager = manager(&bus);
        manager.refresh_devices().await.unwrap();
        manager.discovery().adapter().await.unwrap();

        bus.remove_object(ADAPTER_PATH);
        bus.add_adapter("/org/bluez/hci1");
        let err = manager.remove(SPEAKER).await.unwrap_err();
        assert!(matches!(err, BluetoothError::CommandFailed(_)));

        assert_eq!(
            manager.discovery().adapter().await.unwrap().path,
            "/org/bluez/hci1"
        );
    }

    #[tokio::test]
    async fn adapter_properties_come_from_adapter_interface() {
        let bus = Arc::new(MockBus::with_adapter());
        let manager = manager(&bus);

        let props = manager.adapter_properties().await.unwrap();

        assert_eq!(props["Powered"], true);
        assert!(bus.calls().contains(&format!("GetAll {}", ADAPTER_PATH)));
    }

    #[tokio::test]
    async fn adapter_properties_without_adapter() {
        let manager = manager(&Arc::new(MockBus::new()));

        let err = manager.adapter_properties().await.unwrap_err();
        assert!(matches!(err, BluetoothError::AdapterUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_reports_devices_seen_after_discovery() {
        let bus = Arc::new(MockBus::with_adapter());
        bus.add_device(SPEAKER, "Speaker");
        bus.add_discoverable("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", "Headset");
        let manager = manager(&bus);

        assert_eq!(manager.scan(Duration::from_secs(5)).await.unwrap(), 2);
        assert_eq!(manager.devices().await.len(), 2);
    }
}
