/*!
 * Device Cache
 * Last known BlueZ device objects, rebuilt wholesale on every refresh
 */

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::bus::{BluetoothBus, Properties, DEVICE_INTERFACE};
use crate::error::BluetoothError;

/// A device as last seen on the bus. Commands are issued through the shared
/// bus client using `path`, which stays valid while the object is enumerable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub path: String,
    pub properties: Properties,
}

type DeviceMap = BTreeMap<String, DeviceRecord>;

pub struct DeviceCache<B> {
    bus: Arc<B>,
    devices: RwLock<Arc<DeviceMap>>,
    refresh_lock: Mutex<()>,
}

impl<B: BluetoothBus> DeviceCache<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            devices: RwLock::new(Arc::new(DeviceMap::new())),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Re-enumerates the bus and replaces the cache with what it reports.
    /// On failure the previous contents are kept untouched.
    pub async fn refresh(&self) -> Result<usize, BluetoothError> {
        let _serialized = self.refresh_lock.lock().await;

        let objects = self
            .bus
            .managed_objects()
            .await
            .map_err(BluetoothError::transient)?;

        let devices: DeviceMap = objects
            .into_iter()
            .filter_map(|(path, mut interfaces)| {
                let properties = interfaces.remove(DEVICE_INTERFACE)?;
                Some((path.clone(), DeviceRecord { path, properties }))
            })
            .collect();

        let count = devices.len();
        *self.devices.write().await = Arc::new(devices);

        tracing::debug!("Device cache refreshed: {} devices", count);
        Ok(count)
    }

    async fn snapshot(&self) -> Arc<DeviceMap> {
        Arc::clone(&*self.devices.read().await)
    }

    pub async fn get(&self, path: &str) -> Option<DeviceRecord> {
        self.snapshot().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.snapshot().await.contains_key(path)
    }

    pub async fn all(&self) -> Vec<DeviceRecord> {
        self.snapshot().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }
}
