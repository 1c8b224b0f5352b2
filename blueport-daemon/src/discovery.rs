/*!
 * Discovery Controller
 * One discovery session at a time against the active adapter
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{find_adapter, BluetoothBus, BusError};
use crate::error::BluetoothError;

/// The adapter object currently in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub path: String,
}

pub struct DiscoveryController<B> {
    bus: Arc<B>,
    adapter: Mutex<Option<AdapterHandle>>,
    discovering: Arc<AtomicBool>,
}

/// Clears the in-progress flag however the session ends.
struct SessionGuard(Arc<AtomicBool>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: BluetoothBus + 'static> DiscoveryController<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            adapter: Mutex::new(None),
            discovering: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    /// Returns the cached adapter, resolving it from the bus if needed.
    pub async fn adapter(&self) -> Result<AdapterHandle, BluetoothError> {
        let mut slot = self.adapter.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let objects = self.bus.managed_objects().await.map_err(|e| {
            warn!("Failed to enumerate BlueZ objects: {}", e);
            BluetoothError::AdapterUnavailable
        })?;

        let Some(path) = find_adapter(&objects) else {
            warn!("No Bluetooth adapter found");
            return Err(BluetoothError::AdapterUnavailable);
        };

        info!("Using Bluetooth adapter {}", path);
        let handle = AdapterHandle { path };
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Forget the adapter so the next call resolves it again.
    pub async fn invalidate_adapter(&self) {
        if let Some(handle) = self.adapter.lock().await.take() {
            debug!("Dropping stale adapter handle {}", handle.path);
        }
    }

    /// Invalidates the adapter handle when `err` says the adapter object is gone.
    pub async fn note_bus_error(&self, err: &BusError) {
        if err.is_callee_gone() {
            self.invalidate_adapter().await;
        }
    }

    /// Runs a discovery session for `duration`. Rejects immediately if one is
    /// already running. The in-progress flag is always clear on return.
    pub async fn start_discovery(&self, duration: Duration) -> Result<(), BluetoothError> {
        if self.is_discovering() {
            info!("Discovery already in progress");
            return Err(BluetoothError::AlreadyDiscovering);
        }

        let adapter = self.adapter().await?;

        if self
            .discovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Discovery already in progress");
            return Err(BluetoothError::AlreadyDiscovering);
        }
        let guard = SessionGuard(Arc::clone(&self.discovering));

        // Detached so a dropped caller cannot leave the radio scanning.
        let bus = Arc::clone(&self.bus);
        let session = tokio::spawn(async move {
            let _guard = guard;
            run_session(bus.as_ref(), &adapter.path, duration).await
        });

        match session.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.note_bus_error(&err).await;
                Err(BluetoothError::CommandFailed(err.to_string()))
            }
            Err(join_err) => Err(BluetoothError::CommandFailed(format!(
                "discovery session aborted: {}",
                join_err
            ))),
        }
    }

    /// Best-effort stop of a running session, used on shutdown.
    pub async fn abort_discovery(&self) {
        if !self.is_discovering() {
            return;
        }
        let Some(adapter) = self.adapter.lock().await.clone() else {
            return;
        };

        match self.bus.stop_discovery(&adapter.path).await {
            Ok(()) => info!("Stopped discovery on {}", adapter.path),
            Err(e) => warn!("Failed to stop discovery on {}: {}", adapter.path, e),
        }
    }
}

async fn run_session<B: BluetoothBus>(
    bus: &B,
    adapter: &str,
    duration: Duration,
) -> Result<(), BusError> {
    let session_id = Uuid::new_v4();
    info!(
        session = %session_id,
        adapter,
        "Starting device discovery for {}s",
        duration.as_secs()
    );

    let started = bus.start_discovery(adapter).await;
    match &started {
        Ok(()) => tokio::time::sleep(duration).await,
        Err(e) => warn!(session = %session_id, "StartDiscovery failed: {}", e),
    }

    // Always issued, even when starting failed.
    let stopped = bus.stop_discovery(adapter).await;
    match &stopped {
        Ok(()) => info!(session = %session_id, "Device discovery finished"),
        Err(e) => warn!(session = %session_id, "StopDiscovery failed: {}", e),
    }

    started.and(stopped)
}
