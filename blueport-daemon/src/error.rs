use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error)]
pub enum BluetoothError {
    /// No adapter object could be resolved on the bus.
    #[error("adapter unavailable")]
    AdapterUnavailable,

    /// Device path absent from the cache even after a refresh.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The bus rejected a command; carries the bus message.
    #[error("{0}")]
    CommandFailed(String),

    #[error("discovery already in progress")]
    AlreadyDiscovering,

    /// Enumeration failed. Recoverable: callers log it and carry on with the
    /// previous cache contents.
    #[error("bus enumeration failed: {0}")]
    TransientBus(String),
}

impl BluetoothError {
    pub fn transient(err: BusError) -> Self {
        BluetoothError::TransientBus(err.to_string())
    }
}
