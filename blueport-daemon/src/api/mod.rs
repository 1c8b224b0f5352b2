/*!
 * HTTP API
 * JSON facade over the Bluetooth manager
 */

pub mod error;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::bluetooth::BluetoothManager;
use crate::config::ScanConfig;

pub use error::ApiError;
pub use routes::create_router;

/// Shared state handed to every request handler.
pub struct ApiState<B> {
    pub manager: Arc<BluetoothManager<B>>,
    pub scan: ScanConfig,
}

impl<B> ApiState<B> {
    pub fn new(manager: Arc<BluetoothManager<B>>, scan: ScanConfig) -> Self {
        Self { manager, scan }
    }
}
