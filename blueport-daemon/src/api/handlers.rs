//! Request handlers for the `/api/v1` routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::bus::{BluetoothBus, Properties};
use crate::cache::DeviceRecord;
use crate::error::BluetoothError;

use super::{ApiError, ApiState};

type SharedState<B> = State<Arc<ApiState<B>>>;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub status: &'static str,
    pub devices_found: usize,
}

pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { status: "OK" })
}

pub async fn get_adapter<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
) -> Result<Json<Properties>, ApiError> {
    state
        .manager
        .adapter_properties()
        .await
        .map(Json)
        .map_err(|_| ApiError::AdapterUnavailable)
}

/// Lists devices after a best-effort refresh; stale contents are served if
/// the bus cannot be enumerated.
pub async fn list_devices<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
) -> Json<DevicesResponse> {
    if let Err(e) = state.manager.refresh_devices().await {
        tracing::warn!("Serving cached devices: {}", e);
    }

    Json(DevicesResponse {
        devices: state.manager.devices().await,
    })
}

pub async fn scan_devices<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
    body: Bytes,
) -> Result<Json<ScanResponse>, ApiError> {
    let body = parse_object(&body)?;
    let limits = &state.scan;

    let duration = match body.get("duration") {
        None | Some(Value::Null) => limits.default_duration_secs,
        Some(value) => value
            .as_u64()
            .filter(|secs| (limits.min_duration_secs..=limits.max_duration_secs).contains(secs))
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "duration must be an integer between {} and {} seconds",
                    limits.min_duration_secs, limits.max_duration_secs
                ))
            })?,
    };

    tracing::debug!("On-demand scan requested for {}s", duration);
    let devices_found = state
        .manager
        .scan(Duration::from_secs(duration))
        .await
        .map_err(ApiError::scan)?;

    Ok(Json(ScanResponse {
        status: "success",
        devices_found,
    }))
}

pub async fn connect_device<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let path = device_path(&body)?;
    finish(state.manager.connect(&path).await, "connected")
}

pub async fn disconnect_device<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let path = device_path(&body)?;
    finish(state.manager.disconnect(&path).await, "disconnected")
}

pub async fn pair_device<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let path = device_path(&body)?;
    finish(state.manager.pair(&path).await, "paired")
}

pub async fn remove_device<B: BluetoothBus + 'static>(
    State(state): SharedState<B>,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let path = device_path(&body)?;
    finish(state.manager.remove(&path).await, "removed")
}

fn finish(
    result: Result<(), BluetoothError>,
    status: &'static str,
) -> Result<Json<StatusResponse>, ApiError> {
    result
        .map(|()| Json(StatusResponse { status }))
        .map_err(ApiError::device)
}

/// An empty body reads as `{}`.
fn parse_object(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::BadRequest(
            "request body must be a JSON object".to_string(),
        )),
        Err(e) => Err(ApiError::BadRequest(format!("invalid JSON body: {}", e))),
    }
}

fn device_path(body: &[u8]) -> Result<String, ApiError> {
    parse_object(body)?
        .get("device_path")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::BadRequest("device_path is required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_empty_object() {
        assert!(parse_object(b"").unwrap().is_empty());
        assert!(parse_object(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(matches!(parse_object(b"[1,2]"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_object(b"{oops"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn device_path_must_be_non_empty_string() {
        assert_eq!(
            device_path(br#"{"device_path":"/org/bluez/hci0/dev_X"}"#).unwrap(),
            "/org/bluez/hci0/dev_X"
        );
        assert!(device_path(br#"{"device_path":""}"#).is_err());
        assert!(device_path(br#"{"device_path":42}"#).is_err());
        assert!(device_path(b"{}").is_err());
    }
}
