//! Router configuration.

use std::any::Any;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::bus::BluetoothBus;
use crate::config::ServerConfig;

use super::handlers;
use super::{ApiError, ApiState};

/// Builds the API router.
///
/// - `GET  /api/v1/adapter` - adapter properties
/// - `GET  /api/v1/devices` - known devices
/// - `POST /api/v1/devices/scan` - on-demand discovery
/// - `POST /api/v1/devices/{connect,disconnect,pair,remove}` - device commands
/// - `GET  /api/v1/status` - liveness
pub fn create_router<B>(state: ApiState<B>, server: &ServerConfig) -> Router
where
    B: BluetoothBus + 'static,
{
    Router::new()
        .route("/api/v1/adapter", get(handlers::get_adapter::<B>))
        .route("/api/v1/devices", get(handlers::list_devices::<B>))
        .route("/api/v1/devices/scan", post(handlers::scan_devices::<B>))
        .route("/api/v1/devices/connect", post(handlers::connect_device::<B>))
        .route(
            "/api/v1/devices/disconnect",
            post(handlers::disconnect_device::<B>),
        )
        .route("/api/v1/devices/pair", post(handlers::pair_device::<B>))
        .route("/api/v1/devices/remove", post(handlers::remove_device::<B>))
        .route("/api/v1/status", get(handlers::status))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&server.cors_origins))
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(Arc::new(state))
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(AnyOrigin)
            .allow_methods(AnyOrigin)
            .allow_headers(AnyOrigin)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(AnyOrigin)
            .allow_headers(AnyOrigin)
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "internal server error".to_string()
    };

    ApiError::Internal(message).into_response()
}
