//! HTTP surface of the red packet engine

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod api;
pub mod error;
pub mod handlers;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use packet_core::PacketEngine;
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

/// Per-request deadline
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PacketEngine>,
}

impl AppState {
    pub fn new(engine: Arc<PacketEngine>) -> Self {
        Self { engine }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/packets", post(handlers::create_packet))
        .route("/packets/:packet_id", get(handlers::get_packet))
        .route("/packets/:packet_id/claims", post(handlers::claim_packet))
        .route("/payments/callback", post(handlers::payment_callback))
        .route("/accounts/:account_id/balance", get(handlers::get_balance))
        .route("/accounts/:account_id/ledger", get(handlers::get_ledger))
        .route("/accounts/:account_id/coupons", get(handlers::get_coupons))
        .route(
            "/accounts/:account_id/invitations",
            get(handlers::get_invitation_credits),
        )
        .route(
            "/accounts/:account_id/notifications",
            get(handlers::get_notifications),
        )
        .route("/invitations", post(handlers::register_invitation))
        .route("/anomalies", get(handlers::list_anomalies))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(cors),
        )
        .with_state(state)
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if log_format == "pretty" {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}
