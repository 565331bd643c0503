mod batch_ops;
mod call_flow;
mod db_types;
mod error;
mod handlers;
mod state_machine;
mod targeting;
mod tasks;
mod twilio_types;
mod types;
mod utils;

use crate::call_flow::CallFlowRegistry;
use crate::types::{AppState, ProviderClient};

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const AUDIO_CONTENT_TYPES: &[&str] = &["audio/mpeg", "audio/mp3", "audio/wav"];
    pub const MAX_AUDIO_BYTES: i64 = 10 * 1024 * 1024;
    pub const BATCH_OPERATION_SWEEP_SECS: u64 = 30;
    pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.twilio.com";
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("sqlx", tracing_subscriber::filter::LevelFilter::WARN),
            ("callout_engine", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL not set!");
    let provider_base_url = env::var("PROVIDER_BASE_URL")
        .unwrap_or_else(|_| consts::DEFAULT_PROVIDER_BASE_URL.to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(3000);

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let http_client = reqwest::Client::new();
    let (batch_op_tx, batch_op_rx) = mpsc::channel(64);

    let app_state = Arc::new(AppState {
        db_pool,
        provider: ProviderClient::new(provider_base_url, http_client),
        call_flows: CallFlowRegistry::with_builtin_flows(),
        batch_op_notifier: batch_op_tx,
    });

    tokio::spawn(tasks::run_batch_operations(app_state.clone(), batch_op_rx));

    let app = Router::new()
        .route("/api/callouts", post(handlers::create_callout))
        .route(
            "/api/callouts/:id",
            get(handlers::show_callout).delete(handlers::delete_callout),
        )
        .route(
            "/api/callouts/:id/callout_events",
            post(handlers::create_callout_event),
        )
        .route(
            "/api/callout_participations",
            post(handlers::create_callout_participation),
        )
        .route(
            "/api/callout_participations/:id",
            axum::routing::delete(handlers::delete_callout_participation),
        )
        .route(
            "/api/batch_operations",
            post(handlers::create_batch_operation),
        )
        .route(
            "/api/batch_operations/:id",
            get(handlers::show_batch_operation),
        )
        .route(
            "/api/batch_operations/:id/batch_operation_events",
            post(handlers::create_batch_operation_event),
        )
        .route(
            "/api/batch_operations/:id/preview",
            get(handlers::preview_batch_operation),
        )
        .route(
            "/api/remote_phone_call_events",
            post(handlers::create_remote_phone_call_event),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
