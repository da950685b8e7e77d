// src/routes/health.rs

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResp {
    pub status: &'static str,
    pub version: &'static str,
    pub scheduler: bool,
    pub notifier: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        scheduler: state.config.scheduler.enabled,
        notifier: state.notifier.channel_name().to_string(),
    })
}
