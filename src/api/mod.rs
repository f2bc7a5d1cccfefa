use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tracing::{debug, info};

use crate::manager::LabManager;
use error::{ApiResult, HttpError};

mod error;

pub type SharedManager = Arc<Mutex<LabManager>>;

pub fn router(manager: SharedManager) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/library", get(library))
        .route("/topology", get(topology))
        .route("/spawn", post(spawn))
        .route("/kill/{run_id}", post(kill))
        .route("/reset_lab", post(reset_lab))
        .layer(ServiceBuilder::new().layer(Extension(manager)))
}

pub async fn serve(manager: SharedManager, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, router(manager)).await?;
    Ok(())
}

async fn ping() -> impl IntoResponse {
    ""
}

// list the firmware library
async fn library(Extension(manager): Extension<SharedManager>) -> ApiResult<impl IntoResponse> {
    let manager = manager.lock().await;
    Ok(Json(manager.library().scan()))
}

// list running instances, lease-refreshed first
async fn topology(Extension(manager): Extension<SharedManager>) -> ApiResult<impl IntoResponse> {
    let mut manager = manager.lock().await;
    manager.refresh_ips();
    Ok(Json(manager.topology()))
}

#[derive(Default, Deserialize)]
struct SpawnRequest {
    firmware_id: Option<String>,
}

// boot a new instance
async fn spawn(
    Extension(manager): Extension<SharedManager>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    // tolerate an empty or malformed body; only the field matters
    let request: SpawnRequest = serde_json::from_slice(&body).unwrap_or_default();
    let firmware_id = request.firmware_id.ok_or(HttpError::MissingFirmwareId)?;
    debug!("spawn {}", firmware_id);

    let run_id = manager.lock().await.spawn(&firmware_id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "run_id": run_id }))))
}

// stop one instance
async fn kill(
    Extension(manager): Extension<SharedManager>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    debug!("kill {}", run_id);
    if manager.lock().await.stop(&run_id).await {
        Ok(Json(json!({ "status": "stopped", "run_id": run_id })))
    } else {
        Err(HttpError::UnknownInstance(run_id).into())
    }
}

// stop everything
async fn reset_lab(Extension(manager): Extension<SharedManager>) -> ApiResult<impl IntoResponse> {
    let stopped = manager.lock().await.reset().await;
    info!("lab reset, stopped {}", stopped);
    Ok(Json(json!({ "status": "reset", "stopped": stopped })))
}
