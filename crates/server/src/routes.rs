//! REST-style control API: `/api/vps/*`, `/api/images/*`, `/api/templates/*`, `/healthz`.

use axum::extract::{Query, State};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use vps_common::{Error, ServerConfig, VmRecord};
use vps_core::{Controller, CreateRequest};

use crate::auth::require_api_key;
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
}

pub fn build_router(controller: Arc<Controller>, config: Arc<ServerConfig>) -> Router {
    let state = AppState { controller };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/vps/create", post(create_vm))
        .route("/vps/list", get(list_vms))
        .route("/vps/get", get(get_vm))
        .route("/vps/progress", get(vm_progress))
        .route("/vps/delete", delete(delete_vm))
        .route("/vps/start", post(start_vm))
        .route("/vps/stop", post(stop_vm))
        .route("/vps/restart", post(restart_vm))
        .route("/vps/metrics", get(vm_metrics))
        .route("/images/list", get(list_images))
        .route("/templates/list", get(list_templates))
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(config.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    name: String,
    hostname: Option<String>,
    image_type: Option<String>,
    template: Option<String>,
}

async fn create_vm(
    State(state): State<AppState>,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Json(body): Json<CreateBody>,
) -> ApiResult<Json<VmRecord>> {
    if body.name.trim().is_empty() {
        return Err(ApiError(Error::InvalidInput("name must not be empty".into())));
    }
    let hostname = body
        .hostname
        .unwrap_or_else(|| format!("{}.vps.local", body.name));
    let image_id = body.image_type.unwrap_or_else(|| "ubuntu-22.04".to_string());
    let template_id = body.template.unwrap_or_else(|| "blank".to_string());
    let password = generate_password();

    let req = CreateRequest {
        client_addr: addr.ip().to_string(),
        name: body.name,
        hostname,
        image_id,
        template_id,
        password,
    };

    let record = state.controller.lifecycle.create(req)?;
    Ok(Json(record))
}

fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 12] = rng.gen();
    hex::encode(bytes)
}

async fn list_vms(State(state): State<AppState>) -> Json<Vec<VmRecord>> {
    Json(state.controller.lifecycle.list())
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: String,
}

async fn get_vm(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<Json<VmRecord>> {
    Ok(Json(state.controller.lifecycle.get(&q.id)?))
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    stage: String,
    progress: u8,
    status: String,
    error: Option<String>,
}

async fn vm_progress(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> ApiResult<Json<ProgressResponse>> {
    let record = state.controller.lifecycle.get(&q.id)?;
    Ok(Json(ProgressResponse {
        stage: record.stage.to_string(),
        progress: record.progress,
        status: record.status.to_string(),
        error: record.error_message,
    }))
}

async fn delete_vm(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<()> {
    state.controller.lifecycle.delete(&q.id).await?;
    Ok(())
}

async fn start_vm(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<()> {
    state.controller.lifecycle.start(&q.id).await?;
    Ok(())
}

async fn stop_vm(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<()> {
    state.controller.lifecycle.stop(&q.id).await?;
    Ok(())
}

async fn restart_vm(State(state): State<AppState>, Query(q): Query<IdQuery>) -> ApiResult<()> {
    state.controller.lifecycle.restart(&q.id).await?;
    Ok(())
}

async fn vm_metrics(
    State(state): State<AppState>,
    Query(q): Query<IdQuery>,
) -> ApiResult<Json<Vec<vps_common::ResourceSample>>> {
    state.controller.lifecycle.get(&q.id)?;
    Ok(Json(state.controller.lifecycle.metrics_history(&q.id)))
}

async fn list_images() -> Json<Vec<&'static str>> {
    Json(vps_core::image::known_sources().into_keys().collect())
}

#[derive(Debug, Deserialize)]
struct TemplatesQuery {
    os: Option<String>,
}

async fn list_templates(
    State(state): State<AppState>,
    Query(q): Query<TemplatesQuery>,
) -> Json<Vec<vps_common::Template>> {
    let mut templates = state.controller.lifecycle.templates();
    if let Some(os) = q.os {
        templates.retain(|t| t.compatible_image_ids.iter().any(|id| id.starts_with(&os)));
    }
    Json(templates)
}

