//! HTTP adapter: principal extraction, pipeline-dispatched routes, and
//! mapping of pipeline outcomes to responses.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderName, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tower_http::trace::TraceLayer;

use crate::authz::provider::GrantProvider;
use crate::authz::types::{CheckRequest, CheckResponse, GrantSet};
use crate::errors::AppError;
use crate::operations::{
    CheckPermission, GetPrincipalGrants, MyPermissions, ReloadGrants, ReloadSummary,
};
use crate::pipeline::{DeclarationInfo, Pipeline, PipelineError, RequestContext};
use crate::settings::Settings;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub provider: Arc<dyn GrantProvider>,
    pub principal_header: HeaderName,
}

impl AppState {
    pub fn new(
        pipeline: Pipeline,
        provider: Arc<dyn GrantProvider>,
        principal_header: &str,
    ) -> Result<Self, AppError> {
        let principal_header = HeaderName::try_from(principal_header)
            .map_err(|_| AppError::BadHeader(principal_header.to_string()))?;
        Ok(Self {
            pipeline,
            provider,
            principal_header,
        })
    }
}

/// Resolve the caller's grant snapshot and attach a `RequestContext`.
///
/// A missing header yields an anonymous context; protected operations then
/// deny it in the pipeline.
async fn authenticate(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let principal_id = request
        .headers()
        .get(&state.principal_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let ctx = match principal_id {
        None => RequestContext::anonymous(),
        Some(id) => match state.provider.grants_for(&id).await {
            Ok(grants) => RequestContext::authenticated(id, grants.unwrap_or_default()),
            Err(e) => {
                tracing::error!(principal = %id, error = %e, "grant lookup failed");
                return e.into_response();
            }
        },
    };

    request.extensions_mut().insert(ctx);
    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/check", post(check))
        .route("/v1/me/permissions", get(my_permissions))
        .route("/v1/principals/{id}/permissions", get(principal_permissions))
        .route("/v1/admin/grants/reload", post(reload_grants))
        .route("/v1/operations", get(list_operations))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn check(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, PipelineError> {
    let op = CheckPermission {
        principal: req.principal,
        policy_key: req.policy_key,
    };
    state.pipeline.dispatch(op, &ctx).await.map(Json)
}

async fn my_permissions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<GrantSet>, PipelineError> {
    state.pipeline.dispatch(MyPermissions, &ctx).await.map(Json)
}

async fn principal_permissions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Result<Json<GrantSet>, PipelineError> {
    let op = GetPrincipalGrants { principal_id: id };
    state.pipeline.dispatch(op, &ctx).await.map(Json)
}

async fn reload_grants(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<ReloadSummary>, PipelineError> {
    state.pipeline.dispatch(ReloadGrants, &ctx).await.map(Json)
}

async fn list_operations(State(state): State<AppState>) -> Json<Vec<DeclarationInfo>> {
    Json(state.pipeline.declarations())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn serve(settings: &Settings, state: AppState) -> Result<(), AppError> {
    let addr: SocketAddr = settings
        .listen_addr()
        .parse()
        .map_err(|_| AppError::BadAddress(settings.listen_addr()))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Authorization service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
