use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    Json,
};
use chrono::Utc;
use fleetmesh_control::{
    AuditEvent, Auditor, BrokerError, ConnectionOrigin, ConnectivityGate, Coordinator,
    QuotaCommitter, QuotaRequest, Store, StoreError, TemplateScheduleStore,
};
use fleetmesh_proto::{EdgeProxy, Entitlements, FeatureName, Node, RelayMap};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound => api_error(StatusCode::NOT_FOUND, e.to_string(), "NOT_FOUND"),
        StoreError::Conflict(_) => api_error(StatusCode::CONFLICT, e.to_string(), "CONFLICT"),
        StoreError::Unavailable(_) => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            e.to_string(),
            "STORE_UNAVAILABLE",
        ),
    }
}

fn require_feature(state: &AppState, feature: FeatureName) -> Result<(), ApiError> {
    if state.registry.entitlements().enabled(feature) {
        return Ok(());
    }
    Err(api_error(
        StatusCode::FORBIDDEN,
        format!("{} is not enabled for your deployment.", feature.humanize()),
        "FEATURE_NOT_ENABLED",
    ))
}

fn audit(state: &AppState, action: &str, proxy: &EdgeProxy) {
    state
        .registry
        .capabilities()
        .auditor
        .load()
        .export(&AuditEvent::new(action, "workspace_proxy", proxy.id));
}

/// Health check
#[utoipa::path(
    get,
    path = "/api/v2/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let replicas = state.registry.replicas();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        replica_id: replicas.id(),
        replicas: replicas.all().len(),
    })
}

/// Current entitlement snapshot
#[utoipa::path(
    get,
    path = "/api/v2/entitlements",
    responses(
        (status = 200, description = "Entitlements", body = Entitlements)
    ),
    tag = "licensing"
)]
pub async fn get_entitlements(State(state): State<Arc<AppState>>) -> Json<Entitlements> {
    Json(state.registry.entitlements().as_ref().clone())
}

/// Live replicas
#[utoipa::path(
    get,
    path = "/api/v2/replicas",
    responses(
        (status = 200, description = "This replica and its live peers", body = ReplicaList)
    ),
    tag = "replicas"
)]
pub async fn list_replicas(State(state): State<Arc<AppState>>) -> Json<ReplicaList> {
    let replicas = state.registry.replicas();
    Json(ReplicaList {
        replicas: replicas.all(),
        primary: replicas.primary().id,
    })
}

/// Relay map clients should use
#[utoipa::path(
    get,
    path = "/api/v2/relay-map",
    responses(
        (status = 200, description = "Relay map including healthy proxy regions", body = RelayMap)
    ),
    tag = "replicas"
)]
pub async fn get_relay_map(State(state): State<Arc<AppState>>) -> Json<RelayMap> {
    Json(state.registry.relay_maps().current())
}

fn with_health(state: &AppState, proxy: EdgeProxy) -> WorkspaceProxy {
    match state.registry.proxy_health().health_status().get(&proxy.id) {
        Some(status) => WorkspaceProxy {
            status: status.status,
            report: status.report.clone(),
            checked_at: Some(status.checked_at),
            proxy,
        },
        None => WorkspaceProxy {
            status: Default::default(),
            report: vec![],
            checked_at: None,
            proxy,
        },
    }
}

async fn refresh_health(state: &AppState) {
    if let Err(e) = state.registry.proxy_health().force_update().await {
        warn!(error = %e, "Proxy health refresh failed");
    }
}

/// List workspace proxies
#[utoipa::path(
    get,
    path = "/api/v2/workspaceproxies",
    responses(
        (status = 200, description = "Workspace proxies", body = WorkspaceProxyList),
        (status = 403, description = "Workspace proxies are not enabled", body = ErrorResponse)
    ),
    tag = "workspace-proxies"
)]
pub async fn list_workspace_proxies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<WorkspaceProxyList>, ApiError> {
    require_feature(&state, FeatureName::WorkspaceProxy)?;

    let proxies: Vec<WorkspaceProxy> = state
        .registry
        .store()
        .edge_proxies()
        .await
        .map_err(store_error)?
        .into_iter()
        .map(|proxy| with_health(&state, proxy))
        .collect();
    let total = proxies.len();
    Ok(Json(WorkspaceProxyList { proxies, total }))
}

/// Create a workspace proxy record
#[utoipa::path(
    post,
    path = "/api/v2/workspaceproxies",
    request_body = CreateWorkspaceProxyRequest,
    responses(
        (status = 201, description = "Proxy created", body = WorkspaceProxy),
        (status = 400, description = "Invalid proxy name", body = ErrorResponse),
        (status = 403, description = "Workspace proxies are not enabled", body = ErrorResponse),
        (status = 409, description = "Name already in use", body = ErrorResponse)
    ),
    tag = "workspace-proxies"
)]
pub async fn create_workspace_proxy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkspaceProxyRequest>,
) -> Result<(StatusCode, Json<WorkspaceProxy>), ApiError> {
    require_feature(&state, FeatureName::WorkspaceProxy)?;

    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Proxy name must not be empty",
            "INVALID_NAME",
        ));
    }

    let now = Utc::now();
    let proxy = EdgeProxy {
        id: Uuid::new_v4(),
        display_name: req.display_name.unwrap_or_else(|| name.clone()),
        name,
        url: String::new(),
        region_id: req.region_id,
        relay_enabled: req.relay_enabled,
        deleted: false,
        created_at: now,
        updated_at: now,
    };
    state
        .registry
        .store()
        .upsert_edge_proxy(proxy.clone())
        .await
        .map_err(store_error)?;

    info!(proxy_id = %proxy.id, name = %proxy.name, "Workspace proxy created");
    audit(&state, "create", &proxy);
    Ok((StatusCode::CREATED, Json(with_health(&state, proxy))))
}

/// Register a proxy's public URL
#[utoipa::path(
    post,
    path = "/api/v2/workspaceproxies/{id}/register",
    params(
        ("id" = Uuid, Path, description = "Proxy ID")
    ),
    request_body = RegisterWorkspaceProxyRequest,
    responses(
        (status = 200, description = "Proxy registered and probed", body = WorkspaceProxy),
        (status = 400, description = "Invalid URL", body = ErrorResponse),
        (status = 403, description = "Workspace proxies are not enabled", body = ErrorResponse),
        (status = 404, description = "Proxy not found", body = ErrorResponse)
    ),
    tag = "workspace-proxies"
)]
pub async fn register_workspace_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RegisterWorkspaceProxyRequest>,
) -> Result<Json<WorkspaceProxy>, ApiError> {
    require_feature(&state, FeatureName::WorkspaceProxy)?;

    let url = Url::parse(&req.url)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid URL: {}", e), "INVALID_URL"))?;

    let store = state.registry.store();
    let mut proxy = store.edge_proxy(id).await.map_err(store_error)?;
    proxy.url = url.as_str().trim_end_matches('/').to_string();
    proxy.updated_at = Utc::now();
    store
        .upsert_edge_proxy(proxy.clone())
        .await
        .map_err(store_error)?;

    info!(proxy_id = %id, url = %proxy.url, "Workspace proxy registered");
    audit(&state, "register", &proxy);
    refresh_health(&state).await;
    Ok(Json(with_health(&state, proxy)))
}

/// Clear a proxy's public URL
#[utoipa::path(
    post,
    path = "/api/v2/workspaceproxies/{id}/deregister",
    params(
        ("id" = Uuid, Path, description = "Proxy ID")
    ),
    responses(
        (status = 200, description = "Proxy deregistered", body = WorkspaceProxy),
        (status = 403, description = "Workspace proxies are not enabled", body = ErrorResponse),
        (status = 404, description = "Proxy not found", body = ErrorResponse)
    ),
    tag = "workspace-proxies"
)]
pub async fn deregister_workspace_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkspaceProxy>, ApiError> {
    require_feature(&state, FeatureName::WorkspaceProxy)?;

    let store = state.registry.store();
    let mut proxy = store.edge_proxy(id).await.map_err(store_error)?;
    proxy.url = String::new();
    proxy.updated_at = Utc::now();
    store
        .upsert_edge_proxy(proxy.clone())
        .await
        .map_err(store_error)?;

    info!(proxy_id = %id, "Workspace proxy deregistered");
    audit(&state, "deregister", &proxy);
    refresh_health(&state).await;
    Ok(Json(with_health(&state, proxy)))
}

/// Delete a workspace proxy
#[utoipa::path(
    delete,
    path = "/api/v2/workspaceproxies/{id}",
    params(
        ("id" = Uuid, Path, description = "Proxy ID")
    ),
    responses(
        (status = 204, description = "Proxy deleted"),
        (status = 403, description = "Workspace proxies are not enabled", body = ErrorResponse),
        (status = 404, description = "Proxy not found", body = ErrorResponse)
    ),
    tag = "workspace-proxies"
)]
pub async fn delete_workspace_proxy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_feature(&state, FeatureName::WorkspaceProxy)?;

    let store = state.registry.store();
    let proxy = store.edge_proxy(id).await.map_err(store_error)?;
    store.delete_edge_proxy(id).await.map_err(store_error)?;

    info!(proxy_id = %id, "Workspace proxy deleted");
    audit(&state, "delete", &proxy);
    refresh_health(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Publish an agent's network identity
#[utoipa::path(
    put,
    path = "/api/v2/agents/{id}/node",
    params(
        ("id" = Uuid, Path, description = "Agent ID")
    ),
    request_body = Node,
    responses(
        (status = 204, description = "Node accepted"),
        (status = 400, description = "Node belongs to another agent", body = ErrorResponse),
        (status = 503, description = "Coordinator unavailable", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn put_agent_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(node): Json<Node>,
) -> Result<StatusCode, ApiError> {
    if node.agent_id != id {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Node is for agent {}, not {}", node.agent_id, id),
            "AGENT_MISMATCH",
        ));
    }

    let coordinator = state.registry.capabilities().coordinator.load();
    coordinator.update_node(node).await.map_err(|e| {
        warn!(agent_id = %id, error = %e, "Failed to publish agent node");
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            e.to_string(),
            "COORDINATOR_UNAVAILABLE",
        )
    })?;
    debug!(agent_id = %id, coordinator = coordinator.kind(), "Agent node updated");
    Ok(StatusCode::NO_CONTENT)
}

/// Look up an agent's network identity
#[utoipa::path(
    get,
    path = "/api/v2/agents/{id}/node",
    params(
        ("id" = Uuid, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Agent node", body = Node),
        (status = 404, description = "Agent has not reported a node", body = ErrorResponse),
        (status = 409, description = "Connection type not allowed", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn get_agent_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Node>, ApiError> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let capabilities = state.registry.capabilities();
    capabilities
        .gate
        .load()
        .admit(ConnectionOrigin::from_user_agent(user_agent))
        .map_err(|e| api_error(StatusCode::CONFLICT, e.to_string(), "CONNECTION_BLOCKED"))?;

    capabilities
        .coordinator
        .load()
        .node(id)
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("Agent {} has not reported a node", id),
                "AGENT_NOT_FOUND",
            )
        })
}

/// Proxy an HTTP request to a port on the agent
#[utoipa::path(
    get,
    path = "/api/v2/agents/{id}/apps/{port}/{path}",
    params(
        ("id" = Uuid, Path, description = "Agent ID"),
        ("port" = u16, Path, description = "Port the app listens on inside the workspace"),
        ("path" = String, Path, description = "Path forwarded to the app")
    ),
    responses(
        (status = 200, description = "Response from the app"),
        (status = 502, description = "Agent unreachable", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn proxy_agent_app(
    State(state): State<Arc<AppState>>,
    Path((id, port, path)): Path<(Uuid, u16, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let target = Url::parse(&format!("http://127.0.0.1:{}/", port))
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_PORT"))?;

    let (proxy, lease) = state
        .tailnet
        .reverse_proxy(target, state.access_url.clone(), id)
        .await
        .map_err(|e| {
            let status = match e {
                BrokerError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            api_error(status, e.to_string(), "AGENT_UNREACHABLE")
        })?;

    let (mut parts, body) = request.into_parts();
    let forwarded = match parts.uri.query() {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };
    parts.uri = forwarded
        .parse::<Uri>()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_PATH"))?;

    let response = proxy.serve(Request::from_parts(parts, body)).await;

    // The lease rides along with the body so the connection stays cached
    // until the client has read everything
    let (parts, body) = response.into_parts();
    let body = Body::from_stream(body.into_data_stream().map(move |chunk| {
        let _held = &lease;
        chunk
    }));
    Ok(Response::from_parts(parts, body))
}

/// Current schedule for a template
#[utoipa::path(
    get,
    path = "/api/v2/templates/{id}/schedule",
    params(
        ("id" = Uuid, Path, description = "Template ID")
    ),
    responses(
        (status = 200, description = "Template schedule", body = TemplateScheduleBody)
    ),
    tag = "templates"
)]
pub async fn get_template_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TemplateScheduleBody>, ApiError> {
    let schedules = state.registry.capabilities().schedules.load();
    let schedule = schedules.get(id).await.map_err(store_error)?;
    Ok(Json(schedule.into()))
}

/// Replace a template's schedule. Without advanced scheduling only the
/// default TTL is kept.
#[utoipa::path(
    put,
    path = "/api/v2/templates/{id}/schedule",
    params(
        ("id" = Uuid, Path, description = "Template ID")
    ),
    request_body = TemplateScheduleBody,
    responses(
        (status = 200, description = "Schedule as stored", body = TemplateScheduleBody)
    ),
    tag = "templates"
)]
pub async fn put_template_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TemplateScheduleBody>,
) -> Result<Json<TemplateScheduleBody>, ApiError> {
    let schedules = state.registry.capabilities().schedules.load();
    let stored = schedules.set(id, body.into()).await.map_err(store_error)?;
    debug!(template_id = %id, store = schedules.kind(), "Template schedule updated");
    Ok(Json(stored.into()))
}

/// Charge a workspace build against its owner's quota
#[utoipa::path(
    post,
    path = "/api/v2/workspaces/{id}/quota",
    params(
        ("id" = Uuid, Path, description = "Workspace ID")
    ),
    request_body = QuotaCommitRequest,
    responses(
        (status = 200, description = "Build permitted", body = QuotaCommitResponse),
        (status = 403, description = "Quota exceeded", body = ErrorResponse)
    ),
    tag = "workspaces"
)]
pub async fn commit_workspace_quota(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuotaCommitRequest>,
) -> Result<Json<QuotaCommitResponse>, ApiError> {
    let committer = state.registry.capabilities().quota.load();
    let decision = committer
        .commit(&QuotaRequest {
            user_id: req.user_id,
            workspace_id: id,
            daily_cost: req.daily_cost,
        })
        .await
        .map_err(|e| {
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                e.to_string(),
                "QUOTA_UNAVAILABLE",
            )
        })?;

    if !decision.permitted {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            format!(
                "Insufficient quota: {} credits needed, {} allowed",
                decision.credits_consumed, decision.budget
            ),
            "QUOTA_EXCEEDED",
        ));
    }
    Ok(Json(decision.into()))
}
