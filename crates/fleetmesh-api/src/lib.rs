pub mod handlers;
pub mod models;

use axum::{
    routing::{any, get, post},
    Router,
};
use fleetmesh_control::{EntitlementRegistry, ServerTailnet};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use url::Url;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<EntitlementRegistry>,
    pub tailnet: Arc<ServerTailnet>,
    /// Public URL of this deployment, shown in proxy errors
    pub access_url: Url,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleetmesh API",
        version = "0.1.0",
        description = "Control-plane API for replicas, licensing, workspace proxies and agent coordination"
    ),
    paths(
        handlers::health_check,
        handlers::get_entitlements,
        handlers::list_replicas,
        handlers::get_relay_map,
        handlers::list_workspace_proxies,
        handlers::create_workspace_proxy,
        handlers::register_workspace_proxy,
        handlers::deregister_workspace_proxy,
        handlers::delete_workspace_proxy,
        handlers::put_agent_node,
        handlers::get_agent_node,
        handlers::proxy_agent_app,
        handlers::get_template_schedule,
        handlers::put_template_schedule,
        handlers::commit_workspace_quota,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::ErrorResponse,
            models::ReplicaList,
            models::WorkspaceProxy,
            models::WorkspaceProxyList,
            models::CreateWorkspaceProxyRequest,
            models::RegisterWorkspaceProxyRequest,
            models::TemplateScheduleBody,
            models::QuotaCommitRequest,
            models::QuotaCommitResponse,
            fleetmesh_proto::Entitlements,
            fleetmesh_proto::Feature,
            fleetmesh_proto::FeatureName,
            fleetmesh_proto::Entitlement,
            fleetmesh_proto::Replica,
            fleetmesh_proto::RelayMap,
            fleetmesh_proto::RelayRegion,
            fleetmesh_proto::RelayNode,
            fleetmesh_proto::EdgeProxy,
            fleetmesh_proto::ProxyHealthStatus,
            fleetmesh_proto::Node,
        )
    ),
    tags(
        (name = "system", description = "System health endpoints"),
        (name = "licensing", description = "License entitlements"),
        (name = "replicas", description = "Replica set and relay topology"),
        (name = "workspace-proxies", description = "Workspace proxy registration"),
        (name = "agents", description = "Agent coordination and app proxying"),
        (name = "templates", description = "Template scheduling"),
        (name = "workspaces", description = "Workspace quota")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/v2/health", get(handlers::health_check))
            .route("/api/v2/entitlements", get(handlers::get_entitlements))
            .route("/api/v2/replicas", get(handlers::list_replicas))
            .route("/api/v2/relay-map", get(handlers::get_relay_map))
            .route(
                "/api/v2/workspaceproxies",
                get(handlers::list_workspace_proxies).post(handlers::create_workspace_proxy),
            )
            .route(
                "/api/v2/workspaceproxies/{id}",
                axum::routing::delete(handlers::delete_workspace_proxy),
            )
            .route(
                "/api/v2/workspaceproxies/{id}/register",
                post(handlers::register_workspace_proxy),
            )
            .route(
                "/api/v2/workspaceproxies/{id}/deregister",
                post(handlers::deregister_workspace_proxy),
            )
            .route(
                "/api/v2/agents/{id}/node",
                get(handlers::get_agent_node).put(handlers::put_agent_node),
            )
            .route(
                "/api/v2/agents/{id}/apps/{port}/{*path}",
                any(handlers::proxy_agent_app),
            )
            .route(
                "/api/v2/templates/{id}/schedule",
                get(handlers::get_template_schedule).put(handlers::put_template_schedule),
            )
            .route(
                "/api/v2/workspaces/{id}/quota",
                post(handlers::commit_workspace_quota),
            )
            .with_state(self.state.clone());

        Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/v2/openapi.json", ApiDoc::openapi()))
            .merge(api_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Starting API server on {}", listener.local_addr()?);
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v2/entitlements"));
        assert!(doc.paths.paths.contains_key("/api/v2/agents/{id}/node"));
    }
}
