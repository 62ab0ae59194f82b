//! fleetmeshd - control-plane replica daemon
//!
//! Runs one replica: replica registration, license entitlements, workspace
//! proxy health, the relay mesh and the agent connection broker, all behind
//! the HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use fleetmesh_api::{ApiServer, ApiServerConfig, AppState};
use fleetmesh_control::{
    Collaborators, ControlOptions, EntitlementRegistry, EphemeralLegacyConns, LicenseKeys,
    MemoryPubsub, MemoryStore, ProxyHealthOptions, ReplicaOptions, ServerTailnet, Store,
    TailnetOptions,
};
use fleetmesh_proto::{RegionId, RelayMap, RelayNode, RelayRegion};
use fleetmesh_transport::{DirectDialer, TcpRelayLinker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;
use uuid::Uuid;

/// Fleetmesh control-plane replica
#[derive(Parser, Debug)]
#[command(name = "fleetmeshd")]
#[command(about = "Fleetmesh control-plane replica daemon", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("FLEETMESH_GIT_HASH"), "\nBuilt: ", env!("FLEETMESH_BUILD_TIME")))]
struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, env = "FLEETMESH_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Public URL of the deployment
    #[arg(long, env = "FLEETMESH_ACCESS_URL", default_value = "http://127.0.0.1:3000")]
    access_url: Url,

    /// Relay URL peer replicas mesh with; leave empty to run without high availability
    #[arg(long, env = "FLEETMESH_RELAY_ADDRESS", default_value = "")]
    relay_address: String,

    /// Relay region this replica serves
    #[arg(long, env = "FLEETMESH_REGION_ID", default_value_t = 1)]
    region_id: RegionId,

    /// JSON file with the relay map; defaults to one embedded region at the access URL
    #[arg(long, env = "FLEETMESH_RELAY_MAP")]
    relay_map: Option<PathBuf>,

    /// License verification key as KID=SECRET (repeatable)
    #[arg(long = "license-key", env = "FLEETMESH_LICENSE_KEYS", value_delimiter = ',')]
    license_keys: Vec<String>,

    /// License JWT to load at startup (repeatable)
    #[arg(long = "license", env = "FLEETMESH_LICENSES", value_delimiter = ',')]
    licenses: Vec<String>,

    /// Report telemetry; some licenses require it
    #[arg(long, env = "FLEETMESH_TELEMETRY", default_value_t = true, action = clap::ArgAction::Set)]
    telemetry: bool,

    /// Export audit events when licensed
    #[arg(long, env = "FLEETMESH_AUDIT_LOGGING", default_value_t = true, action = clap::ArgAction::Set)]
    audit_logging: bool,

    /// Only admit browser connections when licensed
    #[arg(long, env = "FLEETMESH_BROWSER_ONLY")]
    browser_only: bool,

    /// Enforce template roles and quotas when licensed
    #[arg(long, env = "FLEETMESH_USER_ROLE_MANAGEMENT", default_value_t = true, action = clap::ArgAction::Set)]
    user_role_management: bool,

    /// SCIM API key; setting one enables SCIM
    #[arg(long, env = "FLEETMESH_SCIM_API_KEY", default_value = "")]
    scim_api_key: String,

    /// Number of configured git auth providers
    #[arg(long, env = "FLEETMESH_GIT_AUTH_PROVIDERS", default_value_t = 0)]
    git_auth_providers: usize,

    /// Seconds between license resyncs
    #[arg(long, env = "FLEETMESH_ENTITLEMENTS_INTERVAL", default_value_t = 600)]
    entitlements_interval: u64,

    /// Seconds between workspace proxy health probes
    #[arg(long, env = "FLEETMESH_PROXY_HEALTH_INTERVAL", default_value_t = 60)]
    proxy_health_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { "debug" } else { "info" })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("FLEETMESH_GIT_HASH"),
        built = env!("FLEETMESH_BUILD_TIME"),
        "Starting fleetmeshd"
    );

    let relay_map = match &cli.relay_map {
        Some(path) => load_relay_map(path)?,
        None => embedded_relay_map(&cli.access_url),
    };
    let license_keys = LicenseKeys::parse(cli.license_keys.iter().map(String::as_str))
        .context("Invalid --license-key")?;
    if license_keys.is_empty() && !cli.licenses.is_empty() {
        warn!("Licenses supplied without any license keys; they will be reported as invalid");
    }

    let store = Arc::new(MemoryStore::new());
    for jwt in &cli.licenses {
        store
            .insert_license(jwt.clone())
            .await
            .context("Failed to store license")?;
    }
    let pubsub = Arc::new(MemoryPubsub::new());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    let options = ControlOptions {
        replica: ReplicaOptions {
            id: Uuid::new_v4(),
            hostname,
            relay_address: cli.relay_address.clone(),
            region_id: cli.region_id,
            ..Default::default()
        },
        relay_map,
        license_keys,
        entitlements_interval: Duration::from_secs(cli.entitlements_interval),
        proxy_health: ProxyHealthOptions {
            interval: Duration::from_secs(cli.proxy_health_interval),
            ..Default::default()
        },
        telemetry_enabled: cli.telemetry,
        audit_logging: cli.audit_logging,
        browser_only: cli.browser_only,
        user_role_management: cli.user_role_management,
        scim_enabled: !cli.scim_api_key.is_empty(),
        git_auth_providers: cli.git_auth_providers,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let registry = EntitlementRegistry::new(
        options,
        Collaborators::new(store, pubsub, Arc::new(TcpRelayLinker::default())),
        cancel.child_token(),
    )
    .context("Failed to build entitlement registry")?;
    registry
        .start()
        .await
        .context("Failed to start entitlement registry")?;

    let dialer = Arc::new(DirectDialer::default());
    let tailnet = ServerTailnet::new(
        Arc::clone(&registry.capabilities().coordinator),
        Arc::clone(registry.relay_maps()),
        dialer.clone(),
        Arc::new(EphemeralLegacyConns::new(
            dialer,
            Arc::clone(registry.relay_maps()),
        )),
        TailnetOptions::default(),
        cancel.child_token(),
    );

    let server = ApiServer::new(
        ApiServerConfig { bind_addr: cli.bind },
        AppState {
            registry: Arc::clone(&registry),
            tailnet: Arc::clone(&tailnet),
            access_url: cli.access_url.clone(),
        },
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down fleetmeshd...");
        shutdown.cancel();
    });

    let served = server.start(cancel.clone()).await;
    cancel.cancel();
    tailnet.close().await;
    registry.close().await;
    served
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

fn load_relay_map(path: &PathBuf) -> Result<RelayMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read relay map {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse relay map {}", path.display()))
}

/// One region served by the replicas' own relay at the access URL
fn embedded_relay_map(access_url: &Url) -> RelayMap {
    let host_name = access_url.host_str().unwrap_or("localhost").to_string();
    RelayMap::from_regions([RelayRegion {
        region_id: 1,
        region_code: "primary".to_string(),
        region_name: "Primary".to_string(),
        embedded_relay: true,
        nodes: vec![RelayNode {
            name: "1a".to_string(),
            region_id: 1,
            host_name,
            relay_port: access_url.port_or_known_default().unwrap_or(443),
            stun_port: -1,
            force_plaintext: access_url.scheme() == "http",
        }],
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_relay_map_follows_access_url() {
        let map = embedded_relay_map(&Url::parse("http://127.0.0.1:3000").unwrap());
        let region = map.region_by_code("primary").unwrap();
        assert_eq!(region.region_id, 1);
        assert_eq!(region.nodes[0].relay_port, 3000);
        assert!(region.nodes[0].force_plaintext);

        let map = embedded_relay_map(&Url::parse("https://fleet.example.com").unwrap());
        let node = &map.region_by_code("primary").unwrap().nodes[0];
        assert_eq!(node.host_name, "fleet.example.com");
        assert_eq!(node.relay_port, 443);
        assert!(!node.force_plaintext);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["fleetmeshd"]);
        assert!(cli.telemetry);
        assert!(cli.relay_address.is_empty());
        assert_eq!(cli.entitlements_interval, 600);
    }
}
