//! Edge proxy health probing
//!
//! Every registered proxy is probed at `GET {url}/healthz` on a fixed
//! interval. Results are published as one immutable map so readers never
//! wait on a probe in flight.

use arc_swap::ArcSwap;
use chrono::Utc;
use fleetmesh_proto::{EdgeProxy, ProxyHealthStatus, ProxyStatus};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyHealthOptions {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for ProxyHealthOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyHealthError {
    #[error("Failed to list proxies: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to build probe client: {0}")]
    Client(#[from] reqwest::Error),
}

pub type ProxyStatusMap = HashMap<Uuid, ProxyStatus>;

pub struct ProxyHealth {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    options: ProxyHealthOptions,
    statuses: ArcSwap<ProxyStatusMap>,
    refresh: Mutex<()>,
}

impl ProxyHealth {
    pub fn new(store: Arc<dyn Store>, options: ProxyHealthOptions) -> Result<Self, ProxyHealthError> {
        let client = reqwest::Client::builder()
            .timeout(options.probe_timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self::with_client(store, client, options))
    }

    pub fn with_client(
        store: Arc<dyn Store>,
        client: reqwest::Client,
        options: ProxyHealthOptions,
    ) -> Self {
        Self {
            store,
            client,
            options,
            statuses: ArcSwap::from_pointee(HashMap::new()),
            refresh: Mutex::new(()),
        }
    }

    /// Probe on the configured interval until cancelled. The first probe
    /// runs one interval after start; call [`ProxyHealth::force_update`]
    /// for an immediate one.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Proxy health loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.force_update().await {
                        warn!(error = %e, "Proxy health check failed");
                    }
                }
            }
        }
    }

    /// Probe every proxy now and publish the results
    pub async fn force_update(&self) -> Result<(), ProxyHealthError> {
        let _cycle = self.refresh.lock().await;

        let proxies = self.store.edge_proxies().await?;
        let probes = proxies.into_iter().map(|proxy| self.probe(proxy));
        let statuses: ProxyStatusMap = join_all(probes)
            .await
            .into_iter()
            .map(|status| (status.proxy.id, status))
            .collect();

        let healthy = statuses
            .values()
            .filter(|s| s.status == ProxyHealthStatus::Healthy)
            .count();
        debug!(proxies = statuses.len(), healthy, "Proxy health updated");

        self.statuses.store(Arc::new(statuses));
        Ok(())
    }

    async fn probe(&self, proxy: EdgeProxy) -> ProxyStatus {
        let (status, report) = self.check(&proxy).await;
        ProxyStatus {
            proxy,
            status,
            report,
            checked_at: Utc::now(),
        }
    }

    async fn check(&self, proxy: &EdgeProxy) -> (ProxyHealthStatus, Vec<String>) {
        if !proxy.is_registered() {
            return (ProxyHealthStatus::Unregistered, vec![]);
        }

        let url = match Url::parse(&format!("{}/healthz", proxy.url.trim_end_matches('/'))) {
            Ok(url) => url,
            Err(e) => {
                return (
                    ProxyHealthStatus::Unreachable,
                    vec![format!("invalid proxy url {:?}: {}", proxy.url, e)],
                )
            }
        };

        match timeout(self.options.probe_timeout, self.client.get(url).send()).await {
            Err(_) => (
                ProxyHealthStatus::Unreachable,
                vec![format!(
                    "health check timed out after {:?}",
                    self.options.probe_timeout
                )],
            ),
            Ok(Err(e)) => (
                ProxyHealthStatus::Unreachable,
                vec![format!("health check request failed: {}", e)],
            ),
            Ok(Ok(response)) if response.status().is_success() => {
                (ProxyHealthStatus::Healthy, vec![])
            }
            Ok(Ok(response)) => (
                ProxyHealthStatus::Unhealthy,
                vec![format!("health check returned {}", response.status())],
            ),
        }
    }

    /// Latest published statuses
    pub fn health_status(&self) -> Arc<ProxyStatusMap> {
        self.statuses.load_full()
    }

    pub fn status(&self, proxy_id: Uuid) -> ProxyHealthStatus {
        self.statuses
            .load()
            .get(&proxy_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Healthy relay-enabled proxies in id order
    pub fn healthy_relay_proxies(&self) -> Vec<EdgeProxy> {
        let mut proxies: Vec<EdgeProxy> = self
            .statuses
            .load()
            .values()
            .filter(|s| s.status == ProxyHealthStatus::Healthy && s.proxy.relay_enabled)
            .map(|s| s.proxy.clone())
            .collect();
        proxies.sort_by_key(|p| p.id);
        proxies
    }

    /// Hostnames of healthy proxies, for origin checks
    pub fn proxy_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .statuses
            .load()
            .values()
            .filter(|s| s.status == ProxyHealthStatus::Healthy)
            .filter_map(|s| {
                let url = Url::parse(&s.proxy.url).ok()?;
                let host = url.host_str()?;
                Some(match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                })
            })
            .collect();
        hosts.sort();
        hosts
    }
}
