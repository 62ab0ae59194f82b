//! Relay mesh between replicas in the same region
//!
//! One link task per peer relay address. Each task keeps its link up,
//! reconnecting with backoff until the address is removed or the mesh
//! is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use fleetmesh_transport::RelayLinker;

use crate::backoff::{sleep_or_cancel, Backoff, BackoffConfig};

pub struct RelayMesh {
    linker: Arc<dyn RelayLinker>,
    backoff: BackoffConfig,
    links: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl RelayMesh {
    pub fn new(linker: Arc<dyn RelayLinker>, backoff: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            linker,
            backoff,
            links: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile links against `addresses`: start missing ones, stop
    /// removed ones. Unparseable addresses are logged and skipped.
    pub fn set_addresses(&self, addresses: Vec<String>) {
        let mut wanted: HashMap<String, Url> = HashMap::new();
        for address in addresses {
            match Url::parse(&address) {
                Ok(url) => {
                    wanted.insert(address, url);
                }
                Err(e) => warn!(%address, error = %e, "Skipping invalid relay address"),
            }
        }

        let mut links = self.links();
        links.retain(|address, token| {
            if wanted.contains_key(address) {
                return true;
            }
            token.cancel();
            info!(%address, "Relay link removed");
            false
        });

        for (address, url) in wanted {
            if links.contains_key(&address) {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let token = self.cancel.child_token();
            tokio::spawn(maintain_link(
                Arc::clone(&self.linker),
                url,
                self.backoff.clone(),
                token.clone(),
            ));
            info!(%address, "Relay link added");
            links.insert(address, token);
        }
    }

    /// Addresses currently linked, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.links().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn close(&self) {
        for (_, token) in self.links().drain() {
            token.cancel();
        }
    }
}

async fn maintain_link(
    linker: Arc<dyn RelayLinker>,
    url: Url,
    backoff: BackoffConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(backoff);
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            attempt = linker.link(&url) => attempt,
        };

        match attempt {
            Ok(mut link) => {
                backoff.reset();
                debug!(address = %url, "Relay link established");

                let lost = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = link.closed() => true,
                };
                if !lost {
                    link.close().await;
                    return;
                }
                warn!(address = %url, "Relay link lost");
            }
            Err(e) => {
                warn!(address = %url, error = %e, attempt = backoff.attempt() + 1, "Relay link failed");
            }
        }

        if !sleep_or_cancel(backoff.next_delay(), &cancel).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetmesh_transport::{RelayLink, TransportError, TransportResult};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct HeldLink {
        address: Url,
        closed: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl RelayLink for HeldLink {
        async fn closed(&mut self) {
            std::future::pending::<()>().await
        }

        async fn close(&mut self) {
            let _ = self.closed.send(self.address.to_string());
        }

        fn address(&self) -> &Url {
            &self.address
        }
    }

    /// Records link attempts; links stay up until closed
    struct Linker {
        attempts: mpsc::UnboundedSender<String>,
        closed: mpsc::UnboundedSender<String>,
        fail: bool,
    }

    #[async_trait]
    impl RelayLinker for Linker {
        async fn link(&self, address: &Url) -> TransportResult<Box<dyn RelayLink>> {
            let _ = self.attempts.send(address.to_string());
            if self.fail {
                return Err(TransportError::ConnectionFailed("refused".to_string()));
            }
            Ok(Box::new(HeldLink {
                address: address.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn mesh(fail: bool) -> (
        RelayMesh,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let linker = Linker {
            attempts: attempts_tx,
            closed: closed_tx,
            fail,
        };
        let backoff = BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
        };
        (
            RelayMesh::new(Arc::new(linker), backoff, CancellationToken::new()),
            attempts_rx,
            closed_rx,
        )
    }

    #[tokio::test]
    async fn test_reconciles_link_set() {
        let (mesh, mut attempts, mut closed) = mesh(false);

        mesh.set_addresses(vec![
            "http://a.internal:3000".to_string(),
            "http://b.internal:3000".to_string(),
            "::not a url::".to_string(),
        ]);
        assert_eq!(
            mesh.addresses(),
            vec!["http://a.internal:3000", "http://b.internal:3000"]
        );
        let mut linked = vec![attempts.recv().await.unwrap(), attempts.recv().await.unwrap()];
        linked.sort();
        assert_eq!(linked, vec!["http://a.internal:3000/", "http://b.internal:3000/"]);

        // Keeping b must not restart it
        mesh.set_addresses(vec!["http://b.internal:3000".to_string()]);
        assert_eq!(mesh.addresses(), vec!["http://b.internal:3000"]);
        assert_eq!(closed.recv().await.unwrap(), "http://a.internal:3000/");
        assert!(attempts.try_recv().is_err());

        mesh.set_addresses(vec![]);
        assert!(mesh.addresses().is_empty());
        assert_eq!(closed.recv().await.unwrap(), "http://b.internal:3000/");
    }

    #[tokio::test]
    async fn test_failed_links_retry_until_closed() {
        let (mesh, mut attempts, _closed) = mesh(true);
        mesh.set_addresses(vec!["http://c.internal:3000".to_string()]);

        for _ in 0..3 {
            assert_eq!(attempts.recv().await.unwrap(), "http://c.internal:3000/");
        }

        mesh.close();
        assert!(mesh.addresses().is_empty());
    }
}
