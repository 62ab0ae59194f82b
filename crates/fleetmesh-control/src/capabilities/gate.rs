//! Connection admission by client origin

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Browser,
    Cli,
}

impl ConnectionOrigin {
    /// Browsers always send a `Mozilla/` product token
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        match user_agent {
            Some(ua) if ua.contains("Mozilla/") => ConnectionOrigin::Browser,
            _ => ConnectionOrigin::Cli,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateRejection {
    #[error("Non-browser connections are disabled for your deployment.")]
    NonBrowser,
}

pub trait ConnectivityGate: Send + Sync {
    fn kind(&self) -> &'static str;

    fn admit(&self, origin: ConnectionOrigin) -> Result<(), GateRejection>;
}

pub struct AllowAllGate;

impl ConnectivityGate for AllowAllGate {
    fn kind(&self) -> &'static str {
        "allow_all"
    }

    fn admit(&self, _origin: ConnectionOrigin) -> Result<(), GateRejection> {
        Ok(())
    }
}

pub struct BrowserOnlyGate;

impl ConnectivityGate for BrowserOnlyGate {
    fn kind(&self) -> &'static str {
        "browser_only"
    }

    fn admit(&self, origin: ConnectionOrigin) -> Result<(), GateRejection> {
        match origin {
            ConnectionOrigin::Browser => Ok(()),
            ConnectionOrigin::Cli => Err(GateRejection::NonBrowser),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_only_rejects_cli() {
        let browser = ConnectionOrigin::from_user_agent(Some(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
        ));
        let cli = ConnectionOrigin::from_user_agent(Some("fleetmesh-cli/0.1.0"));

        assert_eq!(browser, ConnectionOrigin::Browser);
        assert_eq!(cli, ConnectionOrigin::Cli);
        assert_eq!(ConnectionOrigin::from_user_agent(None), ConnectionOrigin::Cli);

        assert!(BrowserOnlyGate.admit(browser).is_ok());
        assert_eq!(BrowserOnlyGate.admit(cli), Err(GateRejection::NonBrowser));
        assert!(AllowAllGate.admit(cli).is_ok());
    }
}
