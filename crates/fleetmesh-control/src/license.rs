//! License verification and entitlement computation
//!
//! Licenses are HS256-signed JWTs. The `kid` header selects the verifying
//! key. A license past `license_expires` but before `exp` still entitles,
//! at grace-period strength.

use chrono::{DateTime, TimeZone, Utc};
use fleetmesh_proto::{Entitlement, Entitlements, Feature, FeatureName};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::store::{Store, StoreResult};

pub const PUBSUB_EVENT_LICENSES: &str = "licenses";

/// Claims carried by a license
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseClaims {
    /// Start of the grace period (unix seconds)
    pub license_expires: i64,
    /// Hard expiry (unix seconds)
    pub exp: i64,
    #[serde(default)]
    pub nbf: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub trial: bool,
    #[serde(default)]
    pub all_features: bool,
    #[serde(default)]
    pub require_telemetry: bool,
    /// Feature name to limit; any positive value entitles
    #[serde(default)]
    pub features: HashMap<String, i64>,
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("License has no key id")]
    MissingKeyId,

    #[error("Unknown license key id {0:?}")]
    UnknownKey(String),

    #[error("License is not valid until {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("Invalid license key entry {0:?}, expected KID=SECRET")]
    InvalidKeyEntry(String),

    #[error("Invalid license: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Verification keys by key id
#[derive(Debug, Clone, Default)]
pub struct LicenseKeys {
    keys: HashMap<String, Vec<u8>>,
}

impl LicenseKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, kid: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(kid.into(), secret.into());
        self
    }

    /// Parse `KID=SECRET` entries
    pub fn parse<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Self, LicenseError> {
        let mut keys = Self::new();
        for entry in entries {
            let (kid, secret) = entry
                .split_once('=')
                .filter(|(kid, secret)| !kid.is_empty() && !secret.is_empty())
                .ok_or_else(|| LicenseError::InvalidKeyEntry(entry.to_string()))?;
            keys = keys.with_key(kid, secret.as_bytes());
        }
        Ok(keys)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Verify a license and return its claims. Expiry is not checked here.
pub fn parse_license(
    jwt: &str,
    keys: &LicenseKeys,
    now: DateTime<Utc>,
) -> Result<LicenseClaims, LicenseError> {
    let header = decode_header(jwt)?;
    let kid = header.kid.ok_or(LicenseError::MissingKeyId)?;
    let secret = keys
        .keys
        .get(&kid)
        .ok_or_else(|| LicenseError::UnknownKey(kid.clone()))?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let claims = decode::<LicenseClaims>(jwt, &DecodingKey::from_secret(secret), &validation)?.claims;
    if claims.nbf > now.timestamp() {
        return Err(LicenseError::NotYetValid(timestamp(claims.nbf)));
    }
    Ok(claims)
}

/// Sign `claims` with the key registered under `kid`
pub fn sign_license(kid: &str, secret: &[u8], claims: &LicenseClaims) -> Result<String, LicenseError> {
    let header = Header {
        kid: Some(kid.to_string()),
        ..Header::new(Algorithm::HS256)
    };
    Ok(encode(&header, claims, &EncodingKey::from_secret(secret))?)
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Deployment facts that feed entitlement computation
#[derive(Debug, Clone, Default)]
pub struct EntitlementInputs {
    pub replica_count: usize,
    pub git_auth_count: usize,
    /// Whether each feature is switched on in configuration
    pub enablements: BTreeMap<FeatureName, bool>,
}

impl EntitlementInputs {
    fn enabled(&self, feature: FeatureName) -> bool {
        self.enablements.get(&feature).copied().unwrap_or(false) || feature.always_enable()
    }
}

/// Derive entitlements from every stored, unexpired license
pub async fn compute_entitlements(
    store: &dyn Store,
    keys: &LicenseKeys,
    inputs: &EntitlementInputs,
    now: DateTime<Utc>,
) -> StoreResult<Entitlements> {
    let mut entitlements = Entitlements {
        refreshed_at: now,
        ..Entitlements::default()
    };
    for name in FeatureName::ALL {
        entitlements.features.insert(
            name,
            Feature {
                enabled: inputs.enablements.get(&name).copied().unwrap_or(false),
                ..Feature::default()
            },
        );
    }

    let licenses = store.licenses().await?;
    let active_users = store.active_user_count().await?;
    let mut all_features = false;

    for license in licenses {
        let claims = match parse_license(&license.jwt, keys, now) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(license_id = license.id, error = %e, "Invalid license");
                entitlements
                    .errors
                    .push(format!("Invalid license (#{}): {}", license.id, e));
                continue;
            }
        };
        if claims.exp < now.timestamp() {
            debug!(license_id = license.id, "Skipping expired license");
            continue;
        }

        entitlements.has_license = true;
        entitlements.trial = claims.trial;
        let strength = if now.timestamp() > claims.license_expires {
            Entitlement::GracePeriod
        } else {
            Entitlement::Entitled
        };

        let seconds_left = claims.license_expires - now.timestamp();
        let days_left = (seconds_left + 86_399).div_euclid(86_400);
        let warn_within = if claims.trial { 7 } else { 30 };
        if days_left > 0 && days_left < warn_within {
            let unit = if days_left > 1 { "days" } else { "day" };
            entitlements
                .warnings
                .push(format!("Your license expires in {} {}.", days_left, unit));
        }

        for (name, value) in &claims.features {
            if *value <= 0 {
                continue;
            }
            let Ok(feature) = name.parse::<FeatureName>() else {
                debug!(feature = %name, "Ignoring unknown licensed feature");
                continue;
            };
            if feature == FeatureName::UserLimit {
                let prior = entitlements.feature(FeatureName::UserLimit).limit;
                let limit = prior.map_or(*value, |prior| prior.max(*value));
                entitlements.features.insert(
                    feature,
                    Feature {
                        entitlement: strength,
                        enabled: true,
                        limit: Some(limit),
                        actual: Some(active_users),
                    },
                );
                continue;
            }
            let current = entitlements.feature(feature);
            entitlements.features.insert(
                feature,
                Feature {
                    entitlement: current.entitlement.max(strength),
                    enabled: inputs.enabled(feature),
                    ..current
                },
            );
        }

        all_features |= claims.all_features;
        entitlements.require_telemetry |= claims.require_telemetry;
    }

    if all_features {
        for name in FeatureName::ALL {
            if name == FeatureName::UserLimit {
                continue;
            }
            let current = entitlements.feature(name);
            entitlements.features.insert(
                name,
                Feature {
                    entitlement: current.entitlement.max(Entitlement::Entitled),
                    enabled: inputs.enabled(name),
                    ..current
                },
            );
        }
    }

    if entitlements.has_license {
        if let Some(limit) = entitlements.feature(FeatureName::UserLimit).limit {
            if active_users > limit {
                entitlements.warnings.push(format!(
                    "Your deployment has {} active users but is only licensed for {}.",
                    active_users, limit
                ));
            }
        }

        for name in FeatureName::ALL {
            if matches!(
                name,
                FeatureName::UserLimit | FeatureName::HighAvailability | FeatureName::MultipleGitAuth
            ) {
                continue;
            }
            let feature = entitlements.feature(name);
            if !feature.enabled {
                continue;
            }
            match feature.entitlement {
                Entitlement::NotEntitled => entitlements.warnings.push(format!(
                    "{} is enabled but your license is not entitled to this feature.",
                    name.humanize()
                )),
                Entitlement::GracePeriod => entitlements.warnings.push(format!(
                    "{} is enabled but your license for this feature is expired.",
                    name.humanize()
                )),
                Entitlement::Entitled => {}
            }
        }
    }

    if inputs.replica_count > 1 {
        match entitlements.feature(FeatureName::HighAvailability).entitlement {
            Entitlement::NotEntitled if entitlements.has_license => entitlements.errors.push(
                "You have multiple replicas but your license is not entitled to high availability. You will be unable to connect to workspaces."
                    .to_string(),
            ),
            Entitlement::NotEntitled => entitlements.errors.push(
                "You have multiple replicas but high availability is an Enterprise feature. You will be unable to connect to workspaces."
                    .to_string(),
            ),
            Entitlement::GracePeriod => entitlements.warnings.push(
                "You have multiple replicas but your license for high availability is expired. Reduce to one replica or workspace connections will stop working."
                    .to_string(),
            ),
            Entitlement::Entitled => {}
        }
    }

    if inputs.git_auth_count > 1 {
        match entitlements.feature(FeatureName::MultipleGitAuth).entitlement {
            Entitlement::NotEntitled if entitlements.has_license => entitlements.errors.push(
                "You have multiple Git authorizations configured but your license is limited at one."
                    .to_string(),
            ),
            Entitlement::NotEntitled => entitlements.errors.push(
                "You have multiple Git authorizations configured but this is an Enterprise feature. Reduce to one."
                    .to_string(),
            ),
            Entitlement::GracePeriod => entitlements.warnings.push(
                "You have multiple Git authorizations configured but your license is expired. Reduce to one."
                    .to_string(),
            ),
            Entitlement::Entitled => {}
        }
    }

    for (name, feature) in entitlements.features.iter_mut() {
        if *name != FeatureName::UserLimit && feature.entitlement == Entitlement::NotEntitled {
            feature.enabled = false;
        }
    }

    Ok(entitlements)
}
