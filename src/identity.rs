//! Identities and the credential store boundary.
//!
//! Key material is opaque here. Verifying it, and turning enrollment tokens
//! into certificates, is the store's business.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const IDENTITY_SCHEME: &str = "ziti";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Store alias, `ziti://<name>` for overlay identities.
    pub alias: String,
    /// Controller the identity authenticates against.
    pub controller: String,
    #[serde(with = "hex_bytes")]
    pub material: Vec<u8>,
}

impl Identity {
    pub fn new(
        alias: impl Into<String>,
        controller: impl Into<String>,
        material: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let identity = Self {
            alias: alias.into(),
            controller: controller.into(),
            material: material.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let identity: Identity = serde_json::from_str(&raw)?;
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(Error::InvalidIdentity("empty alias".into()));
        }
        if self.controller.trim().is_empty() {
            return Err(Error::InvalidIdentity(format!("{}: missing controller", self.alias)));
        }
        if self.material.is_empty() {
            return Err(Error::InvalidIdentity(format!("{}: no key material", self.alias)));
        }
        Ok(())
    }

    /// Name without the `ziti://` scheme.
    pub fn name(&self) -> &str {
        self.alias
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.alias)
    }

    /// Hex SHA-256 of the key material, for diagnostics.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.material))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("alias", &self.alias)
            .field("controller", &self.controller)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

pub fn is_ziti_alias(alias: &str) -> bool {
    alias
        .split_once("://")
        .map(|(scheme, rest)| scheme.eq_ignore_ascii_case(IDENTITY_SCHEME) && !rest.is_empty())
        .unwrap_or(false)
}

/// Source of identities and the enrollment primitive.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Every alias in the store, in store order.
    fn aliases(&self) -> Vec<String>;

    fn load(&self, alias: &str) -> Result<Identity>;

    /// Exchanges `token` for a new identity named `name`, persists it and
    /// returns its alias.
    async fn enroll(&self, token: &[u8], name: &str) -> Result<String>;
}

/// Claims the in-memory store expects in an enrollment token.
#[derive(Debug, Deserialize)]
struct EnrollmentClaims {
    ctrl: String,
    #[serde(default)]
    sub: Option<String>,
}

/// Credential store held in memory. Enrollment tokens are JSON claims with a
/// `ctrl` URL; the token digest stands in for issued key material.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<Vec<Identity>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: Identity) -> Result<()> {
        identity.validate()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|existing| existing.alias != identity.alias);
        entries.push(identity);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn aliases(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|i| i.alias.clone())
            .collect()
    }

    fn load(&self, alias: &str) -> Result<Identity> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|i| i.alias == alias)
            .cloned()
            .ok_or_else(|| Error::InvalidIdentity(format!("no identity with alias {}", alias)))
    }

    async fn enroll(&self, token: &[u8], name: &str) -> Result<String> {
        let claims: EnrollmentClaims = serde_json::from_slice(token)
            .map_err(|e| Error::Enrollment(format!("malformed token: {}", e)))?;
        if claims.ctrl.is_empty() {
            return Err(Error::Enrollment("token has no controller".into()));
        }
        let name = if name.is_empty() {
            claims
                .sub
                .clone()
                .ok_or_else(|| Error::Enrollment("no identity name given".into()))?
        } else {
            name.to_string()
        };

        let alias = format!("{}://{}", IDENTITY_SCHEME, name);
        let identity = Identity::new(alias.clone(), claims.ctrl, Sha256::digest(token).to_vec())?;
        self.insert(identity)?;
        info!("Enrolled identity {}", alias);
        Ok(alias)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
