use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::context::Service;
use crate::error::{Error, Result};
use crate::registry::RegistryOptions;
use crate::transport::AppInfo;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Aliases to load. Empty means every `ziti://` alias in the store.
    pub identities: Vec<String>,
    /// JSON identity document added to the store at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// Install the virtual name service.
    pub seamless: bool,
    pub app_id: String,
    pub app_version: String,
    pub refresh_interval_secs: u64,
    pub log_level: String,
    /// Catalog served by the in-process transport, keyed by alias.
    pub services: BTreeMap<String, Vec<Service>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            identity_file: None,
            seamless: true,
            app_id: env!("CARGO_PKG_NAME").into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            refresh_interval_secs: 60,
            log_level: "info".into(),
            services: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("ziti.toml"))
                .merge(Json::file("ziti.json"))
                .merge(Env::prefixed("ZITI_")),
        )
    }

    pub fn load_from(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        if config.refresh_interval_secs == 0 {
            return Err(Error::Config("refresh_interval_secs must be positive".into()));
        }
        Ok(config)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            app: AppInfo {
                app_id: self.app_id.clone(),
                app_version: self.app_version.clone(),
            },
        }
    }
}
