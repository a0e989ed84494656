//! Splices the virtual resolver in front of the system resolver.
//!
//! Rust has no process-wide resolver hook comparable to patching the
//! standard library's name service, so interception happens at the SDK's own
//! lookup entry points: [`install`] publishes an [`InterceptingNameService`]
//! and [`lookup_host`] / [`lookup_addr`] route through it. Applications that
//! resolve names through their own resolver bypass interception.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};

use super::DnsManager;
use crate::error::{Error, Result};

/// Forward and reverse lookups, the two operations a resolver hook handles.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn lookup_all_host_addr(&self, host: &str) -> Result<Vec<IpAddr>>;
    async fn get_host_by_addr(&self, addr: IpAddr) -> Result<String>;
}

/// Lookups against existing virtual bindings. Never allocates.
#[async_trait]
impl NameService for DnsManager {
    async fn lookup_all_host_addr(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolve(host)
            .map(|ip| vec![ip])
            .ok_or_else(|| Error::HostNotFound(host.to_string()))
    }

    async fn get_host_by_addr(&self, addr: IpAddr) -> Result<String> {
        self.resolve_addr(addr).ok_or(Error::AddressNotFound(addr))
    }
}

/// The host's native resolver, read from the system configuration.
pub struct SystemNameService {
    resolver: TokioAsyncResolver,
}

impl SystemNameService {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Install(format!("cannot load system resolver: {}", e)))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl NameService for SystemNameService {
    async fn lookup_all_host_addr(&self, host: &str) -> Result<Vec<IpAddr>> {
        match self.resolver.lookup_ip(host.to_string()).await {
            Ok(lookup) => {
                let addrs: Vec<IpAddr> = lookup.iter().collect();
                if addrs.is_empty() {
                    Err(Error::HostNotFound(host.to_string()))
                } else {
                    Ok(addrs)
                }
            }
            Err(e) => {
                debug!("System lookup failed for {}: {}", host, e);
                Err(Error::HostNotFound(host.to_string()))
            }
        }
    }

    async fn get_host_by_addr(&self, addr: IpAddr) -> Result<String> {
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .ok_or(Error::AddressNotFound(addr)),
            Err(e) => {
                debug!("System reverse lookup failed for {}: {}", addr, e);
                Err(Error::AddressNotFound(addr))
            }
        }
    }
}

/// Virtual resolver first, native resolver on any miss or failure.
pub struct InterceptingNameService {
    primary: Arc<dyn NameService>,
    fallback: Arc<dyn NameService>,
}

impl InterceptingNameService {
    pub fn new(primary: Arc<dyn NameService>, fallback: Arc<dyn NameService>) -> Self {
        Self { primary, fallback }
    }

    /// The wrapped native resolver.
    pub fn fallback(&self) -> &Arc<dyn NameService> {
        &self.fallback
    }
}

#[async_trait]
impl NameService for InterceptingNameService {
    async fn lookup_all_host_addr(&self, host: &str) -> Result<Vec<IpAddr>> {
        match self.primary.lookup_all_host_addr(host).await {
            Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("Virtual lookup for {} failed: {}", host, e),
        }
        debug!("Falling back to native resolver for host {}", host);
        self.fallback.lookup_all_host_addr(host).await
    }

    async fn get_host_by_addr(&self, addr: IpAddr) -> Result<String> {
        match self.primary.get_host_by_addr(addr).await {
            Ok(name) => return Ok(name),
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("Virtual reverse lookup for {} failed: {}", addr, e),
        }
        debug!("Falling back to native resolver for address {}", addr);
        self.fallback.get_host_by_addr(addr).await
    }
}

static INSTALLED: ArcSwapOption<InterceptingNameService> = ArcSwapOption::const_empty();

/// Installs `dns` ahead of the system resolver for this process.
///
/// Re-installing keeps the original native fallback rather than wrapping the
/// previous interceptor.
pub fn install(dns: Arc<dyn NameService>) -> Result<Arc<InterceptingNameService>> {
    check_environment()?;
    let fallback: Arc<dyn NameService> = match INSTALLED.load_full() {
        Some(current) => Arc::clone(current.fallback()),
        None => Arc::new(SystemNameService::from_system_conf()?),
    };
    install_with_fallback(dns, fallback)
}

/// Like [`install`] with an explicit native resolver.
pub fn install_with_fallback(
    dns: Arc<dyn NameService>,
    fallback: Arc<dyn NameService>,
) -> Result<Arc<InterceptingNameService>> {
    check_environment()?;
    let service = Arc::new(InterceptingNameService::new(dns, fallback));
    INSTALLED.store(Some(Arc::clone(&service)));
    info!("Virtual name service installed");
    Ok(service)
}

pub fn installed() -> Option<Arc<InterceptingNameService>> {
    INSTALLED.load_full()
}

/// Removes interception and returns the previous interceptor, if any.
pub fn uninstall() -> Option<Arc<InterceptingNameService>> {
    let previous = INSTALLED.swap(None);
    if previous.is_some() {
        info!("Virtual name service uninstalled");
    }
    previous
}

fn check_environment() -> Result<()> {
    if !cfg!(any(unix, windows)) {
        return Err(Error::UnsupportedEnvironment(
            "no system resolver configuration on this target".into(),
        ));
    }
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| Error::UnsupportedEnvironment("name service requires a tokio runtime".into()))
}

/// Application-facing forward lookup.
pub async fn lookup_host(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    match installed() {
        Some(service) => Ok(service
            .lookup_all_host_addr(host)
            .await?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect()),
        None => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
                .await
                .map_err(|_| Error::HostNotFound(host.to_string()))?
                .collect();
            if addrs.is_empty() {
                Err(Error::HostNotFound(host.to_string()))
            } else {
                Ok(addrs)
            }
        }
    }
}

/// Application-facing reverse lookup.
pub async fn lookup_addr(addr: IpAddr) -> Result<String> {
    match installed() {
        Some(service) => service.get_host_by_addr(addr).await,
        None => SystemNameService::from_system_conf()?.get_host_by_addr(addr).await,
    }
}
