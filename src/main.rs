//! ziti-seam daemon entry point.
//!
//! Loads the configured identities over the in-process transport, installs
//! the virtual name service in seamless mode and logs DNS, identity and
//! service events until interrupted.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{error, info};
use tokio::io::AsyncWriteExt;
use tokio::signal;

use ziti_seam::config::Config;
use ziti_seam::identity::{is_ziti_alias, CredentialStore, Identity, MemoryCredentialStore};
use ziti_seam::transport::LocalTransport;
use ziti_seam::{ContextRegistry, DnsManager, IdentityEventType, ServiceEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Config::load()?;

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();
    info!("Starting ziti-seam with config: {:?}", cfg);

    // Credential store
    let store = MemoryCredentialStore::new();
    if let Some(path) = &cfg.identity_file {
        store.insert(Identity::from_json_file(path)?)?;
    }

    // Transport and its accept queue
    let (transport, mut accepts) = LocalTransport::new();
    for (alias, services) in &cfg.services {
        transport.set_services(alias, services.clone());
    }
    let echo_handle = tokio::spawn(async move {
        while let Some(accepted) = accepts.recv().await {
            info!("Accepted {} for {}", accepted.service, accepted.identity);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(accepted.stream);
                if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                    error!("Echo for {} failed: {}", accepted.service, e);
                }
                let _ = writer.shutdown().await;
            });
        }
    });

    let dns = Arc::new(DnsManager::new());
    let registry = ContextRegistry::with_options(
        Arc::new(transport),
        Arc::clone(&dns),
        cfg.registry_options(),
    );

    // Event logging
    let dns_handle = dns.subscribe_with(|event| {
        info!("DNS {} -> {} (removed: {})", event.hostname, event.ip, event.removed);
    });
    let mut identity_events = registry.identity_events();
    let identity_handle = tokio::spawn(async move {
        while let Some(event) = identity_events.next().await {
            match event.kind {
                IdentityEventType::Loaded => info!("Identity loaded: {}", event.context.name()),
                IdentityEventType::Removed => info!("Identity removed: {}", event.context.name()),
            }
        }
    });
    let mut service_events = registry.service_updates();
    let service_handle = tokio::spawn(async move {
        while let Some(update) = service_events.next().await {
            let verb = match &update.event {
                ServiceEvent::Available(_) => "available",
                ServiceEvent::Changed(_) => "changed",
                ServiceEvent::Unavailable(_) => "unavailable",
            };
            info!(
                "Service {} {} via {}",
                update.event.service().name,
                verb,
                update.context.name()
            );
        }
    });

    // Contexts
    if cfg.identities.is_empty() {
        registry.init_from_store(&store, cfg.seamless)?;
    } else {
        if cfg.seamless {
            registry.install_name_service()?;
        }
        for alias in cfg.identities.iter().filter(|a| is_ziti_alias(a)) {
            if let Err(e) = store.load(alias).and_then(|id| registry.load_context(id)) {
                error!("Cannot load identity {}: {}", alias, e);
            }
        }
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    info!("Virtual DNS bindings:\n{}", dns.dump());
    registry.shutdown().await;

    // Abort tasks
    dns_handle.abort();
    identity_handle.abort();
    service_handle.abort();
    echo_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
