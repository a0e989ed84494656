//! Identity contexts: one authenticated binding to an overlay network with
//! its own service catalog.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dns::DnsManager;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventStream};
use crate::identity::Identity;
use crate::protocol::{header, ContentType, Message};
use crate::transport::{AppInfo, Channel, DialDescriptor, OverlayConnection, Session};
use crate::types::ServiceEvent;

/// A host/port range that routes to a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterceptAddress {
    pub host: String,
    pub port_low: u16,
    pub port_high: u16,
}

impl InterceptAddress {
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && (self.port_low..=self.port_high).contains(&port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub intercepts: Vec<InterceptAddress>,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            intercepts: Vec::new(),
        }
    }

    pub fn intercept(mut self, host: impl Into<String>, port: u16) -> Self {
        self.intercepts.push(InterceptAddress {
            host: host.into(),
            port_low: port,
            port_high: port,
        });
        self
    }

    pub fn intercept_range(mut self, host: impl Into<String>, low: u16, high: u16) -> Self {
        self.intercepts.push(InterceptAddress {
            host: host.into(),
            port_low: low,
            port_high: high,
        });
        self
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.intercepts.iter().any(|i| i.matches(host, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextState {
    Loading,
    Active,
    Removed,
}

pub struct ZitiContext {
    identity: Identity,
    session: Arc<dyn Session>,
    dns: Arc<DnsManager>,
    state: watch::Sender<ContextState>,
    loaded: watch::Sender<bool>,
    /// Keyed by service name.
    services: RwLock<BTreeMap<String, Service>>,
    service_events: EventBus<ServiceEvent>,
    next_conn_id: AtomicI32,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ZitiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZitiContext")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ZitiContext {
    pub(crate) fn new(
        identity: Identity,
        session: Arc<dyn Session>,
        dns: Arc<DnsManager>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ContextState::Loading);
        let (loaded, _) = watch::channel(false);
        Arc::new(Self {
            identity,
            session,
            dns,
            state,
            loaded,
            services: RwLock::new(BTreeMap::new()),
            service_events: EventBus::new(),
            next_conn_id: AtomicI32::new(1),
            refresher: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.identity.alias
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    /// Logs in, applies the first catalog and starts the refresh loop.
    pub(crate) async fn activate(
        self: &Arc<Self>,
        app: &AppInfo,
        refresh: Duration,
    ) -> Result<()> {
        self.session.login(app).await?;
        self.refresh_services().await?;

        let activated = self.state.send_if_modified(|state| {
            if *state == ContextState::Loading {
                *state = ContextState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return Err(Error::ContextRemoved(self.name().to_string()));
        }
        info!("Context {} active ({})", self.name(), self.identity.fingerprint());

        let handle = spawn_refresher(Arc::downgrade(self), refresh);
        if let Some(old) = self.refresher().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Resolves once the context is active, or fails if it was removed first.
    pub async fn wait_active(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ContextState::Loading)
            .await
            .map_err(|_| Error::ContextRemoved(self.name().to_string()))?;
        match state {
            ContextState::Active => Ok(()),
            _ => Err(Error::ContextRemoved(self.name().to_string())),
        }
    }

    /// Resolves once the first service catalog has been applied.
    pub async fn services_loaded(&self) -> Result<()> {
        let mut rx = self.loaded.subscribe();
        rx.wait_for(|loaded| *loaded)
            .await
            .map(|_| ())
            .map_err(|_| Error::ContextRemoved(self.name().to_string()))
    }

    /// Pulls the catalog from the session and publishes the difference.
    pub async fn refresh_services(&self) -> Result<Vec<ServiceEvent>> {
        let fresh = self.session.services().await?;

        for service in &fresh {
            for intercept in &service.intercepts {
                if let Err(e) = self.dns.register_hostname(&intercept.host) {
                    warn!("Cannot register {} for {}: {}", intercept.host, service.name, e);
                }
            }
        }

        let events = {
            let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
            let mut events = Vec::new();
            let mut next = BTreeMap::new();
            for service in fresh {
                match services.remove(&service.name) {
                    None => events.push(ServiceEvent::Available(service.clone())),
                    Some(old) if old != service => {
                        events.push(ServiceEvent::Changed(service.clone()))
                    }
                    Some(_) => {}
                }
                next.insert(service.name.clone(), service);
            }
            events.extend(services.values().cloned().map(ServiceEvent::Unavailable));
            *services = next;

            for event in &events {
                self.service_events.publish(event.clone());
            }
            events
        };

        if !events.is_empty() {
            debug!("Context {} catalog changed: {} events", self.name(), events.len());
        }
        self.loaded.send_replace(true);
        Ok(events)
    }

    /// Current catalog as `Available` events, then live changes.
    pub fn service_updates(&self) -> EventStream<ServiceEvent> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = services.values().cloned().map(ServiceEvent::Available).collect();
        self.service_events.subscribe_with_snapshot(snapshot)
    }

    pub fn services(&self) -> Vec<Service> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get_service_by_name(&self, name: &str) -> Option<Service> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get_service(&self, host: &str, port: u16) -> Option<Service> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| s.matches(host, port))
            .cloned()
    }

    /// Connects to the service intercepting `addr`. Synthetic addresses are
    /// mapped back to their host name first.
    pub async fn dial_addr(&self, addr: SocketAddr) -> Result<OverlayConnection> {
        self.ensure_active()?;
        let host = self
            .dns
            .resolve_addr(addr.ip())
            .unwrap_or_else(|| addr.ip().to_string());
        let service = self.get_service(&host, addr.port()).ok_or_else(|| {
            Error::NoMatchingService(format!("{}:{}", host, addr.port()), self.name().to_string())
        })?;

        let descriptor = DialDescriptor::new(service.name.clone());
        let conn_id = self.allocate_conn_id();
        self.session.dial(&service, &descriptor, conn_id).await
    }

    /// Opens a raw channel and runs the dial handshake for `descriptor`.
    pub async fn dial(&self, descriptor: &DialDescriptor) -> Result<OverlayConnection> {
        self.ensure_active()?;
        if self.get_service_by_name(&descriptor.service).is_none() {
            return Err(Error::NoMatchingService(
                descriptor.service.clone(),
                self.name().to_string(),
            ));
        }

        let channel = self.open().await?;
        self.connect(channel, descriptor).await
    }

    pub async fn open(&self) -> Result<Box<dyn Channel>> {
        self.ensure_active()?;
        self.session.open().await
    }

    /// Dial handshake over `channel`. The channel is dropped on failure.
    pub async fn connect(
        &self,
        mut channel: Box<dyn Channel>,
        descriptor: &DialDescriptor,
    ) -> Result<OverlayConnection> {
        let conn_id = self.allocate_conn_id();
        let mut request = Message::new(ContentType::Dial, channel.next_sequence())
            .with_body(descriptor.service.as_bytes().to_vec());
        request.put_i32(header::CONN_ID, conn_id);
        if let Some(identity) = &descriptor.identity {
            request.put_header(header::SESSION_TOKEN, identity.as_bytes().to_vec());
        }

        let reply = channel.request(request.clone()).await?;
        request.check_reply(&reply)?;

        match reply.content_type {
            ContentType::DialSuccess => {
                debug!("{} dialed {} as connection {}", self.name(), descriptor.service, conn_id);
                channel.into_connection(self.name(), &descriptor.service, conn_id)
            }
            ContentType::DialFailed => Err(Error::DialFailed(
                String::from_utf8_lossy(&reply.body).into_owned(),
            )),
            other => Err(Error::Protocol(format!("unexpected dial reply {}", other))),
        }
    }

    fn allocate_conn_id(&self) -> i32 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            ContextState::Active => Ok(()),
            ContextState::Removed => Err(Error::ContextRemoved(self.name().to_string())),
            ContextState::Loading => Err(Error::Transport(format!(
                "context {} is still loading",
                self.name()
            ))),
        }
    }

    fn refresher(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the context removed, stops the refresh loop and closes the
    /// session.
    pub(crate) async fn destroy(&self) {
        self.state.send_replace(ContextState::Removed);
        if let Some(handle) = self.refresher().take() {
            handle.abort();
        }
        self.session.close().await;
        info!("Context {} destroyed", self.name());
    }
}

fn spawn_refresher(ctx: Weak<ZitiContext>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else { break };
            if ctx.state() != ContextState::Active {
                break;
            }
            if let Err(e) = ctx.refresh_services().await {
                warn!("Service refresh failed for {}: {}", ctx.name(), e);
            }
        }
    })
}
