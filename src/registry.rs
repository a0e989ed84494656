//! Context registry and dial router.
//!
//! Contexts are kept in registration order and that order is the only
//! tie-break: `get_service_for` and `dial` both take the first context that
//! can serve the target. There is no route-quality ranking.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::context::{Service, ZitiContext};
use crate::dns::{self, DnsManager, InterceptingNameService};
use crate::error::{DialAttempt, Error, Result};
use crate::events::{EventBus, EventStream};
use crate::identity::{is_ziti_alias, CredentialStore, Identity};
use crate::transport::{AppInfo, DialTarget, OverlayConnection, Transport};
use crate::types::{ContextServiceEvent, IdentityEvent};

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub refresh_interval: Duration,
    pub app: AppInfo,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            app: AppInfo::default(),
        }
    }
}

struct Entry {
    ctx: Arc<ZitiContext>,
    /// Activation followed by service event forwarding.
    task: JoinHandle<()>,
    announced: bool,
}

pub struct ContextRegistry {
    dns: Arc<DnsManager>,
    transport: Arc<dyn Transport>,
    options: RwLock<RegistryOptions>,
    contexts: RwLock<Vec<Entry>>,
    identity_events: EventBus<IdentityEvent>,
    service_events: EventBus<ContextServiceEvent>,
}

impl ContextRegistry {
    pub fn new(transport: Arc<dyn Transport>, dns: Arc<DnsManager>) -> Arc<Self> {
        Self::with_options(transport, dns, RegistryOptions::default())
    }

    pub fn with_options(
        transport: Arc<dyn Transport>,
        dns: Arc<DnsManager>,
        options: RegistryOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            dns,
            transport,
            identity_events: EventBus::new(),
            service_events: EventBus::new(),
            options: RwLock::new(options),
            contexts: RwLock::new(Vec::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.contexts.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dns(&self) -> &Arc<DnsManager> {
        &self.dns
    }

    pub fn set_application_info(&self, app_id: impl Into<String>, app_version: impl Into<String>) {
        let mut options = self.options.write().unwrap_or_else(PoisonError::into_inner);
        options.app = AppInfo {
            app_id: app_id.into(),
            app_version: app_version.into(),
        };
    }

    /// Puts the virtual resolver in front of the system resolver.
    pub fn install_name_service(&self) -> Result<Arc<InterceptingNameService>> {
        dns::install(Arc::clone(&self.dns) as Arc<dyn dns::NameService>)
    }

    /// Registers a context for `identity` and activates it in the background.
    ///
    /// The context is returned in `Loading` state. Once login and the first
    /// catalog succeed it turns `Active`, an identity `Loaded` event goes
    /// out and its service events start flowing into
    /// [`service_updates`](Self::service_updates). A failed activation
    /// deregisters the context again.
    ///
    /// Fails with [`Error::UnsupportedEnvironment`] outside a tokio runtime,
    /// before anything is registered.
    pub fn load_context(self: &Arc<Self>, identity: Identity) -> Result<Arc<ZitiContext>> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::UnsupportedEnvironment("loading a context requires a tokio runtime".into())
        })?;
        identity.validate()?;
        let session = self.transport.session(&identity)?;
        let ctx = ZitiContext::new(identity, session, Arc::clone(&self.dns));

        let (app, refresh) = {
            let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
            (options.app.clone(), options.refresh_interval)
        };

        // Spawned under the lock so the task cannot announce before the entry exists.
        let mut contexts = self.write();
        let task = runtime.spawn(run_context(
            Arc::downgrade(self),
            Arc::clone(&ctx),
            app,
            refresh,
        ));
        contexts.push(Entry {
            ctx: Arc::clone(&ctx),
            task,
            announced: false,
        });
        info!("Loading context {}", ctx.name());
        Ok(ctx)
    }

    /// Loads every `ziti://` identity in `store`, installing the virtual name
    /// service first when `seamless` is set.
    pub fn init_from_store(
        self: &Arc<Self>,
        store: &dyn CredentialStore,
        seamless: bool,
    ) -> Result<Vec<Arc<ZitiContext>>> {
        if seamless {
            self.install_name_service()?;
        }
        let mut loaded = Vec::new();
        for alias in store.aliases().into_iter().filter(|a| is_ziti_alias(a)) {
            loaded.push(self.load_context(store.load(&alias)?)?);
        }
        Ok(loaded)
    }

    /// Enrolls a new identity through `store` and loads it.
    pub async fn enroll(
        self: &Arc<Self>,
        store: &dyn CredentialStore,
        token: &[u8],
        name: &str,
    ) -> Result<Arc<ZitiContext>> {
        let alias = store.enroll(token, name).await?;
        let identity = store.load(&alias)?;
        self.load_context(identity)
    }

    /// Deregisters and tears down `ctx`. Returns false if it was not loaded.
    ///
    /// `Removed` is only published for a context whose `Loaded` went out.
    pub async fn remove_context(&self, ctx: &Arc<ZitiContext>) -> bool {
        let entry = {
            let mut contexts = self.write();
            let Some(pos) = contexts.iter().position(|e| Arc::ptr_eq(&e.ctx, ctx)) else {
                return false;
            };
            let entry = contexts.remove(pos);
            if entry.announced {
                self.identity_events.publish(IdentityEvent::removed(Arc::clone(ctx)));
            }
            entry
        };

        entry.task.abort();
        entry.ctx.destroy().await;
        info!("Removed context {}", ctx.name());
        true
    }

    /// Removes every context and clears the virtual DNS.
    pub async fn shutdown(&self) {
        for ctx in self.contexts() {
            self.remove_context(&ctx).await;
        }
        self.dns.reset();
    }

    /// Registered contexts in registration order, whatever their state.
    pub fn contexts(&self) -> Vec<Arc<ZitiContext>> {
        self.read().iter().map(|e| Arc::clone(&e.ctx)).collect()
    }

    pub fn get_service_for(&self, host: &str, port: u16) -> Option<(Arc<ZitiContext>, Service)> {
        self.read()
            .iter()
            .filter(|e| e.ctx.is_active())
            .find_map(|e| e.ctx.get_service(host, port).map(|s| (Arc::clone(&e.ctx), s)))
    }

    /// Tries each context in registration order; the first connection wins.
    ///
    /// Per-context failures are logged and collected into
    /// [`Error::ServiceNotAvailable`] when every context fails. Dropping the
    /// returned future drops any channel opened by the attempt in flight.
    pub async fn dial(&self, target: impl Into<DialTarget>) -> Result<OverlayConnection> {
        let target = target.into();
        let mut attempts = Vec::new();

        for ctx in self.contexts() {
            let result = match &target {
                DialTarget::Address(addr) => ctx.dial_addr(*addr).await,
                DialTarget::Service(descriptor) => ctx.dial(descriptor).await,
            };
            match result {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("service @[{}] not available for {}: {}", target, ctx.name(), e);
                    attempts.push(DialAttempt {
                        context: ctx.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        error!("service @[{}] not available in any contexts", target);
        Err(Error::ServiceNotAvailable {
            target: target.to_string(),
            attempts,
        })
    }

    /// Service events from every context, tagged with their context.
    pub fn service_updates(&self) -> EventStream<ContextServiceEvent> {
        self.service_events.subscribe()
    }

    /// `Loaded` for every active context, then live load/remove events.
    pub fn identity_events(&self) -> EventStream<IdentityEvent> {
        let contexts = self.read();
        let snapshot = contexts
            .iter()
            .filter(|e| e.announced)
            .map(|e| IdentityEvent::loaded(Arc::clone(&e.ctx)))
            .collect();
        self.identity_events.subscribe_with_snapshot(snapshot)
    }

    /// Marks `ctx` announced and publishes `Loaded`, if still registered.
    fn announce(&self, ctx: &Arc<ZitiContext>) -> bool {
        let mut contexts = self.write();
        match contexts.iter_mut().find(|e| Arc::ptr_eq(&e.ctx, ctx)) {
            Some(entry) => {
                entry.announced = true;
                self.identity_events.publish(IdentityEvent::loaded(Arc::clone(ctx)));
                true
            }
            None => false,
        }
    }

    fn forget(&self, ctx: &Arc<ZitiContext>) {
        self.write().retain(|e| !Arc::ptr_eq(&e.ctx, ctx));
    }
}

async fn run_context(
    registry: Weak<ContextRegistry>,
    ctx: Arc<ZitiContext>,
    app: AppInfo,
    refresh: Duration,
) {
    if let Err(e) = ctx.activate(&app, refresh).await {
        error!("Failed to load context {}: {}", ctx.name(), e);
        if let Some(registry) = registry.upgrade() {
            registry.forget(&ctx);
        }
        ctx.destroy().await;
        return;
    }

    let mut updates = ctx.service_updates();
    {
        let Some(registry) = registry.upgrade() else { return };
        if !registry.announce(&ctx) {
            return;
        }
    }

    while let Some(event) = updates.next().await {
        let Some(registry) = registry.upgrade() else { break };
        registry.service_events.publish(ContextServiceEvent {
            context: Arc::clone(&ctx),
            event,
        });
    }
}
