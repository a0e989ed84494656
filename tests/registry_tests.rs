use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use ziti_seam::identity::{CredentialStore, Identity, MemoryCredentialStore};
use ziti_seam::protocol::Message;
use ziti_seam::transport::{Accepted, AppInfo, Channel, LocalTransport, Session, Transport};
use ziti_seam::{
    ContextRegistry, ContextState, DialDescriptor, DnsManager, Error, IdentityEventType,
    OverlayConnection, RegistryOptions, Result, Service, ServiceEvent, ZitiContext,
};

const WAIT: Duration = Duration::from_secs(5);

fn identity(alias: &str) -> Identity {
    Identity::new(alias, "https://ctrl.test:1280", alias.as_bytes().to_vec()).unwrap()
}

fn setup() -> (Arc<ContextRegistry>, LocalTransport, UnboundedReceiver<Accepted>) {
    let (transport, accepts) = LocalTransport::new();
    let registry = ContextRegistry::with_options(
        Arc::new(transport.clone()),
        Arc::new(DnsManager::new()),
        RegistryOptions {
            refresh_interval: Duration::from_millis(50),
            ..RegistryOptions::default()
        },
    );
    (registry, transport, accepts)
}

async fn load(registry: &Arc<ContextRegistry>, alias: &str) -> Arc<ZitiContext> {
    let ctx = registry.load_context(identity(alias)).unwrap();
    timeout(WAIT, ctx.wait_active()).await.unwrap().unwrap();
    ctx
}

/// Offers one service, but its edge never answers a dial request.
#[derive(Default)]
struct StalledTransport {
    opened: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

struct StalledSession {
    opened: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

struct StalledChannel {
    dropped: Arc<AtomicUsize>,
}

impl Drop for StalledChannel {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl Transport for StalledTransport {
    fn session(&self, _identity: &Identity) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(StalledSession {
            opened: Arc::clone(&self.opened),
            dropped: Arc::clone(&self.dropped),
        }))
    }
}

#[async_trait]
impl Session for StalledSession {
    async fn login(&self, _app: &AppInfo) -> Result<()> {
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Service>> {
        Ok(vec![Service::new("1", "slow")])
    }

    async fn dial(
        &self,
        _service: &Service,
        _descriptor: &DialDescriptor,
        _conn_id: i32,
    ) -> Result<OverlayConnection> {
        std::future::pending().await
    }

    async fn open(&self) -> Result<Box<dyn Channel>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StalledChannel {
            dropped: Arc::clone(&self.dropped),
        }))
    }

    async fn close(&self) {}
}

#[async_trait]
impl Channel for StalledChannel {
    fn next_sequence(&mut self) -> i32 {
        1
    }

    async fn request(&mut self, _request: Message) -> Result<Message> {
        std::future::pending().await
    }

    fn into_connection(
        self: Box<Self>,
        _context: &str,
        _service: &str,
        _conn_id: i32,
    ) -> Result<OverlayConnection> {
        Err(Error::Protocol("stalled channel never connects".into()))
    }
}

#[tokio::test]
async fn test_load_context_activates_and_announces() {
    let (registry, transport, _accepts) = setup();
    let mut events = registry.identity_events();

    let ctx = registry.load_context(identity("ziti://alice")).unwrap();
    assert_eq!(ctx.state(), ContextState::Loading);

    let event = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert_eq!(event.kind, IdentityEventType::Loaded);
    assert!(Arc::ptr_eq(&event.context, &ctx));
    assert!(ctx.is_active());
    assert_eq!(transport.login_count(), 1);
}

#[test]
fn test_load_context_outside_runtime_is_rejected() {
    let (registry, _transport, _accepts) = setup();
    let err = registry.load_context(identity("ziti://alice")).unwrap_err();
    assert!(matches!(err, Error::UnsupportedEnvironment(_)));
    assert!(registry.contexts().is_empty());
}

#[tokio::test]
async fn test_invalid_identity_is_never_registered() {
    let (registry, _transport, _accepts) = setup();
    let bad = Identity {
        alias: "ziti://broken".into(),
        controller: String::new(),
        material: vec![1],
    };
    assert!(matches!(registry.load_context(bad), Err(Error::InvalidIdentity(_))));
    assert!(registry.contexts().is_empty());
}

#[tokio::test]
async fn test_failed_login_deregisters_context() {
    let (registry, transport, _accepts) = setup();
    transport.refuse_login("ziti://mallory");

    let ctx = registry.load_context(identity("ziti://mallory")).unwrap();
    assert!(timeout(WAIT, ctx.wait_active()).await.unwrap().is_err());

    timeout(WAIT, async {
        while !registry.contexts().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(ctx.state(), ContextState::Removed);
}

#[tokio::test]
async fn test_identity_events_replay_loaded_contexts() {
    let (registry, _transport, _accepts) = setup();
    let mut live = registry.identity_events();
    let a = load(&registry, "ziti://a").await;
    let b = load(&registry, "ziti://b").await;
    timeout(WAIT, live.next()).await.unwrap().unwrap();
    timeout(WAIT, live.next()).await.unwrap().unwrap();

    let mut late = registry.identity_events();
    let first = timeout(WAIT, late.next()).await.unwrap().unwrap();
    let second = timeout(WAIT, late.next()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first.context, &a));
    assert!(Arc::ptr_eq(&second.context, &b));

    assert!(registry.remove_context(&a).await);
    let removed = timeout(WAIT, late.next()).await.unwrap().unwrap();
    assert_eq!(removed.kind, IdentityEventType::Removed);
    assert!(Arc::ptr_eq(&removed.context, &a));
}

#[tokio::test]
async fn test_removing_context_before_activation_is_silent() {
    let (registry, _transport, _accepts) = setup();
    let mut events = registry.identity_events();

    let early = registry.load_context(identity("ziti://early")).unwrap();
    assert_eq!(early.state(), ContextState::Loading);
    assert!(registry.remove_context(&early).await);
    assert_eq!(early.state(), ContextState::Removed);

    let later = load(&registry, "ziti://later").await;
    let first = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert_eq!(first.kind, IdentityEventType::Loaded);
    assert!(Arc::ptr_eq(&first.context, &later));
}

#[tokio::test]
async fn test_remove_context_stops_dialing() {
    let (registry, transport, _accepts) = setup();
    transport.set_services("ziti://a", vec![Service::new("1", "web")]);
    let ctx = load(&registry, "ziti://a").await;

    assert!(registry.remove_context(&ctx).await);
    assert!(!registry.remove_context(&ctx).await);
    assert_eq!(ctx.state(), ContextState::Removed);

    let err = registry.dial(DialDescriptor::new("web")).await.unwrap_err();
    assert!(matches!(err, Error::ServiceNotAvailable { .. }));
}

#[tokio::test]
async fn test_get_service_for_uses_registration_order() {
    let (registry, transport, _accepts) = setup();
    let shared = Service::new("1", "web").intercept("web.ziti", 443);
    transport.set_services("ziti://first", vec![shared.clone()]);
    transport.set_services("ziti://second", vec![shared]);

    let first = load(&registry, "ziti://first").await;
    let _second = load(&registry, "ziti://second").await;

    let (ctx, service) = registry.get_service_for("WEB.ziti", 443).unwrap();
    assert!(Arc::ptr_eq(&ctx, &first));
    assert_eq!(service.name, "web");
    assert!(registry.get_service_for("web.ziti", 80).is_none());
}

#[tokio::test]
async fn test_dial_skips_context_without_service() {
    let (registry, transport, mut accepts) = setup();
    transport.set_services("ziti://c2", vec![Service::new("1", "db")]);
    let _c1 = load(&registry, "ziti://c1").await;
    let _c2 = load(&registry, "ziti://c2").await;

    let conn = registry.dial(DialDescriptor::new("db")).await.unwrap();
    assert_eq!(conn.context(), "ziti://c2");
    assert_eq!(conn.service(), "db");

    let accepted = timeout(WAIT, accepts.recv()).await.unwrap().unwrap();
    assert_eq!(accepted.identity, "ziti://c2");
}

#[tokio::test]
async fn test_dial_by_address_falls_through_to_matching_context() {
    let (registry, transport, mut accepts) = setup();
    transport.set_services(
        "ziti://c1",
        vec![Service::new("1", "ssh").intercept("ssh.ziti", 22)],
    );
    transport.set_services(
        "ziti://c2",
        vec![Service::new("2", "db").intercept("db.ziti", 5432)],
    );
    let c1 = load(&registry, "ziti://c1").await;
    let c2 = load(&registry, "ziti://c2").await;
    c1.services_loaded().await.unwrap();
    c2.services_loaded().await.unwrap();

    let ip = registry.dns().resolve("db.ziti").unwrap();
    let conn = registry.dial(SocketAddr::new(ip, 5432)).await.unwrap();
    assert_eq!(conn.context(), "ziti://c2");
    assert_eq!(conn.service(), "db");
    let accepted = timeout(WAIT, accepts.recv()).await.unwrap().unwrap();
    assert_eq!(accepted.identity, "ziti://c2");

    match registry.dial(SocketAddr::new(ip, 5433)).await {
        Err(Error::ServiceNotAvailable { attempts, .. }) => {
            let order: Vec<&str> = attempts.iter().map(|a| a.context.as_str()).collect();
            assert_eq!(order, vec!["ziti://c1", "ziti://c2"]);
        }
        other => panic!("unexpected dial result: {:?}", other),
    }
}

#[tokio::test]
async fn test_dropped_dial_releases_channel() {
    let transport = StalledTransport::default();
    let opened = Arc::clone(&transport.opened);
    let dropped = Arc::clone(&transport.dropped);
    let registry = ContextRegistry::new(Arc::new(transport), Arc::new(DnsManager::new()));
    let ctx = registry.load_context(identity("ziti://slow")).unwrap();
    timeout(WAIT, ctx.wait_active()).await.unwrap().unwrap();

    let dial = registry.dial(DialDescriptor::new("slow"));
    assert!(timeout(Duration::from_millis(100), dial).await.is_err());

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dial_exhaustion_names_target() {
    let (registry, _transport, _accepts) = setup();
    let _c1 = load(&registry, "ziti://c1").await;
    let _c2 = load(&registry, "ziti://c2").await;

    match registry.dial(DialDescriptor::new("missing")).await {
        Err(Error::ServiceNotAvailable { target, attempts }) => {
            assert_eq!(target, "missing");
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].context, "ziti://c1");
            assert_eq!(attempts[1].context, "ziti://c2");
        }
        other => panic!("unexpected dial result: {:?}", other),
    }
}

#[tokio::test]
async fn test_dial_without_contexts_fails() {
    let (registry, _transport, _accepts) = setup();
    let addr: SocketAddr = "100.64.1.2:80".parse().unwrap();
    let err = registry.dial(addr).await.unwrap_err();
    assert!(err.to_string().contains("100.64.1.2:80"));
}

#[tokio::test]
async fn test_dial_by_synthetic_address_round_trip() {
    let (registry, transport, mut accepts) = setup();
    transport.set_services(
        "ziti://app",
        vec![Service::new("7", "echo").intercept("echo.ziti", 7000)],
    );
    let ctx = load(&registry, "ziti://app").await;
    ctx.services_loaded().await.unwrap();

    let ip = registry.dns().resolve("echo.ziti").unwrap();
    let mut conn = registry.dial(SocketAddr::new(ip, 7000)).await.unwrap();
    assert_eq!(conn.service(), "echo");

    let mut accepted = timeout(WAIT, accepts.recv()).await.unwrap().unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    accepted.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let wrong_port = registry.dial(SocketAddr::new(ip, 7001)).await;
    assert!(wrong_port.is_err());
}

#[tokio::test]
async fn test_service_updates_are_tagged_with_context() {
    let (registry, transport, _accepts) = setup();
    let mut updates = registry.service_updates();
    transport.set_services("ziti://a", vec![Service::new("1", "web")]);
    let ctx = load(&registry, "ziti://a").await;

    let first = timeout(WAIT, updates.next()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first.context, &ctx));
    assert!(matches!(first.event, ServiceEvent::Available(ref s) if s.name == "web"));

    // Picked up by the background refresh.
    transport.set_services("ziti://a", Vec::new());
    let second = timeout(WAIT, updates.next()).await.unwrap().unwrap();
    assert!(matches!(second.event, ServiceEvent::Unavailable(ref s) if s.name == "web"));
}

#[tokio::test]
async fn test_enroll_loads_new_context() {
    let (registry, _transport, _accepts) = setup();
    let store = MemoryCredentialStore::new();

    let ctx = registry
        .enroll(&store, br#"{"ctrl":"https://ctrl.test:1280"}"#, "erin")
        .await
        .unwrap();
    assert_eq!(ctx.name(), "ziti://erin");
    assert_eq!(store.aliases(), vec!["ziti://erin".to_string()]);
    timeout(WAIT, ctx.wait_active()).await.unwrap().unwrap();

    let err = registry.enroll(&store, b"garbage", "frank").await.unwrap_err();
    assert!(matches!(err, Error::Enrollment(_)));
    assert_eq!(registry.contexts().len(), 1);
}

#[tokio::test]
async fn test_init_from_store_loads_ziti_aliases_only() {
    let (registry, _transport, _accepts) = setup();
    let store = MemoryCredentialStore::new();
    store.insert(identity("ziti://one")).unwrap();
    store.insert(identity("https://not-an-overlay-identity")).unwrap();
    store.insert(identity("ziti://two")).unwrap();

    let loaded = registry.init_from_store(&store, false).unwrap();
    let names: Vec<&str> = loaded.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["ziti://one", "ziti://two"]);
}

#[tokio::test]
async fn test_shutdown_clears_everything() {
    let (registry, transport, _accepts) = setup();
    transport.set_services("ziti://a", vec![Service::new("1", "web").intercept("web.ziti", 80)]);
    let ctx = load(&registry, "ziti://a").await;
    assert!(registry.dns().resolve("web.ziti").is_some());

    registry.shutdown().await;
    assert!(registry.contexts().is_empty());
    assert_eq!(ctx.state(), ContextState::Removed);
    assert!(registry.dns().is_empty());
}
