//! In-process transport.
//!
//! Every identity gets a catalog held in memory, and dials hand the server
//! half of a `tokio::io::duplex` pipe to whoever drains the accept queue.
//! Useful for embedding tests and for running the daemon without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use log::debug;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{AppInfo, Channel, DialDescriptor, OverlayConnection, Session, Transport};
use crate::context::Service;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{header, ContentType, Message};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Server side of an accepted dial.
#[derive(Debug)]
pub struct Accepted {
    pub identity: String,
    pub service: String,
    pub stream: DuplexStream,
}

struct Network {
    catalogs: RwLock<HashMap<String, Vec<Service>>>,
    refused_logins: RwLock<HashSet<String>>,
    logins: AtomicUsize,
    accept_tx: mpsc::UnboundedSender<Accepted>,
}

impl Network {
    fn catalog(&self, alias: &str) -> Vec<Service> {
        self.catalogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    fn find(&self, alias: &str, service: &str) -> Option<Service> {
        self.catalog(alias).into_iter().find(|s| s.name == service)
    }

    fn pipe(&self, alias: &str, service: &str) -> Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.accept_tx
            .send(Accepted {
                identity: alias.to_string(),
                service: service.to_string(),
                stream: server,
            })
            .map_err(|_| Error::Transport("accept queue closed".into()))?;
        Ok(client)
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<Network>,
}

impl LocalTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let network = Network {
            catalogs: RwLock::new(HashMap::new()),
            refused_logins: RwLock::new(HashSet::new()),
            logins: AtomicUsize::new(0),
            accept_tx,
        };
        (
            Self {
                network: Arc::new(network),
            },
            accept_rx,
        )
    }

    /// Replaces the catalog served to `alias`. Sessions see it on their next
    /// refresh.
    pub fn set_services(&self, alias: &str, services: Vec<Service>) {
        self.network
            .catalogs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string(), services);
    }

    /// Makes logins for `alias` fail.
    pub fn refuse_login(&self, alias: &str) {
        self.network
            .refused_logins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string());
    }

    pub fn login_count(&self) -> usize {
        self.network.logins.load(Ordering::SeqCst)
    }
}

impl Transport for LocalTransport {
    fn session(&self, identity: &Identity) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(LocalSession {
            alias: identity.alias.clone(),
            network: Arc::clone(&self.network),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalSession {
    alias: String,
    network: Arc<Network>,
    closed: AtomicBool,
}

impl LocalSession {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Transport(format!("session {} is closed", self.alias)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn login(&self, app: &AppInfo) -> Result<()> {
        self.check_open()?;
        let refused = self
            .network
            .refused_logins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&self.alias);
        if refused {
            return Err(Error::Transport(format!("login refused for {}", self.alias)));
        }
        self.network.logins.fetch_add(1, Ordering::SeqCst);
        debug!("{} logged in as app {:?}", self.alias, app.app_id);
        Ok(())
    }

    async fn services(&self) -> Result<Vec<Service>> {
        self.check_open()?;
        Ok(self.network.catalog(&self.alias))
    }

    async fn dial(
        &self,
        service: &Service,
        _descriptor: &DialDescriptor,
        conn_id: i32,
    ) -> Result<OverlayConnection> {
        self.check_open()?;
        if self.network.find(&self.alias, &service.name).is_none() {
            return Err(Error::DialFailed(format!("service {} not found", service.name)));
        }
        let stream = self.network.pipe(&self.alias, &service.name)?;
        Ok(OverlayConnection::new(
            self.alias.clone(),
            service.name.clone(),
            conn_id,
            Box::new(stream),
        ))
    }

    async fn open(&self) -> Result<Box<dyn Channel>> {
        self.check_open()?;
        Ok(Box::new(LocalChannel {
            alias: self.alias.clone(),
            network: Arc::clone(&self.network),
            sequence: 0,
            dialed: None,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Answers `Dial` requests the way an edge router would.
struct LocalChannel {
    alias: String,
    network: Arc<Network>,
    sequence: i32,
    dialed: Option<String>,
}

#[async_trait]
impl Channel for LocalChannel {
    fn next_sequence(&mut self) -> i32 {
        self.sequence += 1;
        self.sequence
    }

    async fn request(&mut self, request: Message) -> Result<Message> {
        let seq = self.next_sequence();
        match request.content_type {
            ContentType::Dial => {
                let service = String::from_utf8_lossy(&request.body).into_owned();
                if self.network.find(&self.alias, &service).is_some() {
                    self.dialed = Some(service);
                    let mut reply = request.reply(ContentType::DialSuccess, seq);
                    if let Some(conn_id) = request.header_i32(header::CONN_ID) {
                        reply.put_i32(header::CONN_ID, conn_id);
                    }
                    Ok(reply)
                } else {
                    Ok(request
                        .reply(ContentType::DialFailed, seq)
                        .with_body(format!("service {} not found", service)))
                }
            }
            _ => {
                let mut reply = request.reply(ContentType::Result, seq);
                reply.put_bool(header::RESULT_SUCCESS, false);
                Ok(reply)
            }
        }
    }

    fn into_connection(
        self: Box<Self>,
        context: &str,
        service: &str,
        conn_id: i32,
    ) -> Result<OverlayConnection> {
        if self.dialed.as_deref() != Some(service) {
            return Err(Error::Protocol(format!("channel was not dialed to {}", service)));
        }
        let stream = self.network.pipe(&self.alias, service)?;
        Ok(OverlayConnection::new(context, service, conn_id, Box::new(stream)))
    }
}
