//! Boundary to the per-context transport session.
//!
//! TLS, the controller API and the frame codec live behind these traits; the
//! core only sequences calls to them.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::context::Service;
use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::Message;

pub mod local;
pub use local::{Accepted, LocalTransport};

/// Reported to the controller on login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: String,
    pub app_version: String,
}

/// Structured dial target: a service by name plus dial parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialDescriptor {
    pub service: String,
    /// Terminator identity to address, when the service has several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_data: Option<String>,
}

impl DialDescriptor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            identity: None,
            app_data: None,
        }
    }
}

/// What an application asks the router to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Address(SocketAddr),
    Service(DialDescriptor),
}

impl From<SocketAddr> for DialTarget {
    fn from(addr: SocketAddr) -> Self {
        DialTarget::Address(addr)
    }
}

impl From<DialDescriptor> for DialTarget {
    fn from(descriptor: DialDescriptor) -> Self {
        DialTarget::Service(descriptor)
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Address(addr) => write!(f, "{}", addr),
            DialTarget::Service(d) => match &d.identity {
                Some(identity) => write!(f, "{}@{}", identity, d.service),
                None => write!(f, "{}", d.service),
            },
        }
    }
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A live connection to an overlay service.
pub struct OverlayConnection {
    context: String,
    service: String,
    conn_id: i32,
    io: Box<dyn AsyncStream>,
}

impl OverlayConnection {
    pub fn new(
        context: impl Into<String>,
        service: impl Into<String>,
        conn_id: i32,
        io: Box<dyn AsyncStream>,
    ) -> Self {
        Self {
            context: context.into(),
            service: service.into(),
            conn_id,
            io,
        }
    }

    /// Name of the context that carried the dial.
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }
}

impl fmt::Debug for OverlayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConnection")
            .field("context", &self.context)
            .field("service", &self.service)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl AsyncRead for OverlayConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for OverlayConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

/// Builds sessions for identities.
pub trait Transport: Send + Sync {
    /// Must not perform I/O; connecting happens in [`Session::login`].
    fn session(&self, identity: &Identity) -> Result<Arc<dyn Session>>;
}

/// One authenticated session beneath a context.
#[async_trait]
pub trait Session: Send + Sync {
    async fn login(&self, app: &AppInfo) -> Result<()>;

    /// Current service catalog.
    async fn services(&self) -> Result<Vec<Service>>;

    /// Connects to `service` as connection `conn_id`; the transport runs its
    /// own handshake.
    async fn dial(
        &self,
        service: &Service,
        descriptor: &DialDescriptor,
        conn_id: i32,
    ) -> Result<OverlayConnection>;

    /// Opens a raw channel for a caller-driven handshake.
    async fn open(&self) -> Result<Box<dyn Channel>>;

    async fn close(&self);
}

/// A raw edge channel. Dropping it releases the underlying resources.
#[async_trait]
pub trait Channel: Send {
    fn next_sequence(&mut self) -> i32;

    /// Sends `request` and waits for its reply.
    async fn request(&mut self, request: Message) -> Result<Message>;

    /// Turns the channel into a data connection after a successful dial.
    fn into_connection(
        self: Box<Self>,
        context: &str,
        service: &str,
        conn_id: i32,
    ) -> Result<OverlayConnection>;
}
