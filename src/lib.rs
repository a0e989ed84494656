//! Client-side core of a zero-trust overlay SDK.
//!
//! * [`dns`]: synthetic IPv4 addresses for overlay host names and the
//!   resolver interception that puts them in front of the system resolver.
//! * [`registry`]: loaded identity contexts and the dial router that picks
//!   the context serving a connection target.
//! * [`protocol`]: the wire constants the dial handshake relies on.
//!
//! Transports and credential stores plug in through the traits in
//! [`transport`] and [`identity`].

pub mod config;
pub mod context;
pub mod dns;
pub mod error;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

pub use context::{ContextState, Service, ZitiContext};
pub use dns::DnsManager;
pub use error::{Error, Result};
pub use registry::{ContextRegistry, RegistryOptions};
pub use transport::{DialDescriptor, DialTarget, OverlayConnection};
pub use types::{ContextServiceEvent, DnsEvent, IdentityEvent, IdentityEventType, ServiceEvent};
