//! Event types published by the SDK core.
//!
//! All three kinds travel over an [`EventBus`](crate::events::EventBus) and
//! serialise with [`serde`](https://serde.rs/) so hosts can forward them to
//! their own UI or logs.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{Service, ZitiContext};

/// A hostname binding in the virtual resolver.
///
/// `hostname` keeps the casing it was first registered with. `removed` is
/// reserved for bulk resets; allocations always carry `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEvent {
    pub hostname: String,
    pub ip: IpAddr,
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityEventType {
    Loaded,
    Removed,
}

/// Context lifecycle notification.
#[derive(Debug, Clone)]
pub struct IdentityEvent {
    pub kind: IdentityEventType,
    pub context: Arc<ZitiContext>,
}

impl IdentityEvent {
    pub fn loaded(context: Arc<ZitiContext>) -> Self {
        Self {
            kind: IdentityEventType::Loaded,
            context,
        }
    }

    pub fn removed(context: Arc<ZitiContext>) -> Self {
        Self {
            kind: IdentityEventType::Removed,
            context,
        }
    }
}

/// A change in one context's service catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEvent {
    Available(Service),
    Changed(Service),
    Unavailable(Service),
}

impl ServiceEvent {
    pub fn service(&self) -> &Service {
        match self {
            ServiceEvent::Available(s)
            | ServiceEvent::Changed(s)
            | ServiceEvent::Unavailable(s) => s,
        }
    }
}

/// A service event tagged with the context that produced it.
#[derive(Debug, Clone)]
pub struct ContextServiceEvent {
    pub context: Arc<ZitiContext>,
    pub event: ServiceEvent,
}
