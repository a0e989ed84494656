//! Virtual DNS: synthetic IPv4 addresses for overlay-only host names.
//!
//! Addresses are carved out of `100.64.0.0/16`. The two-byte suffix starts at
//! `1.1` and is bumped for every new name, skipping suffixes whose low byte is
//! zero. Bindings live until [`DnsManager::reset`]; there is no reclamation, so
//! running past `255.255` is a hard [`Error::AddressSpaceExhausted`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::{spawn_subscriber, EventBus, EventStream};
use crate::types::DnsEvent;

pub const PREFIX: [u8; 2] = [100, 64];
pub const START_POSTFIX: u32 = 0x0101;
const MAX_POSTFIX: u32 = 0xFFFF;

struct Bindings {
    /// Lower-cased name -> address.
    by_name: HashMap<String, Ipv4Addr>,
    /// Address -> name as first registered.
    by_addr: HashMap<Ipv4Addr, String>,
    postfix: u32,
}

impl Bindings {
    fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_addr: HashMap::new(),
            postfix: START_POSTFIX,
        }
    }

    fn next_addr(&mut self) -> Result<Ipv4Addr> {
        let mut next = self.postfix + 1;
        if next & 0xFF == 0 {
            next += 1;
        }
        if next > MAX_POSTFIX {
            return Err(Error::AddressSpaceExhausted);
        }
        self.postfix = next;
        Ok(Ipv4Addr::new(
            PREFIX[0],
            PREFIX[1],
            (next >> 8) as u8,
            (next & 0xFF) as u8,
        ))
    }

    fn snapshot(&self) -> Vec<DnsEvent> {
        let mut events: Vec<DnsEvent> = self
            .by_addr
            .iter()
            .map(|(ip, host)| DnsEvent {
                hostname: host.clone(),
                ip: IpAddr::V4(*ip),
                removed: false,
            })
            .collect();
        events.sort_by_key(|e| e.ip);
        events
    }
}

/// Process-wide virtual resolver. Share it behind an `Arc`.
pub struct DnsManager {
    bindings: RwLock<Bindings>,
    events: EventBus<DnsEvent>,
}

impl Default for DnsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsManager {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(Bindings::new()),
            events: EventBus::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the address bound to `hostname`, allocating one on first use.
    ///
    /// IP literals are parsed and returned as-is without creating a binding.
    pub fn register_hostname(&self, hostname: &str) -> Result<IpAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(ip);
        }

        let key = hostname.to_lowercase();
        let mut bindings = self.write();
        if let Some(ip) = bindings.by_name.get(&key) {
            return Ok(IpAddr::V4(*ip));
        }

        let ip = bindings.next_addr()?;
        bindings.by_name.insert(key, ip);
        bindings.by_addr.insert(ip, hostname.to_string());
        debug!("Registered virtual address {} for {}", ip, hostname);

        // Published under the write lock so snapshots stay exact.
        self.events.publish(DnsEvent {
            hostname: hostname.to_string(),
            ip: IpAddr::V4(ip),
            removed: false,
        });
        Ok(IpAddr::V4(ip))
    }

    pub fn resolve(&self, hostname: &str) -> Option<IpAddr> {
        self.read()
            .by_name
            .get(&hostname.to_lowercase())
            .map(|ip| IpAddr::V4(*ip))
    }

    /// Reverse lookup; yields the name with its registered casing.
    pub fn resolve_addr(&self, addr: IpAddr) -> Option<String> {
        match addr {
            IpAddr::V4(v4) => self.read().by_addr.get(&v4).cloned(),
            IpAddr::V6(v6) => {
                let v4 = v6.to_ipv4_mapped()?;
                self.read().by_addr.get(&v4).cloned()
            }
        }
    }

    /// Current bindings first, then every new allocation.
    pub fn subscribe(&self) -> EventStream<DnsEvent> {
        let bindings = self.read();
        self.events.subscribe_with_snapshot(bindings.snapshot())
    }

    pub fn subscribe_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(DnsEvent) + Send + 'static,
    {
        spawn_subscriber(self.subscribe(), callback)
    }

    /// Drops every binding and rewinds the cursor. Live subscribers receive a
    /// `removed` event per dropped binding.
    pub fn reset(&self) {
        let mut bindings = self.write();
        let dropped = bindings.snapshot();
        *bindings = Bindings::new();
        if !dropped.is_empty() {
            info!("Virtual DNS reset, {} bindings dropped", dropped.len());
        }
        for mut event in dropped {
            event.removed = true;
            self.events.publish(event);
        }
    }

    pub fn len(&self) -> usize {
        self.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        for event in self.read().snapshot() {
            let _ = writeln!(out, "{} -> {}", event.hostname, event.ip);
        }
        out
    }

    #[cfg(test)]
    fn set_cursor(&self, postfix: u32) {
        self.write().postfix = postfix;
    }
}
