//! Virtual DNS and resolver interception.

pub mod manager;
pub mod name_service;

pub use manager::DnsManager;
pub use name_service::{
    install, installed, lookup_addr, lookup_host, uninstall, InterceptingNameService, NameService,
    SystemNameService,
};
