//! Asynchronous name resolution contract.
//!
//! Callers hand the resolver a target and a continuation; the
//! continuation fires with the resolved addresses or the failure. The
//! system resolver is external — the [`StaticResolver`] here serves
//! literal addresses and a configured table, optionally deferring
//! completions through the endpoint's event queue so they are delivered
//! from the poll loop like any other I/O.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::ioqueue::EventQueue;
use crate::msg::HostPort;

/// Continuation invoked with the resolution outcome.
pub type ResolveCallback = Box<dyn FnOnce(Result<Vec<SocketAddr>>) + Send>;

/// Asynchronous resolver.
///
/// Completions cannot be cancelled individually; a caller that loses
/// interest ignores the late continuation with its own token.
pub trait Resolver: Send + Sync {
    fn resolve(&self, target: &HostPort, cb: ResolveCallback);
}

/// Table-backed resolver for literals and configured names.
pub struct StaticResolver {
    table: Mutex<HashMap<String, Vec<IpAddr>>>,
    queue: Option<Arc<EventQueue>>,
}

impl StaticResolver {
    /// A resolver that completes continuations inline.
    pub fn new() -> Self {
        StaticResolver {
            table: Mutex::new(HashMap::new()),
            queue: None,
        }
    }

    /// A resolver that defers continuations through `queue`, so they run
    /// from the endpoint poll loop.
    pub fn with_queue(queue: Arc<EventQueue>) -> Self {
        StaticResolver {
            table: Mutex::new(HashMap::new()),
            queue: Some(queue),
        }
    }

    /// Map a name to addresses.
    pub fn insert(&self, name: &str, addrs: Vec<IpAddr>) {
        self.table
            .lock()
            .unwrap()
            .insert(name.to_ascii_lowercase(), addrs);
    }

    fn lookup(&self, target: &HostPort) -> Result<Vec<SocketAddr>> {
        let port = target.port_or(5060);

        if let Ok(ip) = target.host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let table = self.table.lock().unwrap();
        match table.get(&target.host.to_ascii_lowercase()) {
            Some(addrs) if !addrs.is_empty() => {
                Ok(addrs.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            }
            _ => Err(Error::NotFound("resolver target")),
        }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, target: &HostPort, cb: ResolveCallback) {
        let outcome = self.lookup(target);
        match &self.queue {
            Some(queue) => queue.push(move || cb(outcome)),
            None => cb(outcome),
        }
    }
}
