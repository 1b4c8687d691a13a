//! Bonjour discovery by parsing the host's mDNS browse tool output.
//!
//! Apple TVs advertise `_remotepairing._tcp` over mDNS. Rather than linking
//! a resolver, the browse tool's textual output is parsed line by line:
//!
//! ```text
//! Timestamp     A/R    Flags  if Domain   Service Type          Instance Name
//! 14:21:17.390  Add        2   6 local.   _remotepairing._tcp.  58:D3:49:DD:02:C4
//! 14:22:40.114  Rmv        0   6 local.   _remotepairing._tcp.  58:D3:49:DD:02:C4
//! ```

use std::collections::HashSet;

/// Identity of one discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BonjourServiceKey {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub interface_index: u32,
}

/// Discovery events emitted as browse output is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BonjourEvent {
    ServiceAdded(BonjourServiceKey),
    ServiceRemoved(BonjourServiceKey),
}

/// Tracks the set of currently visible services.
#[derive(Debug, Default)]
pub struct BonjourBrowser {
    services: HashSet<BonjourServiceKey>,
}

impl BonjourBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line of browse output.
    ///
    /// Header and status lines return `None`, as do repeated adds and
    /// removals of services that were never seen.
    pub fn parse_line(&mut self, line: &str) -> Option<BonjourEvent> {
        let mut fields = line.split_whitespace();
        let _timestamp = fields.next()?;
        let action = fields.next()?;
        if action != "Add" && action != "Rmv" {
            return None;
        }
        let _flags = fields.next()?;
        let interface_index: u32 = fields.next()?.parse().ok()?;
        let domain = fields.next()?.to_string();
        let service_type = fields.next()?.to_string();
        // instance names may contain spaces
        let name = fields.collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return None;
        }

        let key = BonjourServiceKey {
            name,
            service_type,
            domain,
            interface_index,
        };
        if action == "Add" {
            self.services
                .insert(key.clone())
                .then_some(BonjourEvent::ServiceAdded(key))
        } else {
            self.services
                .remove(&key)
                .then_some(BonjourEvent::ServiceRemoved(key))
        }
    }

    /// Everything currently visible.
    pub fn services(&self) -> &HashSet<BonjourServiceKey> {
        &self.services
    }
}
