//! Process-local cache of active device tunnels.
//!
//! The registry does not open or close tunnels itself; whoever owns the
//! control plane registers and deregisters. Mutations hold an exclusive
//! lock and refresh the registry-wide `last_updated` stamp; readers take a
//! consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One registered tunnel, exactly one per UDID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRegistryEntry {
    pub udid: String,
    pub device_id: u32,
    pub address: String,
    pub rsd_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_stream_port: Option<u16>,
    pub connection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub last_updated: DateTime<Utc>,
    pub total_tunnels: usize,
    pub active_tunnels: usize,
}

/// The tunnel table plus its metadata.
#[derive(Debug)]
pub struct TunnelRegistry {
    entries: HashMap<String, TunnelRegistryEntry>,
    last_updated: DateTime<Utc>,
}

/// Shared handle; the HTTP API and the tunnel owner both hold one.
pub type SharedRegistry = Arc<RwLock<TunnelRegistry>>;

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Inserts or replaces the entry for `entry.udid`, returning the stored
    /// record with its timestamps filled in.
    pub fn upsert(&mut self, mut entry: TunnelRegistryEntry) -> TunnelRegistryEntry {
        let now = Utc::now();
        let created_at = self
            .entries
            .get(&entry.udid)
            .and_then(|existing| existing.created_at)
            .or(entry.created_at)
            .unwrap_or(now);
        entry.created_at = Some(created_at);
        entry.last_updated = Some(now);
        self.last_updated = now;
        self.entries.insert(entry.udid.clone(), entry.clone());
        entry
    }

    pub fn get(&self, udid: &str) -> Option<&TunnelRegistryEntry> {
        self.entries.get(udid)
    }

    /// The first entry matching a mux device id.
    pub fn get_by_device_id(&self, device_id: u32) -> Option<&TunnelRegistryEntry> {
        self.entries
            .values()
            .find(|entry| entry.device_id == device_id)
    }

    pub fn remove(&mut self, udid: &str) -> Option<TunnelRegistryEntry> {
        let removed = self.entries.remove(udid);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    pub fn entries(&self) -> &HashMap<String, TunnelRegistryEntry> {
        &self.entries
    }

    pub fn metadata(&self) -> RegistryMetadata {
        RegistryMetadata {
            last_updated: self.last_updated,
            total_tunnels: self.entries.len(),
            active_tunnels: self.entries.len(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_entry(udid: &str, device_id: u32) -> TunnelRegistryEntry {
    TunnelRegistryEntry {
        udid: udid.to_string(),
        device_id,
        address: "fd7b:cf9:99e2::1".to_string(),
        rsd_port: 58783,
        packet_stream_port: None,
        connection_type: "USB".to_string(),
        product_id: Some(4776),
        created_at: None,
        last_updated: None,
    }
}
