//! Authoritative-zone knowledge.
//!
//! Two pieces: the zone cache the router consults to decide whether a name
//! outside the fixed suffixes is served by our authoritative pool, and the
//! loader for the sibling application's server inventory that the
//! authoritative pool itself is discovered from.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::Deserialize;
use tracing::debug;

/// Zone apexes this deployment is authoritative for.
pub struct ZoneCache {
    apexes: Vec<String>,
}

impl ZoneCache {
    pub fn new(apexes: &[String]) -> Self {
        Self {
            apexes: apexes
                .iter()
                .map(|z| z.trim_end_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Whether `name` falls under one of our zone apexes. Matching is
    /// case-insensitive and on label boundaries only.
    pub fn get_authority(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        self.apexes
            .iter()
            .any(|apex| name == *apex || name.ends_with(&format!(".{}", apex)))
    }
}

#[derive(Debug, Deserialize)]
struct ServerInventory {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    address: String,
    port: Option<u16>,
    family: Option<String>,
}

/// Read the sibling application's server inventory from `path`.
pub fn load_zone_servers(path: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read server inventory '{}': {}", path, e))?;
    parse_zone_servers(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse server inventory '{}': {}", path, e))
}

/// Keep only entries with family `inet`, an integer port, and an address that
/// parses as IPv4; anything else is dropped.
pub fn parse_zone_servers(content: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let inventory: ServerInventory = toml::from_str(content)?;

    let mut servers = Vec::with_capacity(inventory.servers.len());
    for entry in inventory.servers {
        if entry.family.as_deref() != Some("inet") {
            debug!("skipping non-inet server entry {}", entry.address);
            continue;
        }
        let Some(port) = entry.port else {
            debug!("skipping server entry {} without a port", entry.address);
            continue;
        };
        match entry.address.parse::<Ipv4Addr>() {
            Ok(ip) => servers.push(SocketAddr::V4(SocketAddrV4::new(ip, port))),
            Err(_) => debug!("skipping server entry with bad address {}", entry.address),
        }
    }
    Ok(servers)
}
