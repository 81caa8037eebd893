use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardConfig {
    /// Service-discovery resolver pool (`*.mesos`). May be empty.
    #[serde(default)]
    pub mesos_resolvers: Vec<String>,
    /// Public-internet resolver pool. Duplicate entries are kept on purpose:
    /// they weight the per-query sampling.
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<String>,
    /// Server inventory of the sibling application that serves our
    /// authoritative zones (`*.zk`, `*.spartan`, and zone-cache hits).
    #[serde(default)]
    pub zone_servers_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ZonesConfig {
    /// Zone apexes this deployment is authoritative for.
    #[serde(default)]
    pub authoritative: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            mesos_resolvers: Vec::new(),
            resolvers: default_resolvers(),
            zone_servers_file: None,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            address: default_web_address(),
            port: default_web_port(),
        }
    }
}

// Default value functions
fn default_listen_address() -> String { "0.0.0.0".to_string() }
fn default_listen_port() -> u16 { 53 }
fn default_true() -> bool { true }
fn default_web_address() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8053 }

fn default_resolvers() -> Vec<String> {
    // Triplicated on purpose: duplicates weight the per-query sampling.
    vec![
        "8.8.8.8:53".to_string(),
        "4.2.2.1:53".to_string(),
        "8.8.8.8:53".to_string(),
        "4.2.2.1:53".to_string(),
        "8.8.8.8:53".to_string(),
    ]
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))?;
        Ok(config)
    }
}
