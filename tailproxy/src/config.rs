use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_HOSTNAME: &str = "tailproxy";
pub const DEFAULT_PROXY_PORT: u16 = 1080;
pub const DEFAULT_EXPORT_MAX: usize = 32;

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exit_node: String,
    #[serde(default)]
    pub control_url: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub authkey: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub export_listeners: bool,
    #[serde(default)]
    pub export_allow_ports: String,
    #[serde(default)]
    pub export_deny_ports: String,
    #[serde(default = "default_export_max")]
    pub export_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exit_node: String::new(),
            control_url: String::new(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            authkey: String::new(),
            proxy_port: DEFAULT_PROXY_PORT,
            verbose: false,
            export_listeners: false,
            export_allow_ports: String::new(),
            export_deny_ports: String::new(),
            export_max: DEFAULT_EXPORT_MAX,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_export_max() -> usize {
    DEFAULT_EXPORT_MAX
}
