//! Server configuration: a JSON file, overridable by command-line flags.

use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

fn default_port() -> u16 {
    2466
}

fn default_db() -> String {
    "mem".into()
}

fn default_workers() -> usize {
    1
}

fn default_idle_timeout() -> f64 {
    120.0
}

fn default_max_anonymous_per_ip() -> usize {
    8
}

fn default_motd() -> String {
    "hetu".into()
}

fn default_client_limits() -> Vec<(u64, f64)> {
    vec![(120, 60.0), (10, 1.0)]
}

fn default_server_limits() -> Vec<(u64, f64)> {
    vec![(1200, 60.0), (100, 1.0)]
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub namespace: String,
    pub instance: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Storage engine url. `mem` selects the embedded engine.
    #[serde(default = "default_db")]
    pub db: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub head: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
    #[serde(default = "default_max_anonymous_per_ip")]
    pub max_anonymous_per_ip: usize,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_client_limits")]
    pub client_limits: Vec<(u64, f64)>,
    #[serde(default = "default_server_limits")]
    pub server_limits: Vec<(u64, f64)>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn bare(namespace: String, instance: String) -> Config {
        Config {
            namespace,
            instance,
            port: default_port(),
            db: default_db(),
            workers: default_workers(),
            head: false,
            debug: false,
            idle_timeout: default_idle_timeout(),
            max_anonymous_per_ip: default_max_anonymous_per_ip(),
            motd: default_motd(),
            client_limits: default_client_limits(),
            server_limits: default_server_limits(),
        }
    }
}
