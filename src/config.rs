use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Named upstream configurations
    #[serde(default)]
    pub proxies: HashMap<String, ProxyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Proxy used when the Host header matches no route
    pub default_proxy: Option<String>,

    /// Hostname to proxy name
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            default_proxy: None,
            routes: HashMap::new(),
        }
    }
}

/// Configuration of a single named upstream.
///
/// Field names follow the serialized form (`keepRequestHeaders`, ...), so the
/// same value can be produced from TOML, JSON or YAML by the surrounding loader.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Absolute URL prefix of the upstream, e.g. `https://api.example.com`
    #[serde(default)]
    pub host: String,

    /// Request timeout in seconds, 0 disables it
    #[serde(default)]
    pub timeout: u64,

    /// Inbound path (without leading `/`) to an absolute override URL or a
    /// replacement path
    #[serde(default)]
    pub mapping: HashMap<String, String>,

    /// Request headers forwarded upstream; empty keeps everything
    #[serde(default)]
    pub keep_request_headers: Vec<String>,

    /// Response headers relayed back; empty keeps everything
    #[serde(default)]
    pub keep_response_headers: Vec<String>,
}

impl ProxyConfig {
    /// Create a config pointing at `host` with everything else defaulted
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// Add a path mapping (builder pattern)
    pub fn with_mapping(mut self, from: &str, to: &str) -> Self {
        self.mapping.insert(from.to_string(), to.to_string());
        self
    }

    /// Set the request header allow-list (builder pattern)
    pub fn with_request_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_request_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the response header allow-list (builder pattern)
    pub fn with_response_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_response_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timeout in seconds (builder pattern)
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Request timeout, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    /// Whether the host carries an `http://` or `https://` scheme
    pub fn has_valid_host(&self) -> bool {
        has_http_scheme(&self.host)
    }

    /// Validate the proxy configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if !self.has_valid_host() {
            return Err(format!(
                "Proxy '{}': 'host' must start with http:// or https:// (got '{}')",
                name, self.host
            ));
        }
        Ok(())
    }
}

pub(crate) fn has_http_scheme(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per upstream
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.proxies.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.proxies[name].validate(name) {
                errors.push(e);
            }
        }

        let mut hosts: Vec<&String> = self.server.routes.keys().collect();
        hosts.sort();
        for host in hosts {
            let target = &self.server.routes[host];
            if !self.proxies.contains_key(target) {
                errors.push(format!(
                    "Route '{}': unknown proxy '{}'",
                    host, target
                ));
            }
        }

        if let Some(ref name) = self.server.default_proxy {
            if !self.proxies.contains_key(name) {
                errors.push(format!("default_proxy: unknown proxy '{}'", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
