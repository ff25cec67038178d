//! Named proxy instances
//!
//! The registry owns the configurations it was created with and builds the
//! matching [`ProxyInstance`] the first time a name is requested. Every later
//! request for that name gets the same `Arc`.

use crate::config::{Config, ProxyConfig};
use crate::error::{Error, Result};
use crate::instance::ProxyInstance;
use crate::pool::PoolConfig;
use crate::transport::Transport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum TransportSource {
    /// One transport shared by every instance
    Shared(Arc<dyn Transport>),
    /// A fresh pool per instance with these settings
    PerInstance(PoolConfig),
}

pub struct InstanceRegistry {
    /// Configurations by proxy name, fixed at construction
    configs: HashMap<String, Arc<ProxyConfig>>,
    /// Built instances by proxy name, written once per name
    instances: DashMap<String, Arc<ProxyInstance>>,
    /// Where built instances get their transport from
    transport: TransportSource,
    /// Number of successful builds
    builds: AtomicUsize,
}

impl InstanceRegistry {
    pub fn new(configs: HashMap<String, ProxyConfig>) -> Self {
        Self::with_pool_config(configs, PoolConfig::default())
    }

    /// Create a registry whose instances each get a pool built from `pool`
    pub fn with_pool_config(configs: HashMap<String, ProxyConfig>, pool: PoolConfig) -> Self {
        Self::with_parts(configs, TransportSource::PerInstance(pool))
    }

    /// Create a registry whose instances all forward through `transport`
    pub fn with_transport(configs: HashMap<String, ProxyConfig>, transport: Arc<dyn Transport>) -> Self {
        Self::with_parts(configs, TransportSource::Shared(transport))
    }

    /// Create a registry from a loaded config, using its `[server]` pool settings
    pub fn from_config(config: &Config) -> Self {
        let pool = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            request_timeout: None,
        };
        Self::with_pool_config(config.proxies.clone(), pool)
    }

    fn with_parts(configs: HashMap<String, ProxyConfig>, transport: TransportSource) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|(name, config)| (name, Arc::new(config)))
                .collect(),
            instances: DashMap::new(),
            transport,
            builds: AtomicUsize::new(0),
        }
    }

    /// Whether a configuration is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Registered proxy names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of instances built so far
    pub fn built_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Get the instance for `name`, building and caching it on first use.
    ///
    /// Concurrent first calls for the same name are serialised on the map
    /// entry, so at most one instance is ever built per name.
    pub fn make(&self, name: &str) -> Result<Arc<ProxyInstance>> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(Arc::clone(instance.value()));
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| Error::UnknownProxy(name.to_string()))?;

        match self.instances.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let built = match &self.transport {
                    TransportSource::Shared(transport) => {
                        ProxyInstance::build_with_transport(Arc::clone(config), Arc::clone(transport))
                    }
                    TransportSource::PerInstance(pool) => {
                        ProxyInstance::build_with_pool_config(Arc::clone(config), pool.clone())
                    }
                };

                let instance = match built {
                    Ok(instance) => Arc::new(instance),
                    Err(e) => {
                        warn!(proxy = name, error = %e, "Failed to build proxy instance");
                        return Err(Error::InstanceCreationFailed {
                            name: name.to_string(),
                            source: Box::new(e),
                        });
                    }
                };

                self.builds.fetch_add(1, Ordering::SeqCst);
                info!(proxy = name, host = %config.host, "Proxy instance built");
                entry.insert(Arc::clone(&instance));
                Ok(instance)
            }
        }
    }
}
