//! Node configuration and per-program open options.

use crate::error::Result;
use crate::leaders::TrustFilter;
use mdrl_log::{Entry, EntryEncryption, TrimOptions};
use mdrl_net::SubscriptionRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Durations are written as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Node-wide settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Replicas per gid when a program does not choose its own.
    pub min_replicas: usize,
    /// Deadline for a single publish.
    #[serde(with = "millis")]
    pub exchange_timeout: Duration,
    /// Deadline for a block fetch.
    #[serde(with = "millis")]
    pub fetch_timeout: Duration,
    /// Transport events handled at once.
    pub max_concurrent_messages: usize,
    /// Leave outgoing exchange messages unsigned.
    pub limit_signing: bool,
    /// Share loopback addresses in swarm exchanges.
    pub local_network: bool,
    /// Ancestors sent along with each head.
    pub max_exchange_references: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            exchange_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(10),
            max_concurrent_messages: 64,
            limit_signing: false,
            local_network: false,
            max_exchange_references: 64,
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    /// Reads a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builder for [`NodeConfig`].
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn min_replicas(mut self, n: usize) -> Self {
        self.config.min_replicas = n;
        self
    }

    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.config.exchange_timeout = timeout;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn max_concurrent_messages(mut self, n: usize) -> Self {
        self.config.max_concurrent_messages = n;
        self
    }

    pub fn limit_signing(mut self, enabled: bool) -> Self {
        self.config.limit_signing = enabled;
        self
    }

    pub fn local_network(mut self, enabled: bool) -> Self {
        self.config.local_network = enabled;
        self
    }

    pub fn max_exchange_references(mut self, n: usize) -> Self {
        self.config.max_exchange_references = n;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether a received or held entry should be kept regardless of
/// leadership.
pub type SyncFilter<T> = Arc<dyn Fn(&Entry<T>) -> bool + Send + Sync>;

/// Options for [`Node::open`](crate::Node::open).
pub struct OpenOptions<T> {
    pub role: SubscriptionRole,
    /// Overrides [`NodeConfig::min_replicas`].
    pub min_replicas: Option<usize>,
    pub sync: Option<SyncFilter<T>>,
    /// Fail with `NotFound` instead of creating a program that has no manifest.
    pub local_only: bool,
    pub trim: Option<TrimOptions>,
    /// Number of stores in the program.
    pub stores: usize,
    pub encryption: EntryEncryption,
    pub trust: Option<Arc<dyn TrustFilter>>,
}

impl<T> Default for OpenOptions<T> {
    fn default() -> Self {
        OpenOptions {
            role: SubscriptionRole::Replicator,
            min_replicas: None,
            sync: None,
            local_only: false,
            trim: None,
            stores: 1,
            encryption: EntryEncryption::default(),
            trust: None,
        }
    }
}

impl<T> OpenOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: SubscriptionRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_min_replicas(mut self, n: usize) -> Self {
        self.min_replicas = Some(n);
        self
    }

    pub fn with_sync(mut self, sync: impl Fn(&Entry<T>) -> bool + Send + Sync + 'static) -> Self {
        self.sync = Some(Arc::new(sync));
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn with_trim(mut self, trim: TrimOptions) -> Self {
        self.trim = Some(trim);
        self
    }

    pub fn with_stores(mut self, stores: usize) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_encryption(mut self, encryption: EntryEncryption) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_trust(mut self, trust: Arc<dyn TrustFilter>) -> Self {
        self.trust = Some(trust);
        self
    }
}

impl<T> fmt::Debug for OpenOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("role", &self.role)
            .field("min_replicas", &self.min_replicas)
            .field("sync", &self.sync.is_some())
            .field("local_only", &self.local_only)
            .field("trim", &self.trim)
            .field("stores", &self.stores)
            .finish()
    }
}
