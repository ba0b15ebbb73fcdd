use std::time::Duration;

use serde::Deserialize;

use crate::client::SessionPolicy;
use crate::persistence::StoreBackend;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the membership hub and the store.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub store: StoreSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to and the default log level.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

/// Configuration settings for connection lifecycle and broadcast.
#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    pub session_policy: SessionPolicy,
    /// Topics every client joins when it connects.
    pub default_topics: Vec<String>,
    /// Membership expiry refreshed on every join. `0` disables expiry.
    pub topic_ttl_secs: u64,
    pub send_timeout_ms: u64,
    /// Whether a member whose sends all time out is evicted like a dead one.
    pub evict_on_timeout: bool,
    /// Frames buffered per connection before sends start waiting.
    pub outbound_buffer: usize,
    /// Refresh a reconnecting client's surviving memberships on open.
    pub restore_memberships: bool,
    pub publish_requires_membership: bool,
}

impl HubSettings {
    pub fn topic_ttl(&self) -> Option<Duration> {
        (self.topic_ttl_secs > 0).then(|| Duration::from_secs(self.topic_ttl_secs))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Configuration settings for the membership store backend.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Database directory for the `sled` backend.
    pub path: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub hub: Option<PartialHubSettings>,
    pub store: Option<PartialStoreSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialHubSettings {
    pub session_policy: Option<SessionPolicy>,
    pub default_topics: Option<Vec<String>>,
    pub topic_ttl_secs: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub evict_on_timeout: Option<bool>,
    pub outbound_buffer: Option<usize>,
    pub restore_memberships: Option<bool>,
    pub publish_requires_membership: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                log_level: "info".to_string(),
            },
            hub: HubSettings {
                session_policy: SessionPolicy::Multi,
                default_topics: Vec::new(),
                topic_ttl_secs: 86_400,
                send_timeout_ms: 2_000,
                evict_on_timeout: false,
                outbound_buffer: 256,
                restore_memberships: true,
                publish_requires_membership: false,
            },
            store: StoreSettings {
                backend: StoreBackend::Memory,
                path: "roomcast_db".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `Settings::default()`.
    pub fn merge_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server;
        let hub = self.hub;
        let store = self.store;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                log_level: server
                    .as_ref()
                    .and_then(|s| s.log_level.clone())
                    .unwrap_or(default.server.log_level),
            },
            hub: HubSettings {
                session_policy: hub
                    .as_ref()
                    .and_then(|h| h.session_policy)
                    .unwrap_or(default.hub.session_policy),
                default_topics: hub
                    .as_ref()
                    .and_then(|h| h.default_topics.clone())
                    .unwrap_or(default.hub.default_topics),
                topic_ttl_secs: hub
                    .as_ref()
                    .and_then(|h| h.topic_ttl_secs)
                    .unwrap_or(default.hub.topic_ttl_secs),
                send_timeout_ms: hub
                    .as_ref()
                    .and_then(|h| h.send_timeout_ms)
                    .unwrap_or(default.hub.send_timeout_ms),
                evict_on_timeout: hub
                    .as_ref()
                    .and_then(|h| h.evict_on_timeout)
                    .unwrap_or(default.hub.evict_on_timeout),
                outbound_buffer: hub
                    .as_ref()
                    .and_then(|h| h.outbound_buffer)
                    .unwrap_or(default.hub.outbound_buffer),
                restore_memberships: hub
                    .as_ref()
                    .and_then(|h| h.restore_memberships)
                    .unwrap_or(default.hub.restore_memberships),
                publish_requires_membership: hub
                    .as_ref()
                    .and_then(|h| h.publish_requires_membership)
                    .unwrap_or(default.hub.publish_requires_membership),
            },
            store: StoreSettings {
                backend: store
                    .as_ref()
                    .and_then(|s| s.backend)
                    .unwrap_or(default.store.backend),
                path: store
                    .as_ref()
                    .and_then(|s| s.path.clone())
                    .unwrap_or(default.store.path),
            },
        }
    }
}
