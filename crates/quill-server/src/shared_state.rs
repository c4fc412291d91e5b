//! Shared state service for the Quill Platform
//!
//! The rate limiter's primary path counts requests in a store that every
//! server instance can see. The store only has to offer an atomic
//! increment-with-expiry; everything else is optional.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};
use serde_json::{json, Value};

use quill_core::{Clock, CoreError, SystemClock};
use crate::error::{ServerError, ServerResult};

/// How often the in-memory store drops expired counters
const MEMORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A counting store shared across server instances
#[async_trait]
pub trait SharedStateService: Send + Sync {
    /// Atomically increment the counter at `scope_key`/`key` and return the new value.
    ///
    /// The first increment of a key sets its expiry to `ttl_ms`; later
    /// increments leave the expiry untouched.
    async fn increment_with_expiry(&self, scope_key: &str, key: &str, ttl_ms: u64) -> Result<u64, CoreError>;

    /// Get metrics about the shared state service usage
    async fn get_metrics(&self) -> Result<Value, CoreError> {
        Ok(json!({
            "type": "unknown",
            "scopes": 0,
            "keys": 0
        }))
    }

    /// Health check
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Counter in the in-memory shared state store
struct CounterEntry {
    count: u64,
    expires_at_ms: u64,
}

impl CounterEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

type ScopeMap = HashMap<String, HashMap<String, CounterEntry>>;

/// In-memory implementation of SharedStateService
///
/// Only shared between the tasks of one process; used for development,
/// single-instance deployments and tests.
pub struct InMemorySharedStateService {
    /// Map of scope -> (key -> counter)
    state: Arc<RwLock<ScopeMap>>,

    clock: Arc<dyn Clock>,
}

impl InMemorySharedStateService {
    /// Create a new in-memory shared state service on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory shared state service on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        info!("Creating new InMemorySharedStateService");
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Remove expired counters and empty scopes, returning how many keys were dropped
    pub async fn cleanup_expired(&self) -> usize {
        Self::cleanup(&self.state, self.clock.now_ms()).await
    }

    /// Spawn a background task that periodically removes expired counters
    pub fn start_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = Self::cleanup(&state, clock.now_ms()).await;
                if removed > 0 {
                    info!("Shared state cleanup removed {} expired keys", removed);
                }
            }
        })
    }

    async fn cleanup(state: &RwLock<ScopeMap>, now_ms: u64) -> usize {
        let mut state_lock = state.write().await;
        let mut total_removed = 0;

        for (scope_key, scope_map) in state_lock.iter_mut() {
            let before = scope_map.len();
            scope_map.retain(|_, entry| !entry.is_expired(now_ms));
            let removed = before - scope_map.len();

            if removed > 0 {
                debug!("Cleaned up {} expired keys in scope {}", removed, scope_key);
            }
            total_removed += removed;
        }

        state_lock.retain(|_, scope_map| !scope_map.is_empty());
        total_removed
    }
}

impl Default for InMemorySharedStateService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStateService for InMemorySharedStateService {
    async fn increment_with_expiry(&self, scope_key: &str, key: &str, ttl_ms: u64) -> Result<u64, CoreError> {
        let now = self.clock.now_ms();
        let mut state = self.state.write().await;

        let scope_map = state.entry(scope_key.to_string()).or_default();
        let entry = scope_map.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at_ms: now.saturating_add(ttl_ms),
        });

        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at_ms = now.saturating_add(ttl_ms);
        }

        entry.count += 1;
        debug!("Incremented shared counter scope={}, key={} to {}", scope_key, key, entry.count);
        Ok(entry.count)
    }

    async fn get_metrics(&self) -> Result<Value, CoreError> {
        let now = self.clock.now_ms();
        let state = self.state.read().await;

        let mut total_keys = 0;
        let mut active_keys = 0;
        for scope_map in state.values() {
            total_keys += scope_map.len();
            active_keys += scope_map.values().filter(|entry| !entry.is_expired(now)).count();
        }

        Ok(json!({
            "type": "in_memory",
            "scopes": state.len(),
            "total_keys": total_keys,
            "active_keys": active_keys,
            "expired_keys": total_keys - active_keys,
        }))
    }
}

// Redis implementation if the redis feature is enabled
#[cfg(feature = "redis")]
pub mod redis {
    use super::*;
    use ::redis::aio::ConnectionManager;
    use ::redis::{Client, RedisError, Script};
    use tokio::sync::OnceCell;

    const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3000;
    const KEY_PREFIX: &str = "quill:shared:";

    /// INCR and PEXPIRE in one server-side step so no client can observe a
    /// counter without an expiry.
    const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

    /// Redis connection configuration
    #[derive(Debug, Clone)]
    pub struct RedisConfig {
        /// Bound on establishing the shared connection, in milliseconds
        pub connection_timeout_ms: u64,
    }

    impl Default for RedisConfig {
        fn default() -> Self {
            Self {
                connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            }
        }
    }

    /// Redis implementation of SharedStateService
    ///
    /// All calls are multiplexed over one `ConnectionManager`, opened on
    /// first use and reconnected by the manager after a drop.
    pub struct RedisSharedStateService {
        client: Client,
        manager: OnceCell<ConnectionManager>,
        config: RedisConfig,
        increment: Script,
    }

    impl RedisSharedStateService {
        /// Create a new Redis shared state service
        pub fn new(redis_url: &str) -> Result<Self, RedisError> {
            Self::with_config(redis_url, RedisConfig::default())
        }

        /// Create a new Redis shared state service with custom connection settings
        pub fn with_config(redis_url: &str, config: RedisConfig) -> Result<Self, RedisError> {
            info!("Creating new RedisSharedStateService");

            Ok(Self {
                client: Client::open(redis_url)?,
                manager: OnceCell::new(),
                config,
                increment: Script::new(INCREMENT_SCRIPT),
            })
        }

        /// Handle on the shared connection, establishing it if needed
        async fn connection(&self) -> Result<ConnectionManager, CoreError> {
            let timeout_ms = self.config.connection_timeout_ms;
            let manager = self
                .manager
                .get_or_try_init(|| async {
                    match time::timeout(
                        Duration::from_millis(timeout_ms),
                        ConnectionManager::new(self.client.clone()),
                    )
                    .await
                    {
                        Ok(Ok(manager)) => {
                            info!("Redis connection manager established");
                            Ok(manager)
                        }
                        Ok(Err(e)) => Err(CoreError::StateStoreError(format!("Redis connection error: {}", e))),
                        Err(_) => Err(CoreError::Timeout(timeout_ms)),
                    }
                })
                .await?;

            Ok(manager.clone())
        }

        /// Format a Redis key from scope and key
        fn make_key(scope_key: &str, key: &str) -> String {
            format!("{}{}:{}", KEY_PREFIX, scope_key, key)
        }
    }

    #[async_trait]
    impl SharedStateService for RedisSharedStateService {
        async fn increment_with_expiry(&self, scope_key: &str, key: &str, ttl_ms: u64) -> Result<u64, CoreError> {
            let redis_key = Self::make_key(scope_key, key);
            let mut conn = self.connection().await?;

            let count: u64 = self.increment
                .key(&redis_key)
                .arg(ttl_ms.max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| CoreError::StateStoreError(format!("Redis increment error: {}", e)))?;

            debug!("Incremented Redis counter {} to {}", redis_key, count);
            Ok(count)
        }

        async fn get_metrics(&self) -> Result<Value, CoreError> {
            Ok(json!({
                "type": "redis",
                "connected": self.manager.initialized(),
            }))
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            let mut conn = self.connection().await.map_err(|e| {
                error!("Redis health check failed: {}", e);
                e
            })?;

            let ping: String = ::redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    error!("Redis PING failed: {}", e);
                    CoreError::StateStoreError(format!("Redis ping error: {}", e))
                })?;

            Ok(ping == "PONG")
        }
    }

}

/// Factory function to create a SharedStateService based on URL
pub fn create_shared_state_service(url: &str) -> ServerResult<Arc<dyn SharedStateService>> {
    if url.starts_with("memory://") {
        info!("Creating in-memory shared state service");
        let service = InMemorySharedStateService::new();
        // Detached; lives as long as the runtime.
        service.start_cleanup(MEMORY_CLEANUP_INTERVAL);
        Ok(Arc::new(service))
    } else if url.starts_with("redis://") || url.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        {
            info!("Creating Redis shared state service");
            let service = redis::RedisSharedStateService::new(url)
                .map_err(|e| ServerError::StateServiceError(format!("Redis init error: {}", e)))?;
            Ok(Arc::new(service))
        }

        #[cfg(not(feature = "redis"))]
        {
            error!("Redis shared state service requested but 'redis' feature not enabled");
            Err(ServerError::StateServiceError(
                "Redis shared state service requested but 'redis' feature not enabled".to_string()
            ))
        }
    } else {
        error!("Unsupported shared state service URL: {}", url);
        Err(ServerError::StateServiceError(format!(
            "Unsupported shared state service URL: {}", url
        )))
    }
}
