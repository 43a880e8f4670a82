use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::error;

/// Path on the upstream decision service probed to validate an API key.
pub const DECISIONS_STREAM_PATH: &str = "/v1/decisions/stream";

/// Header carrying the API key on the upstream probe.
pub const LAPI_API_KEY_HEADER: &str = "x-api-key";

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Time-bounded positive cache of API-key validations. Only successful
/// validations are recorded; expired entries are ignored lazily rather than
/// swept.
#[derive(Default)]
pub struct AuthCache {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(key).copied()
    }

    pub async fn set(&self, key: String, expiration: DateTime<Utc>) {
        self.entries.write().await.insert(key, expiration);
    }
}

/// Single-shot HEAD probe against the upstream decision service. Any
/// transport error, timeout or non-200 status is an invalid key; failures
/// degrade to a 401 for the caller and are never propagated.
pub struct AuthProbe {
    client: Client,
    url: String,
}

impl AuthProbe {
    pub fn new(lapi_base: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        let url = format!(
            "{}{}",
            lapi_base.trim_end_matches('/'),
            DECISIONS_STREAM_PATH
        );
        Ok(Self { client, url })
    }

    pub async fn is_valid(&self, key: &str) -> bool {
        match self
            .client
            .head(&self.url)
            .header(LAPI_API_KEY_HEADER, key)
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                error!(status = %resp.status(), "upstream rejected api key");
                false
            }
            Err(err) => {
                error!(%err, "api key validation request failed");
                false
            }
        }
    }
}

/// Authentication state shared by all handler tasks: the positive cache, the
/// upstream probe and the configured TTL.
pub struct Authenticator {
    cache: AuthCache,
    probe: AuthProbe,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(probe: AuthProbe, ttl: Duration) -> Self {
        Self {
            cache: AuthCache::new(),
            probe,
            ttl,
        }
    }

    /// Validates an API key, consulting the cache before the upstream probe.
    /// A failed probe leaves the cache untouched so the next request probes
    /// again.
    pub async fn authenticate(&self, key: &str) -> bool {
        if let Some(expiration) = self.cache.get(key).await {
            if Utc::now() <= expiration {
                return true;
            }
        }
        if !self.probe.is_valid(key).await {
            return false;
        }
        self.cache.set(key.to_string(), Utc::now() + self.ttl).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn cache_returns_recorded_expiration() {
        let cache = AuthCache::new();
        let expiration = Utc::now() + ChronoDuration::seconds(30);
        cache.set("k1".into(), expiration).await;
        assert_eq!(cache.get("k1").await, Some(expiration));
        assert_eq!(cache.get("k2").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_still_visible_but_stale() {
        // Expiry is enforced by the caller; the cache itself never evicts.
        let cache = AuthCache::new();
        let expiration = Utc::now() - ChronoDuration::seconds(1);
        cache.set("k1".into(), expiration).await;
        let stored = cache.get("k1").await.expect("entry kept");
        assert!(stored < Utc::now());
    }
}
