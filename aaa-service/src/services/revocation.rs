//! Revocation tombstones: per-token and per-user, with TTLs matched to
//! token expiry.

use async_trait::async_trait;
use redis::{Client, aio::ConnectionManager};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Tombstone one token id until its natural expiry.
    async fn revoke_token(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error>;
    async fn is_token_revoked(&self, jti: &str) -> Result<bool, anyhow::Error>;
    /// Tombstone every token of a user issued at or before `issued_cutoff`
    /// (Unix seconds).
    async fn revoke_user(
        &self,
        user_id: &str,
        issued_cutoff: i64,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error>;
    /// The user's revocation cutoff, if one is in force.
    async fn user_revocation_cutoff(&self, user_id: &str) -> Result<Option<i64>, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisRevocationStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisRevocationStore {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url.to_string())?;

        // ConnectionManager reconnects automatically.
        let manager = client.get_connection_manager().await?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn revoke_token(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked_token:{}", jti);
        redis::cmd("SET")
            .arg(&key)
            .arg("revoked")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to revoke token: {}", e))
    }

    async fn is_token_revoked(&self, jti: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked_token:{}", jti);
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check revocation: {}", e))?;
        Ok(exists)
    }

    async fn revoke_user(
        &self,
        user_id: &str,
        issued_cutoff: i64,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked_user:{}", user_id);
        redis::cmd("SET")
            .arg(&key)
            .arg(issued_cutoff)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to revoke user tokens: {}", e))
    }

    async fn user_revocation_cutoff(&self, user_id: &str) -> Result<Option<i64>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("revoked_user:{}", user_id);
        let value: Option<i64> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read user revocation: {}", e))?;
        Ok(value)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Process-local store used in tests and embedded deployments.
#[derive(Default)]
pub struct MemoryRevocationStore {
    tokens: Mutex<HashMap<String, Instant>>,
    users: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn revoke_token(&self, jti: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let expiry = Instant::now() + Duration::from_secs(ttl_seconds.max(1) as u64);
        self.tokens.lock().unwrap().insert(jti.to_string(), expiry);
        Ok(())
    }

    async fn is_token_revoked(&self, jti: &str) -> Result<bool, anyhow::Error> {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.get(jti) {
            Some(expiry) if *expiry > Instant::now() => Ok(true),
            Some(_) => {
                tokens.remove(jti);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn revoke_user(
        &self,
        user_id: &str,
        issued_cutoff: i64,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let expiry = Instant::now() + Duration::from_secs(ttl_seconds.max(1) as u64);
        self.users
            .lock()
            .unwrap()
            .insert(user_id.to_string(), (issued_cutoff, expiry));
        Ok(())
    }

    async fn user_revocation_cutoff(&self, user_id: &str) -> Result<Option<i64>, anyhow::Error> {
        let mut users = self.users.lock().unwrap();
        match users.get(user_id) {
            Some((cutoff, expiry)) if *expiry > Instant::now() => Ok(Some(*cutoff)),
            Some(_) => {
                users.remove(user_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
