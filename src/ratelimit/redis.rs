//! Redis-backed rate-limit store.
//!
//! Maps the store operations onto one sorted set per key: timestamps are
//! both score and member, so insertion keeps them ordered and duplicate
//! hits within the same nanosecond collapse into one member.

use crate::error::{MeshError, Result};
use crate::ratelimit::store::RateStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| MeshError::InvalidConfig(format!("redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("redis connection: {e}")))
    }
}

#[async_trait]
impl RateStore for RedisStore {
    async fn remove_old_records(&self, key: &str, from: i64, to: i64) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(from)
            .arg(to)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("redis zremrangebyscore: {e}")))
    }

    async fn count_records(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;

        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("redis zcard: {e}")))
    }

    async fn add_record(&self, key: &str, at: i64) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("ZADD")
            .arg(key)
            .arg(at)
            .arg(at.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("redis zadd: {e}")))
    }

    async fn expire_key(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("redis expire: {e}")))
    }
}
