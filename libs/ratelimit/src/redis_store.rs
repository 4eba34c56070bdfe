use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use time::OffsetDateTime;

use crate::{Admission, WindowStore};

const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  allowed = 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, oldest_ms}
"#;

/// Window store shared by every relay process through one sorted set per key.
pub struct RedisWindowStore {
    namespace: String,
    connection: ConnectionManager,
    script: Script,
}

impl RedisWindowStore {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            namespace: namespace.into(),
            connection,
            script: Script::new(SLIDING_WINDOW_LUA),
        })
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:ratelimit:{}", self.namespace, key)
    }
}

fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: OffsetDateTime,
    ) -> Result<Admission> {
        let now_ms = unix_ms(now);
        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());
        let mut conn = self.connection.clone();
        let (allowed, oldest_ms): (i64, i64) = self
            .script
            .key(self.window_key(key))
            .arg(now_ms)
            .arg(window.as_millis() as i64)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        let oldest = if oldest_ms >= 0 {
            Some(OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(oldest_ms) * 1_000_000,
            )?)
        } else {
            None
        };
        Ok(Admission {
            allowed: allowed == 1,
            oldest,
        })
    }
}
