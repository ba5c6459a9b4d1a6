use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;

use crate::{Client, CustomRedisError};

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient with explicit timeouts.
    ///
    /// * `response_timeout` - timeout for command responses. `None` blocks indefinitely.
    /// * `connection_timeout` - timeout for establishing the connection. `None` blocks indefinitely.
    ///
    /// Returns `CustomRedisError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        if response_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }
        if connection_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CustomRedisError::InvalidConfiguration(
                "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                    .to_string(),
            ));
        }

        let client = redis::Client::open(addr)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(k, v, seconds).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        // SET with both NX and EX in a single round trip, so the key can never exist without a TTL
        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("EX")
            .arg(seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(k).await?;
        Ok(())
    }
}
