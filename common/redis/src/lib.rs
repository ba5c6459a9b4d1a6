use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Returns `true` for configuration errors and permanent failures,
    /// `false` for transient network/connection issues that may resolve on retry.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            CustomRedisError::Timeout => false,
            CustomRedisError::InvalidConfiguration(_) => true,
            CustomRedisError::Redis(err) => {
                matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) || err.is_unrecoverable_error()
            }
        }
    }
}

/// The small subset of redis commands needed for TTL-bounded coordination keys.
/// Values are plain UTF-8 strings.
#[async_trait]
pub trait Client {
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    /// `SET k v EX seconds NX`. Returns `true` if this call created the key.
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64)
        -> Result<bool, CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};
