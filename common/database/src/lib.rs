use std::{str::FromStr, time::Duration};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

// Write-path defaults. A single ingestion is a handful of statements, so anything
// slower than this is a stuck lock or an overloaded server and should fail fast.
pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    statement_timeout: Duration::from_secs(2),
    lock_timeout: Duration::from_millis(500),
    acquire_timeout: Duration::from_millis(500),
    idle_timeout: Duration::from_secs(300),
    max_lifetime: Duration::from_secs(1800),
    idle_in_transaction_session_timeout: Duration::from_secs(15),
};

#[derive(Debug, Clone)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_in_transaction_session_timeout: Duration,
}

impl DatabaseTimeouts {
    /// Session-level SET statements issued on every new connection.
    /// PostgreSQL SET commands don't accept bind parameters, hence the formatting.
    pub fn session_statements(&self) -> Vec<String> {
        vec![
            format!(
                "SET statement_timeout = '{}ms'",
                saturating_millis(self.statement_timeout)
            ),
            format!(
                "SET lock_timeout = '{}ms'",
                saturating_millis(self.lock_timeout)
            ),
            format!(
                "SET idle_in_transaction_session_timeout = '{}ms'",
                saturating_millis(self.idle_in_transaction_session_timeout)
            ),
        ]
    }
}

fn saturating_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Build a lazily-connecting pool whose connections carry the given session timeouts.
/// Nothing is dialed until the first acquire, so a database that is down at boot
/// surfaces as request errors instead of a crash loop.
pub async fn get_pool_with_timeouts(
    url: &str,
    max_connections: u32,
    app_name: &'static str,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(url)?.application_name(app_name);
    let statements = timeouts.session_statements();

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        .idle_timeout(timeouts.idle_timeout)
        .max_lifetime(timeouts.max_lifetime)
        .after_connect(move |conn, _meta| {
            let statements = statements.clone();
            Box::pin(async move {
                for statement in &statements {
                    sqlx::query(statement).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_lazy_with(options);

    Ok(pool)
}
