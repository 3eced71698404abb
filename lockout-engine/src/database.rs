//! PostgreSQL connection pool for the audit trail

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::{
    config::DatabaseConfig,
    error::{Error, Result},
};

/// Create a PostgreSQL connection pool with retry logic
///
/// Uses exponential backoff between attempts, starting at `retry_delay_secs`.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to audit database after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay.saturating_mul(2_u32.saturating_pow(attempt - 1));
                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            Error::Storage(format!(
                "Failed to connect to audit database at '{}' ({}): {}",
                sanitize_connection_url(&config.url),
                categorize_db_error(&e),
                e
            ))
        })
}

/// Mask the password in a connection URL for logging
fn sanitize_connection_url(url: &str) -> String {
    let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) else {
        return url.to_string();
    };
    let userinfo_start = scheme_end + 3;
    if at_pos < userinfo_start {
        return url.to_string();
    }
    match url[userinfo_start..at_pos].find(':') {
        Some(colon) => format!(
            "{}{}:***{}",
            &url[..userinfo_start],
            &url[userinfo_start..userinfo_start + colon],
            &url[at_pos..]
        ),
        None => url.to_string(),
    }
}

fn categorize_db_error(err: &sqlx::Error) -> &'static str {
    match err {
        sqlx::Error::Configuration(_) => "configuration error",
        sqlx::Error::Database(_) => "database rejected the connection",
        sqlx::Error::Io(_) => "network I/O error",
        sqlx::Error::Tls(_) => "TLS error",
        sqlx::Error::PoolTimedOut => "connection pool timeout",
        sqlx::Error::PoolClosed => "connection pool closed",
        _ => "connection error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_masks_password() {
        assert_eq!(
            sanitize_connection_url("postgres://audit:s3cret@db:5432/lockout"),
            "postgres://audit:***@db:5432/lockout"
        );
    }

    #[test]
    fn test_sanitize_password_containing_at() {
        assert_eq!(
            sanitize_connection_url("postgres://audit:p@ss@db/lockout"),
            "postgres://audit:***@db/lockout"
        );
    }

    #[test]
    fn test_sanitize_leaves_urls_without_password() {
        assert_eq!(
            sanitize_connection_url("postgres://audit@db/lockout"),
            "postgres://audit@db/lockout"
        );
        assert_eq!(
            sanitize_connection_url("postgres://db/lockout"),
            "postgres://db/lockout"
        );
    }

    #[test]
    fn test_categorize_pool_timeout() {
        assert_eq!(
            categorize_db_error(&sqlx::Error::PoolTimedOut),
            "connection pool timeout"
        );
    }
}
