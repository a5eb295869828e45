//! PostgreSQL pool setup backing `PgStore`.

use crate::config::DatabaseConfig;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Open the pool and bring the schema up to date.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, AppError> {
    tracing::info!(
        url = %redacted_url(&config.url),
        max_connections = config.max_connections,
        "Connecting to PostgreSQL"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Schema migrations applied");

    Ok(pool)
}

/// The connection URL with its password masked, for logs.
pub fn redacted_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, location)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, location),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_masked() {
        assert_eq!(
            redacted_url("postgres://identity:s3cret@db:5432/identity"),
            "postgres://identity:***@db:5432/identity"
        );
    }

    #[test]
    fn test_url_without_password_unchanged() {
        assert_eq!(
            redacted_url("postgres://identity@db/identity"),
            "postgres://identity@db/identity"
        );
        assert_eq!(redacted_url("postgres://db/identity"), "postgres://db/identity");
    }
}
