//! Versioned key/value configuration store.
//!
//! Product configuration edited from the back office (quiz definitions and
//! the like) is stored as JSON rows keyed by `(key, version)`. Readers never
//! see the raw JSON: every read decodes into a typed struct and runs its
//! validation before handing it out.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config '{key}' v{version} failed to decode: {source}")]
    Decode {
        key: &'static str,
        version: i32,
        #[source]
        source: serde_json::Error,
    },

    #[error("config '{key}' is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to encode config '{key}': {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A configuration document with a fixed key and a schema check
pub trait TypedConfig: DeserializeOwned + Serialize + Send + Sync {
    const KEY: &'static str;

    /// Semantic checks serde cannot express
    fn validate(&self) -> Result<(), String>;
}

/// A decoded config document and the version it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: i32,
    pub value: T,
}

/// Decode and validate a raw config row
pub fn decode<T: TypedConfig>(version: i32, raw: serde_json::Value) -> Result<T, ConfigError> {
    let value: T = serde_json::from_value(raw).map_err(|source| ConfigError::Decode {
        key: T::KEY,
        version,
        source,
    })?;
    value
        .validate()
        .map_err(|reason| ConfigError::Invalid { key: T::KEY, reason })?;
    Ok(value)
}

#[derive(Clone)]
pub struct ConfigStore {
    pool: PgPool,
}

impl ConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Latest version of `T`, or `None` if nothing has been published yet
    pub async fn latest<T: TypedConfig>(&self) -> Result<Option<Versioned<T>>, ConfigError> {
        let row: Option<(i32, serde_json::Value)> = sqlx::query_as(
            "SELECT version, value FROM app_config WHERE key = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(T::KEY)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(version, raw)| {
            decode::<T>(version, raw).map(|value| Versioned { version, value })
        })
        .transpose()
    }

    /// Publish a new version. The value is validated before it is written.
    pub async fn publish<T: TypedConfig>(&self, value: &T) -> Result<i32, ConfigError> {
        value
            .validate()
            .map_err(|reason| ConfigError::Invalid { key: T::KEY, reason })?;
        let raw = serde_json::to_value(value)
            .map_err(|source| ConfigError::Encode { key: T::KEY, source })?;

        let (version,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO app_config (key, version, value)
            SELECT $1, COALESCE(MAX(version), 0) + 1, $2
            FROM app_config WHERE key = $1
            RETURNING version
            "#,
        )
        .bind(T::KEY)
        .bind(raw)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(key = T::KEY, version, "Published configuration");
        Ok(version)
    }
}
