//! SurrealDB connection handling
//!
//! A [`StoreHandle`] owns one initialized connection and is shared by the
//! SurrealDB-backed ledger, report store and deployment registry.
//!
//! Supports in-memory (`mem://`), local file (`surrealkv://`) and cloud
//! (WebSocket) connections.

use std::path::Path;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

/// Default namespace for Quayside tables
pub const DEFAULT_NAMESPACE: &str = "quayside";

/// Default database name
pub const DEFAULT_DATABASE: &str = "main";

/// Default local persistence directory
pub const DEFAULT_LOCAL_DIR: &str = ".quayside/db";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "quayside")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "quayside")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Initialized SurrealDB connection with the Quayside schema applied.
#[derive(Clone)]
pub struct StoreHandle {
    db: Surreal<Any>,
}

impl StoreHandle {
    /// Connect to an in-memory database (tests, dry runs).
    #[instrument(skip_all)]
    pub async fn in_memory() -> Result<Self> {
        Self::connect_url("mem://").await
    }

    /// Connect to a file-backed database under `dir`.
    pub async fn local(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Self::connect_url(&format!("surrealkv://{}", dir.display())).await
    }

    /// Connect to any SurrealDB URL without authentication.
    pub async fn connect_url(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealDB connected");
        Ok(Self { db })
    }

    /// Connect to SurrealDB Cloud with credentials.
    #[instrument(skip_all, fields(endpoint = %config.endpoint))]
    pub async fn cloud(config: &CloudConfig) -> Result<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealDB connected (cloud)");
        Ok(Self { db })
    }

    /// Connect using the environment.
    ///
    /// Resolution order: cloud credentials (`SURREALDB_ENDPOINT` and friends),
    /// then `SURREALDB_URL`, then local persistence in `.quayside/db`.
    pub async fn from_env() -> Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            return Self::cloud(&config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect_url(&url).await;
        }

        info!(
            "No cloud config or SURREALDB_URL found, using local persistence: {}",
            DEFAULT_LOCAL_DIR
        );
        Self::local(Path::new(DEFAULT_LOCAL_DIR)).await
    }

    /// Underlying client.
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_config_builders() {
        let config = CloudConfig::new("wss://db.example", "ci", "secret")
            .with_namespace("acme")
            .with_database("pipelines")
            .with_root(true);

        assert_eq!(config.namespace, "acme");
        assert_eq!(config.database, "pipelines");
        assert!(config.is_root);
    }

    #[tokio::test]
    async fn in_memory_handle_initializes_schema() {
        let handle = StoreHandle::in_memory().await.expect("connect");
        // Re-running migrations on a live connection must be harmless.
        migrations::init_schema(handle.db()).await.expect("re-init");
    }
}
