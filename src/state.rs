use crate::config::AppConfig;
use crate::mail::{self, Mailer};
use crate::storage::{Storage, StorageClient};
use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn StorageClient>,
    pub mailer: Arc<dyn Mailer>,
    pub http: reqwest::Client,
}

impl AppState {
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let storage = Arc::new(Storage::new(&config.storage).await?) as Arc<dyn StorageClient>;
        let mailer = mail::from_config(&config.mail)?;

        // GitHub rejects API calls without a User-Agent.
        let http = reqwest::Client::builder()
            .user_agent(concat!("admin-console/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("build http client")?;

        Ok(Self {
            db,
            config,
            storage,
            mailer,
            http,
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use crate::mail::LogMailer;
    use crate::storage::StorageError;
    use axum::async_trait;
    use bytes::Bytes;

    /// In-memory storage. Keys under `missing/` behave as already deleted,
    /// keys under `broken/` fail.
    #[derive(Clone)]
    pub struct FakeStorage;

    #[async_trait]
    impl StorageClient for FakeStorage {
        async fn put_object(&self, _k: &str, _b: Bytes, _ct: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_object(&self, k: &str) -> Result<(), StorageError> {
            if k.starts_with("missing/") {
                return Err(StorageError::NotFound(k.to_string()));
            }
            if k.starts_with("broken/") {
                return Err(StorageError::Other(anyhow::anyhow!("backend unavailable")));
            }
            Ok(())
        }
        async fn presign_get(&self, k: &str, _s: u64) -> anyhow::Result<String> {
            Ok(format!("https://fake.local/{}", k))
        }
    }

    impl AppState {
        pub fn fake() -> Self {
            Self::fake_with(AppConfig::for_tests())
        }

        /// Test state over a real pool, as handed out by `#[sqlx::test]`.
        pub fn fake_with_pool(db: PgPool) -> Self {
            Self {
                db,
                ..Self::fake()
            }
        }

        pub fn fake_with(config: AppConfig) -> Self {
            let db = sqlx::postgres::PgPoolOptions::new()
                .connect_lazy(&config.database_url)
                .expect("lazy pool ok");
            Self {
                db,
                config: Arc::new(config),
                storage: Arc::new(FakeStorage),
                mailer: Arc::new(LogMailer),
                http: reqwest::Client::new(),
            }
        }
    }
}
