use crate::config::AppConfig;
use crate::storage::{Storage, StorageClient};
use crate::users::repo::{PgUserStore, UserStore};
use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub storage: Arc<dyn StorageClient>,
}

impl AppState {
    /// Connects to Postgres and object storage. The pool is returned for migrations.
    pub async fn init() -> anyhow::Result<(Self, PgPool)> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let storage = Arc::new(Storage::new(&config.storage).await?) as Arc<dyn StorageClient>;
        let users = Arc::new(PgUserStore::new(db.clone())) as Arc<dyn UserStore>;

        Ok((Self::from_parts(config, users, storage), db))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        Self {
            config,
            users,
            storage,
        }
    }
}

#[cfg(test)]
pub use fake::FakeStorage;
