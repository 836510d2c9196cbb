use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Base URL clients use to fetch stored objects.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub cors_origin: Option<String>,
    pub cookie_secure: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL")?;
        let jwt = JwtConfig {
            access_secret: std::env::var("ACCESS_TOKEN_SECRET").context("ACCESS_TOKEN_SECRET")?,
            refresh_secret: std::env::var("REFRESH_TOKEN_SECRET")
                .context("REFRESH_TOKEN_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "videotube".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "videotube-users".into()),
            ttl_minutes: env_i64("ACCESS_TOKEN_TTL_MINUTES").unwrap_or(60),
            refresh_ttl_minutes: env_i64("REFRESH_TOKEN_TTL_MINUTES").unwrap_or(60 * 24 * 14),
        };

        let endpoint = std::env::var("MINIO_ENDPOINT").context("MINIO_ENDPOINT")?;
        let bucket = std::env::var("MINIO_BUCKET").context("MINIO_BUCKET")?;
        let public_url = std::env::var("MEDIA_PUBLIC_URL")
            .unwrap_or_else(|_| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));
        let storage = StorageConfig {
            access_key: std::env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY")?,
            secret_key: std::env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY")?,
            region: std::env::var("MINIO_REGION").unwrap_or_else(|_| "us-east-1".into()),
            endpoint,
            bucket,
            public_url,
        };

        let cors_origin = std::env::var("CORS_ORIGIN")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let cookie_secure = std::env::var("COOKIE_SECURE")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            jwt,
            storage,
            cors_origin,
            cookie_secure,
        })
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse::<i64>().ok())
}
