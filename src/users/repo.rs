use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::users::repo_types::{
    ChannelProfile, NewUser, User, WatchHistoryRow, WatchedVideo,
};

/// Credential store: every read and write the account handlers make.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    /// Matches a user whose username equals `username` or whose email equals `email`.
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn create(&self, user: NewUser) -> anyhow::Result<User>;

    /// Overwrites the stored refresh token; `None` ends the session.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()>;

    /// Replaces the stored refresh token only if it still equals `expected`.
    /// Returns `false` when another value (or none) is stored.
    async fn swap_refresh_token(&self, id: Uuid, expected: &str, new: &str)
        -> anyhow::Result<bool>;

    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()>;

    async fn update_account(
        &self,
        id: Uuid,
        full_name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn update_avatar(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>>;

    async fn update_cover(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>>;

    async fn channel_profile(
        &self,
        username: &str,
        viewer: Uuid,
    ) -> anyhow::Result<Option<ChannelProfile>>;

    /// Watched videos in stored order, each with its owner resolved.
    async fn watch_history(&self, id: Uuid) -> anyhow::Result<Vec<WatchedVideo>>;
}

const USER_COLUMNS: &str = "id, username, email, full_name, avatar, cover_image, \
     password_hash, refresh_token, watch_history, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        // A NULL bind never matches, so a missing field is simply ignored.
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $2 LIMIT 1"
        ))
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by username or email")?;
        Ok(user)
    }

    async fn create(&self, user: NewUser) -> anyhow::Result<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, full_name, avatar, cover_image, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.avatar)
        .bind(&user.cover_image)
        .bind(&user.password_hash)
        .fetch_one(&self.db)
        .await
        .context("insert user")?;
        Ok(created)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await
            .context("set refresh token")?;
        Ok(())
    }

    async fn swap_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        new: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET refresh_token = $3, updated_at = now()
             WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(new)
        .execute(&self.db)
        .await
        .context("swap refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await
            .context("update password")?;
        Ok(())
    }

    async fn update_account(
        &self,
        id: Uuid,
        full_name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET full_name = COALESCE($2, full_name),
                   email = COALESCE($3, email),
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(full_name)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("update account")?;
        Ok(user)
    }

    async fn update_avatar(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET avatar = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await
        .context("update avatar")?;
        Ok(user)
    }

    async fn update_cover(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET cover_image = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await
        .context("update cover image")?;
        Ok(user)
    }

    async fn channel_profile(
        &self,
        username: &str,
        viewer: Uuid,
    ) -> anyhow::Result<Option<ChannelProfile>> {
        let profile = sqlx::query_as::<_, ChannelProfile>(
            r#"
            SELECT u.full_name, u.username, u.email, u.avatar, u.cover_image,
                   (SELECT COUNT(*) FROM subscriptions s WHERE s.channel_id = u.id)
                       AS subscribers_count,
                   (SELECT COUNT(*) FROM subscriptions s WHERE s.subscriber_id = u.id)
                       AS channels_subscribed_to_count,
                   EXISTS (SELECT 1 FROM subscriptions s
                            WHERE s.channel_id = u.id AND s.subscriber_id = $2)
                       AS is_subscribed
              FROM users u
             WHERE u.username = $1
            "#,
        )
        .bind(username)
        .bind(viewer)
        .fetch_optional(&self.db)
        .await
        .context("channel profile")?;
        Ok(profile)
    }

    async fn watch_history(&self, id: Uuid) -> anyhow::Result<Vec<WatchedVideo>> {
        let rows = sqlx::query_as::<_, WatchHistoryRow>(
            r#"
            SELECT v.id, v.video_file, v.thumbnail, v.title, v.description, v.duration,
                   v.is_published, v.created_at, v.updated_at,
                   o.full_name AS owner_full_name,
                   o.username  AS owner_username,
                   o.avatar    AS owner_avatar
              FROM users u
              CROSS JOIN LATERAL unnest(u.watch_history) WITH ORDINALITY AS h(video_id, ord)
              JOIN videos v ON v.id = h.video_id
              LEFT JOIN users o ON o.id = v.owner_id
             WHERE u.id = $1
             ORDER BY h.ord
            "#,
        )
        .bind(id)
        .fetch_all(&self.db)
        .await
        .context("watch history")?;
        Ok(rows.into_iter().map(WatchedVideo::from).collect())
    }
}
