use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String, // always lower-case
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub password_hash: String,         // Argon2 hash
    pub refresh_token: Option<String>, // the one live refresh token, if any
    pub watch_history: Vec<Uuid>,      // oldest first
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields needed to insert a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub password_hash: String,
}

/// A user with the password hash and refresh token stripped.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub watch_history: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            email: u.email,
            full_name: u.full_name,
            avatar: u.avatar,
            cover_image: u.cover_image,
            watch_history: u.watch_history,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProfile {
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub subscribers_count: i64,
    pub channels_subscribed_to_count: i64,
    pub is_subscribed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoOwner {
    pub full_name: String,
    pub username: String,
    pub avatar: String,
}

/// One entry of a watch history, with its owner resolved.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchedVideo {
    pub id: Uuid,
    pub video_file: String,
    pub thumbnail: String,
    pub title: String,
    pub description: String,
    pub duration: f64,
    pub is_published: bool,
    pub owner: Option<VideoOwner>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Flat row of the watch history join, before the owner is folded in.
#[derive(Debug, FromRow)]
pub struct WatchHistoryRow {
    pub id: Uuid,
    pub video_file: String,
    pub thumbnail: String,
    pub title: String,
    pub description: String,
    pub duration: f64,
    pub is_published: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub owner_full_name: Option<String>,
    pub owner_username: Option<String>,
    pub owner_avatar: Option<String>,
}

impl From<WatchHistoryRow> for WatchedVideo {
    fn from(r: WatchHistoryRow) -> Self {
        let owner = match (r.owner_full_name, r.owner_username, r.owner_avatar) {
            (Some(full_name), Some(username), Some(avatar)) => Some(VideoOwner {
                full_name,
                username,
                avatar,
            }),
            _ => None,
        };
        Self {
            id: r.id,
            video_file: r.video_file,
            thumbnail: r.thumbnail,
            title: r.title,
            description: r.description,
            duration: r.duration,
            is_published: r.is_published,
            owner,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
