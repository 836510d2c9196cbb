//! In-memory `UserStore` backing the test suite.

use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo::UserStore;
use super::repo_types::{ChannelProfile, NewUser, User, VideoOwner, WatchedVideo};
use crate::auth::password::hash_password;

#[derive(Debug, Clone)]
pub struct Video {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub title: String,
    pub duration: f64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    subscriber_id: Uuid,
    channel_id: Uuid,
}

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    videos: Vec<Video>,
    subscriptions: Vec<Subscription>,
    fail_next_create: bool,
}

#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<Inner>,
}

impl MemoryUserStore {
    pub async fn insert_user(&self, username: &str, email: &str, password: &str) -> User {
        self.create(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            full_name: username.to_uppercase(),
            avatar: format!("https://fake.local/{username}.png"),
            cover_image: None,
            password_hash: hash_password(password).unwrap(),
        })
        .await
        .unwrap()
    }

    /// Makes the next `create` fail as a lost insert race would.
    pub fn fail_next_create(&self) {
        self.inner.lock().unwrap().fail_next_create = true;
    }

    pub fn insert_video(&self, owner_id: Option<Uuid>, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().videos.push(Video {
            id,
            owner_id,
            title: title.to_string(),
            duration: 60.0,
            created_at: OffsetDateTime::now_utc(),
        });
        id
    }

    pub fn subscribe(&self, subscriber_id: Uuid, channel_id: Uuid) {
        self.inner.lock().unwrap().subscriptions.push(Subscription {
            subscriber_id,
            channel_id,
        });
    }

    pub fn watch(&self, user_id: Uuid, video_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(u) = inner.users.iter_mut().find(|u| u.id == user_id) {
            u.watch_history.push(video_id);
        }
    }

    fn update<F>(&self, id: Uuid, f: F) -> Option<User>
    where
        F: FnOnce(&mut User),
    {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.iter_mut().find(|u| u.id == id)?;
        f(user);
        user.updated_at = OffsetDateTime::now_utc();
        Some(user.clone())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .find(|u| Some(u.username.as_str()) == username || Some(u.email.as_str()) == email)
            .cloned())
    }

    async fn create(&self, user: NewUser) -> anyhow::Result<User> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_next_create) {
            anyhow::bail!("insert raced with another registration");
        }
        if inner
            .users
            .iter()
            .any(|u| u.username == user.username || u.email == user.email)
        {
            anyhow::bail!("duplicate username or email");
        }
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            avatar: user.avatar,
            cover_image: user.cover_image,
            password_hash: user.password_hash,
            refresh_token: None,
            watch_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        inner.users.push(created.clone());
        Ok(created)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()> {
        self.update(id, |u| u.refresh_token = token.map(str::to_string));
        Ok(())
    }

    async fn swap_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        new: &str,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.iter_mut().find(|u| u.id == id) {
            Some(u) if u.refresh_token.as_deref() == Some(expected) => {
                u.refresh_token = Some(new.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        self.update(id, |u| u.password_hash = password_hash.to_string());
        Ok(())
    }

    async fn update_account(
        &self,
        id: Uuid,
        full_name: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        if let Some(email) = email {
            let inner = self.inner.lock().unwrap();
            if inner.users.iter().any(|u| u.id != id && u.email == email) {
                anyhow::bail!("duplicate email");
            }
        }
        Ok(self.update(id, |u| {
            if let Some(name) = full_name {
                u.full_name = name.to_string();
            }
            if let Some(email) = email {
                u.email = email.to_string();
            }
        }))
    }

    async fn update_avatar(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>> {
        Ok(self.update(id, |u| u.avatar = url.to_string()))
    }

    async fn update_cover(&self, id: Uuid, url: &str) -> anyhow::Result<Option<User>> {
        Ok(self.update(id, |u| u.cover_image = Some(url.to_string())))
    }

    async fn channel_profile(
        &self,
        username: &str,
        viewer: Uuid,
    ) -> anyhow::Result<Option<ChannelProfile>> {
        let inner = self.inner.lock().unwrap();
        let Some(user) = inner.users.iter().find(|u| u.username == username) else {
            return Ok(None);
        };
        let subs = &inner.subscriptions;
        Ok(Some(ChannelProfile {
            full_name: user.full_name.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            avatar: user.avatar.clone(),
            cover_image: user.cover_image.clone(),
            subscribers_count: subs.iter().filter(|s| s.channel_id == user.id).count() as i64,
            channels_subscribed_to_count: subs
                .iter()
                .filter(|s| s.subscriber_id == user.id)
                .count() as i64,
            is_subscribed: subs
                .iter()
                .any(|s| s.channel_id == user.id && s.subscriber_id == viewer),
        }))
    }

    async fn watch_history(&self, id: Uuid) -> anyhow::Result<Vec<WatchedVideo>> {
        let inner = self.inner.lock().unwrap();
        let Some(user) = inner.users.iter().find(|u| u.id == id) else {
            return Ok(Vec::new());
        };
        let out = user
            .watch_history
            .iter()
            .filter_map(|vid| inner.videos.iter().find(|v| v.id == *vid))
            .map(|v| WatchedVideo {
                id: v.id,
                video_file: format!("https://fake.local/videos/{}.mp4", v.id),
                thumbnail: format!("https://fake.local/thumbs/{}.png", v.id),
                title: v.title.clone(),
                description: String::new(),
                duration: v.duration,
                is_published: true,
                owner: v
                    .owner_id
                    .and_then(|oid| inner.users.iter().find(|u| u.id == oid))
                    .map(|o| VideoOwner {
                        full_name: o.full_name.clone(),
                        username: o.username.clone(),
                        avatar: o.avatar.clone(),
                    }),
                created_at: v.created_at,
                updated_at: v.created_at,
            })
            .collect();
        Ok(out)
    }
}
