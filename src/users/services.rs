use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    auth::password::hash_password,
    error::{AppError, AppResult},
    media::services::{discard_image, upload_image, ImageKind, UploadItem},
    storage::StorageClient,
    users::{
        repo::UserStore,
        repo_types::{NewUser, PublicUser},
    },
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// `Some` only for a value with non-whitespace content.
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub(crate) fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Raw registration input, as submitted.
#[derive(Debug, Default)]
pub struct Registration {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub avatar: Option<UploadItem>,
    pub cover_image: Option<UploadItem>,
}

pub async fn register_user(
    users: &dyn UserStore,
    storage: &dyn StorageClient,
    input: Registration,
) -> AppResult<PublicUser> {
    // The password is only checked for content; it is hashed exactly as sent.
    let (Some(full_name), Some(email), Some(username), Some(password)) = (
        non_blank(input.full_name.as_deref()),
        non_blank(input.email.as_deref()),
        non_blank(input.username.as_deref()),
        input.password.as_deref().filter(|p| !p.trim().is_empty()),
    ) else {
        return Err(AppError::BadRequest("All fields are required".into()));
    };
    let email = normalize_email(email);
    let username = normalize_username(username);

    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::BadRequest("Invalid email".into()));
    }

    if users
        .find_by_username_or_email(Some(&username), Some(&email))
        .await?
        .is_some()
    {
        warn!(%username, %email, "user already registered");
        return Err(AppError::Conflict(
            "User with email or username already exists".into(),
        ));
    }

    let password_hash = hash_password(password)?;

    let avatar_file = input
        .avatar
        .ok_or_else(|| AppError::BadRequest("Avatar file is required".into()))?;
    let avatar = upload_image(storage, None, ImageKind::Avatar, avatar_file)
        .await
        .map_err(|e| {
            error!(error = ?e, "avatar upload failed");
            AppError::BadRequest("Avatar file is required".into())
        })?;

    let cover_image = match input.cover_image {
        Some(file) => match upload_image(storage, None, ImageKind::Cover, file).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = ?e, "cover upload failed; registering without one");
                None
            }
        },
        None => None,
    };

    let uploaded: Vec<String> = std::iter::once(avatar.clone())
        .chain(cover_image.clone())
        .collect();
    let created = users
        .create(NewUser {
            username,
            email,
            full_name: full_name.to_string(),
            avatar,
            cover_image,
            password_hash,
        })
        .await
        .map_err(|e| AppError::from_store(e, "User with email or username already exists"));
    let created = match created {
        Ok(created) => created,
        Err(e) => {
            for url in &uploaded {
                discard_image(storage, url).await;
            }
            return Err(e);
        }
    };

    let user = users.find_by_id(created.id).await?.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!(
            "user {} missing right after registration",
            created.id
        ))
    })?;

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(user.into())
}

/// Uploads a new avatar or cover, stores its URL and drops the old object.
pub async fn replace_image(
    users: &dyn UserStore,
    storage: &dyn StorageClient,
    user: &PublicUser,
    kind: ImageKind,
    file: Option<UploadItem>,
) -> AppResult<PublicUser> {
    let missing = match kind {
        ImageKind::Avatar => "Avatar file is missing",
        ImageKind::Cover => "Cover image file is missing",
    };
    let file = file.ok_or_else(|| AppError::BadRequest(missing.into()))?;

    let url = upload_image(storage, Some(user.id), kind, file)
        .await
        .map_err(|e| {
            error!(error = ?e, user_id = %user.id, "image upload failed");
            AppError::BadRequest("Error while uploading image".into())
        })?;

    let updated = match kind {
        ImageKind::Avatar => users.update_avatar(user.id, &url).await?,
        ImageKind::Cover => users.update_cover(user.id, &url).await?,
    }
    .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    let previous = match kind {
        ImageKind::Avatar => Some(user.avatar.as_str()),
        ImageKind::Cover => user.cover_image.as_deref(),
    };
    if let Some(old) = previous.filter(|old| *old != url) {
        discard_image(storage, old).await;
    }

    Ok(updated.into())
}

/// Another account already using `email`, if any.
pub async fn email_taken_by_other(
    users: &dyn UserStore,
    email: &str,
    me: Uuid,
) -> AppResult<bool> {
    Ok(users
        .find_by_username_or_email(None, Some(email))
        .await?
        .is_some_and(|u| u.id != me))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::password::verify_password, state::FakeStorage, users::memory::MemoryUserStore,
    };
    use bytes::Bytes;

    fn png() -> UploadItem {
        UploadItem {
            body: Bytes::from_static(b"\x89PNG fake"),
            content_type: "image/png".into(),
        }
    }

    fn alice() -> Registration {
        Registration {
            full_name: Some("Alice".into()),
            email: Some("Alice@X.com ".into()),
            username: Some("  ALICE".into()),
            password: Some("s3cret".into()),
            avatar: Some(png()),
            cover_image: None,
        }
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("alice@x.com"));
        assert!(!is_valid_email("alice"));
        assert!(!is_valid_email("alice@x"));
        assert!(!is_valid_email("a lice@x.com"));
    }

    #[tokio::test]
    async fn register_normalizes_and_hashes() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        let user = register_user(&users, &storage, alice()).await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@x.com");
        assert!(user.avatar.starts_with("https://fake.local/users/pending/avatar-"));
        assert!(user.cover_image.is_none());

        let stored = users.find_by_id(user.id).await.unwrap().unwrap();
        assert_ne!(stored.password_hash, "s3cret");
        assert!(stored.refresh_token.is_none());
    }

    #[tokio::test]
    async fn register_twice_conflicts_on_username_or_email() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        register_user(&users, &storage, alice()).await.unwrap();

        let same_name = Registration {
            email: Some("other@x.com".into()),
            ..alice()
        };
        let err = register_user(&users, &storage, same_name).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let same_email = Registration {
            username: Some("bob".into()),
            ..alice()
        };
        let err = register_user(&users, &storage, same_email).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_requires_fields_and_avatar() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();

        let blank = Registration {
            full_name: Some("   ".into()),
            ..alice()
        };
        let err = register_user(&users, &storage, blank).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let missing = Registration {
            password: None,
            ..alice()
        };
        let err = register_user(&users, &storage, missing).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let no_avatar = Registration {
            avatar: None,
            ..alice()
        };
        let err = register_user(&users, &storage, no_avatar).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(storage.objects().is_empty());
    }

    #[tokio::test]
    async fn register_keeps_cover_when_given() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        let input = Registration {
            cover_image: Some(png()),
            ..alice()
        };
        let user = register_user(&users, &storage, input).await.unwrap();
        assert!(user.cover_image.unwrap().contains("/cover-"));
        assert_eq!(storage.objects().len(), 2);
    }

    #[tokio::test]
    async fn register_stores_password_exactly_as_sent() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        let input = Registration {
            password: Some(" s3cret ".into()),
            ..alice()
        };
        let user = register_user(&users, &storage, input).await.unwrap();

        let stored = users.find_by_id(user.id).await.unwrap().unwrap();
        assert!(verify_password(" s3cret ", &stored.password_hash).unwrap());
        assert!(!verify_password("s3cret", &stored.password_hash).unwrap());

        let blank = Registration {
            username: Some("bob".into()),
            email: Some("bob@x.com".into()),
            password: Some("   ".into()),
            ..alice()
        };
        let err = register_user(&users, &storage, blank).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn failed_insert_discards_uploaded_images() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        users.fail_next_create();
        let input = Registration {
            cover_image: Some(png()),
            ..alice()
        };
        assert!(register_user(&users, &storage, input).await.is_err());
        assert!(storage.objects().is_empty());

        register_user(&users, &storage, alice()).await.unwrap();
        assert_eq!(storage.objects().len(), 1);
    }

    #[tokio::test]
    async fn replacing_avatar_drops_the_old_object() {
        let users = MemoryUserStore::default();
        let storage = FakeStorage::default();
        let user = register_user(&users, &storage, alice()).await.unwrap();

        let updated = replace_image(&users, &storage, &user, ImageKind::Avatar, Some(png()))
            .await
            .unwrap();
        assert_ne!(updated.avatar, user.avatar);
        assert!(updated
            .avatar
            .starts_with(&format!("https://fake.local/users/{}/avatar-", user.id)));
        assert_eq!(storage.objects().len(), 1);

        let err = replace_image(&users, &storage, &updated, ImageKind::Cover, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
