use anyhow::Context;
use axum::extract::Multipart;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AppResult, storage::StorageClient};

/// A file pulled out of a multipart body.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub body: Bytes,
    pub content_type: String,
}

/// Text fields and files of a multipart form, keyed by field name.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub fields: HashMap<String, String>,
    pub files: HashMap<String, UploadItem>,
}

impl UploadForm {
    pub async fn read(mut mp: Multipart) -> AppResult<Self> {
        let mut form = UploadForm::default();
        while let Some(field) = mp.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if field.file_name().is_some() {
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| "application/octet-stream".into());
                let body = field.bytes().await?;
                if body.is_empty() {
                    continue;
                }
                // First file per field wins.
                form.files
                    .entry(name)
                    .or_insert(UploadItem { body, content_type });
            } else {
                let value = field.text().await?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn take_file(&mut self, name: &str) -> Option<UploadItem> {
        self.files.remove(name)
    }
}

/// What an uploaded image is for; part of its object key.
#[derive(Debug, Clone, Copy)]
pub enum ImageKind {
    Avatar,
    Cover,
}

impl ImageKind {
    fn as_str(self) -> &'static str {
        match self {
            ImageKind::Avatar => "avatar",
            ImageKind::Cover => "cover",
        }
    }
}

/// Stores an image and returns the public URL it can be fetched from.
pub async fn upload_image(
    storage: &dyn StorageClient,
    owner: Option<Uuid>,
    kind: ImageKind,
    item: UploadItem,
) -> anyhow::Result<String> {
    anyhow::ensure!(!item.body.is_empty(), "empty upload");
    let ext = ext_from_mime(&item.content_type).unwrap_or("bin");
    let folder = owner.map_or_else(|| "pending".to_string(), |id| id.to_string());
    let key = format!("users/{}/{}-{}.{}", folder, kind.as_str(), Uuid::new_v4(), ext);
    storage
        .put_object(&key, item.body, &item.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;
    let url = storage.object_url(&key);
    debug!(%key, "image uploaded");
    Ok(url)
}

/// Best-effort removal of an image that has been replaced.
pub async fn discard_image(storage: &dyn StorageClient, url: &str) {
    let Some(key) = storage.key_from_url(url) else {
        return;
    };
    if let Err(e) = storage.delete_object(&key).await {
        warn!(error = %e, %key, "failed to delete replaced image");
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
