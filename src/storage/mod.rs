mod auth;
mod drive;

pub use auth::{authenticate, ServiceAccountKey, Session};
pub use drive::DriveClient;

use crate::error::BackupError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Snapshot of a remote file as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub owners: Vec<Owner>,
    /// Drive sends sizes as decimal strings and omits them for folders
    #[serde(default, deserialize_with = "size_from_string")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

fn size_from_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(Raw::Number(n)) => Ok(Some(n)),
        None => Ok(None),
    }
}

/// Name predicate for remote searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    Exact(String),
    Contains(String),
}

impl NameFilter {
    /// Drive `q` parameter; trashed files are never returned.
    pub fn query(&self) -> String {
        match self {
            NameFilter::Exact(name) => format!("name = '{}' and trashed = false", escape(name)),
            NameFilter::Contains(part) => {
                format!("name contains '{}' and trashed = false", escape(part))
            }
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Exact(expected) => name == expected,
            NameFilter::Contains(part) => name.contains(part.as_str()),
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Newest object by creation time.
pub fn latest(objects: Vec<RemoteObject>) -> Option<RemoteObject> {
    objects.into_iter().max_by_key(|o| o.created_time)
}

/// Remote object storage the backup pipeline talks to.
///
/// Implementors provide the primitive calls; name lookups, latest-backup
/// selection, downloads into the backup directory and bulk deletion are
/// built on top of them.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get(&self, id: &str, include_shared_drives: bool) -> Result<RemoteObject>;

    async fn search(
        &self,
        filter: &NameFilter,
        include_shared_drives: bool,
    ) -> Result<Vec<RemoteObject>>;

    /// One page of results; pagination tokens are not followed.
    async fn list(&self, page_size: u32) -> Result<Vec<RemoteObject>>;

    /// Creates a remote object named after the local file's base name.
    async fn upload(&self, local_path: &Path, parent_id: Option<&str>) -> Result<RemoteObject>;

    /// Streams the object body into `dest`; true once the transfer completed.
    async fn fetch(&self, id: &str, dest: &Path) -> Result<bool>;

    /// True when the API acknowledged the deletion with an empty body.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Directory downloads land in.
    fn backup_dir(&self) -> &Path;

    /// First object with exactly this name, in whatever order the API returns
    /// them. Duplicate names are not detected.
    async fn get_by_name(
        &self,
        name: &str,
        include_shared_drives: bool,
    ) -> Result<Option<RemoteObject>> {
        let found = self
            .search(&NameFilter::Exact(name.to_string()), include_shared_drives)
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_backups(&self, pattern: &str) -> Result<Vec<RemoteObject>> {
        self.search(&NameFilter::Contains(pattern.to_string()), false)
            .await
    }

    async fn get_latest(&self, pattern: &str) -> Result<Option<RemoteObject>> {
        Ok(latest(self.list_backups(pattern).await?))
    }

    /// Downloads into `<backup_dir>/<file_name or id>`.
    async fn download(&self, id: &str, file_name: Option<&str>) -> Result<(bool, PathBuf)> {
        let dir = self.backup_dir();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory: {}", dir.display()))?;

        let local_name = file_name
            .and_then(|n| Path::new(n).file_name())
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| id.into());
        let path = dir.join(local_name);

        let done = self.fetch(id, &path).await?;
        Ok((done, path))
    }

    /// Deletes in order and stops at the first id that is not acknowledged;
    /// later ids are left untouched.
    async fn bulk_delete(&self, ids: &[String]) -> Result<bool> {
        let mut deleted = false;
        for id in ids {
            if !self.delete(id).await? {
                return Err(BackupError::BulkDelete { id: id.clone() }.into());
            }
            deleted = true;
        }
        info!("Deleted {} remote object(s)", ids.len());
        Ok(deleted)
    }
}
