// Google Drive v3 files API
// Documentation: https://developers.google.com/drive/api/reference/rest/v3/files

use super::{NameFilter, RemoteObject, Session, StorageProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FILE_FIELDS: &str = "id,name,createdTime,mimeType,owners(displayName,emailAddress),size";

const SEARCH_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Query parameters for one page of a name search, newest first.
fn search_params(
    filter: &NameFilter,
    include_shared_drives: bool,
    page_token: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("q", filter.query()),
        ("fields", format!("nextPageToken,files({})", FILE_FIELDS)),
        ("orderBy", "createdTime desc".to_string()),
        ("pageSize", SEARCH_PAGE_SIZE.to_string()),
    ];
    if include_shared_drives {
        params.push(("supportsAllDrives", "true".to_string()));
        params.push(("includeItemsFromAllDrives", "true".to_string()));
    }
    if let Some(token) = page_token {
        params.push(("pageToken", token.to_string()));
    }
    params
}

pub struct DriveClient<'a> {
    session: &'a Session,
    backup_dir: PathBuf,
}

impl<'a> DriveClient<'a> {
    pub fn new(session: &'a Session, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            backup_dir: backup_dir.into(),
        }
    }

    /// Attaches the bearer token. Tokens are never refreshed, so an expired
    /// one is only reported.
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.session.is_expired(Utc::now()) {
            warn!(
                "Google Drive access token expired at {}; requests will be rejected",
                self.session.expires_at()
            );
        }
        request.bearer_auth(self.session.access_token())
    }

    fn get_request(&self, url: String) -> RequestBuilder {
        self.authorized(self.session.http().get(url))
    }

    async fn fetch_list(&self, query: &[(&str, String)], what: &str) -> Result<FileList> {
        let response = self
            .get_request(format!("{}/files", API_BASE))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to {} on Google Drive", what))?;

        let list: FileList = ensure_success(response, what)
            .await?
            .json()
            .await
            .with_context(|| format!("Unreadable Google Drive response to {}", what))?;
        Ok(list)
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error = response.text().await.unwrap_or_default();
    Err(anyhow::anyhow!(
        "Google Drive {} failed ({}): {}",
        what,
        status,
        error
    ))
}

/// Body for `uploadType=multipart`: JSON metadata part followed by the media part.
fn multipart_related(boundary: &str, metadata: &serde_json::Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n\
             --{b}\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = boundary,
            m = metadata
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[async_trait]
impl<'a> StorageProvider for DriveClient<'a> {
    async fn get(&self, id: &str, include_shared_drives: bool) -> Result<RemoteObject> {
        let response = self
            .get_request(format!("{}/files/{}", API_BASE, id))
            .query(&[
                ("fields", FILE_FIELDS.to_string()),
                ("supportsAllDrives", include_shared_drives.to_string()),
            ])
            .send()
            .await
            .context("Failed to get file from Google Drive")?;

        ensure_success(response, "get")
            .await?
            .json()
            .await
            .context("Unreadable Google Drive file metadata")
    }

    async fn search(
        &self,
        filter: &NameFilter,
        include_shared_drives: bool,
    ) -> Result<Vec<RemoteObject>> {
        debug!("Searching Google Drive: {}", filter.query());

        let mut found = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let params = search_params(filter, include_shared_drives, page_token.as_deref());
            let page = self.fetch_list(&params, "search").await?;
            found.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(found)
    }

    async fn list(&self, page_size: u32) -> Result<Vec<RemoteObject>> {
        let params = [
            ("pageSize", page_size.to_string()),
            ("fields", format!("nextPageToken,files({})", FILE_FIELDS)),
        ];
        Ok(self.fetch_list(&params, "list").await?.files)
    }

    async fn upload(&self, local_path: &Path, parent_id: Option<&str>) -> Result<RemoteObject> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid file name: {}", local_path.display()))?;

        info!("Uploading {} to Google Drive...", file_name);
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read file: {}", local_path.display()))?;

        let mut metadata = serde_json::json!({ "name": file_name });
        if let Some(parent) = parent_id {
            metadata["parents"] = serde_json::json!([parent]);
        }

        let boundary = format!("drivekeep-{:016x}", rand::thread_rng().gen::<u64>());
        let body = multipart_related(&boundary, &metadata, &data);

        let response = self
            .authorized(self.session.http().post(format!("{}/files", UPLOAD_BASE)))
            .query(&[
                ("uploadType", "multipart"),
                ("fields", FILE_FIELDS),
                ("supportsAllDrives", "true"),
            ])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .context("Failed to upload to Google Drive")?;

        let created: RemoteObject = ensure_success(response, "upload")
            .await?
            .json()
            .await
            .context("Unreadable Google Drive upload response")?;

        info!("Successfully uploaded: {} ({})", created.name, created.id);
        Ok(created)
    }

    async fn fetch(&self, id: &str, dest: &Path) -> Result<bool> {
        info!("Downloading {} from Google Drive...", id);
        let response = self
            .get_request(format!("{}/files/{}", API_BASE, id))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .context("Failed to download from Google Drive")?;
        let mut response = ensure_success(response, "download").await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create output file: {}", dest.display()))?;

        let streamed = async {
            let mut written = 0u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .context("Failed to read download stream")?
            {
                file.write_all(&chunk)
                    .await
                    .context("Failed to write to file")?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, anyhow::Error>(written)
        }
        .await;

        match streamed {
            Ok(written) => {
                info!("Downloaded {} bytes to: {}", written, dest.display());
                Ok(true)
            }
            Err(e) => {
                drop(file);
                tokio::fs::remove_file(dest).await.ok();
                Err(e)
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let response = self
            .authorized(self.session.http().delete(format!("{}/files/{}", API_BASE, id)))
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await
            .context("Failed to delete from Google Drive")?;

        let body = ensure_success(response, "delete")
            .await?
            .text()
            .await
            .unwrap_or_default();

        let acknowledged = body.trim().is_empty();
        if acknowledged {
            info!("Deleted from Google Drive: {}", id);
        }
        Ok(acknowledged)
    }

    fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}
