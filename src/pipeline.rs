//! Backup and restore orchestration.
//!
//! Backup: source -> (compress) -> (encrypt) -> upload.
//! Restore: locate latest -> download -> (decrypt) -> (extract) -> apply.
//!
//! Every intermediate file is registered with [`TempArtifacts`], which removes
//! them when the operation returns, whether it succeeded or not.

use crate::archive::{self, ArchiveFormat};
use crate::config::Settings;
use crate::crypto::{collision_free_path, Encryptor};
use crate::database::DatabaseTool;
use crate::error::{BackupError, Outcome};
use crate::process::CommandRunner;
use crate::storage::{latest, RemoteObject, StorageProvider};
use anyhow::{bail, Context, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const MEDIA_PREFIX: &str = "media_";
const PROTECTED_MEDIA_PREFIX: &str = "old_media_";

/// Name prefix shared by every dump of one database.
pub fn database_backup_prefix(scope: &str, database: &str) -> String {
    format!("{}_{}_", scope, database)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S-%6f").to_string()
}

/// Intermediate files of one pipeline run. Each tracked path is removed
/// exactly once, when the guard is dropped.
#[derive(Debug, Default)]
pub struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Stops tracking `path` so it outlives the run.
    pub fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else if path.exists() {
                fs::remove_file(&path)
            } else {
                continue;
            };
            match removed {
                Ok(()) => info!("Removed temporary file: {}", path.display()),
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
}

pub struct BackupPipeline<'a> {
    settings: &'a Settings,
    store: &'a dyn StorageProvider,
    encryptor: Encryptor,
    database: DatabaseTool,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(
        settings: &'a Settings,
        store: &'a dyn StorageProvider,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let encryptor = Encryptor::from_settings(settings, runner.clone());
        let database = DatabaseTool::new(
            runner,
            settings.database.clone(),
            settings.command_timeout(),
        );
        Self {
            settings,
            store,
            encryptor,
            database,
        }
    }

    fn backup_dir(&self) -> Result<&Path> {
        let dir = self.settings.backup.backup_dir.as_path();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// The recipient is resolved before any stage runs so a missing one
    /// fails without leaving work behind.
    fn recipient_for(&self, encrypt: bool) -> Result<Option<&str>> {
        if encrypt {
            Ok(Some(self.settings.recipient()?))
        } else {
            Ok(None)
        }
    }

    async fn encrypt_stage(
        &self,
        path: PathBuf,
        recipient: Option<&str>,
        temps: &mut TempArtifacts,
    ) -> Result<PathBuf> {
        let Some(recipient) = recipient else {
            return Ok(path);
        };
        let encrypted = self
            .encryptor
            .encrypt_file(&path, recipient)
            .await
            .into_result("encryption")?;
        temps.track(&encrypted);
        Ok(encrypted)
    }

    async fn decrypt_stage(
        &self,
        path: PathBuf,
        decrypt: bool,
        temps: &mut TempArtifacts,
    ) -> Result<PathBuf> {
        if !decrypt {
            return Ok(path);
        }
        let plain = self
            .encryptor
            .decrypt_file(&path)
            .await
            .into_result("decryption")?;
        temps.track(&plain);
        Ok(plain)
    }

    async fn upload_stage(&self, artifact: &Path) -> Result<RemoteObject> {
        self.store
            .upload(artifact, self.settings.storage.folder_id.as_deref())
            .await
            .with_context(|| format!("Failed to upload {}", artifact.display()))
    }

    async fn download_stage(
        &self,
        object: &RemoteObject,
        temps: &mut TempArtifacts,
    ) -> Result<PathBuf> {
        let (done, path) = self.store.download(&object.id, Some(object.name.as_str())).await?;
        temps.track(&path);
        if !done {
            bail!("Download of {} did not complete", object.name);
        }
        Ok(path)
    }

    /// Newest remote object whose name starts with `prefix`. The remote search
    /// is a substring match, so `default_media_<ts>.dump` would otherwise pass
    /// for a media archive.
    async fn latest_with_prefix(&self, prefix: &str) -> Result<RemoteObject> {
        let candidates = self
            .store
            .list_backups(prefix)
            .await?
            .into_iter()
            .filter(|o| o.name.starts_with(prefix))
            .collect();
        Ok(latest(candidates).ok_or_else(|| BackupError::NotFound(prefix.to_string()))?)
    }

    /// Dumps the configured database as `<scope>_<db>_<timestamp>.dump`,
    /// optionally encrypts it, and uploads it.
    pub async fn backup_database(&self, encrypt: bool) -> Result<RemoteObject> {
        let db_name = self.settings.database.require_name()?;
        let recipient = self.recipient_for(encrypt)?;
        let mut temps = TempArtifacts::new();

        let prefix = database_backup_prefix(&self.settings.backup.scope, db_name);
        let dump_path = self
            .backup_dir()?
            .join(format!("{}{}.dump", prefix, timestamp()));
        temps.track(&dump_path);

        let dump = self.database.dump(&dump_path).await.into_result("database dump")?;
        let artifact = self.encrypt_stage(dump, recipient, &mut temps).await?;
        let uploaded = self.upload_stage(&artifact).await?;

        info!("Database backup uploaded as {}", uploaded.name);
        Ok(uploaded)
    }

    /// Archives the media root as `media_<timestamp>.tar.gz` (or `.tar`
    /// without compression), optionally encrypts it, and uploads it.
    pub async fn backup_media(&self, encrypt: bool, compress: bool) -> Result<RemoteObject> {
        let recipient = self.recipient_for(encrypt)?;
        let mut temps = TempArtifacts::new();

        let format = if compress {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Tar
        };
        let archive_base = self
            .backup_dir()?
            .join(format!("{}{}", MEDIA_PREFIX, timestamp()));

        let archive = archive::compress_folder(&self.settings.backup.media_root, &archive_base, format)
            .into_result("media archive")?;
        temps.track(&archive);

        let artifact = self.encrypt_stage(archive, recipient, &mut temps).await?;
        let uploaded = self.upload_stage(&artifact).await?;

        info!("Media backup uploaded as {}", uploaded.name);
        Ok(uploaded)
    }

    /// Uploads an arbitrary file, optionally gzipped and encrypted first.
    /// The source file itself is never removed.
    pub async fn backup_file(
        &self,
        path: &Path,
        encrypt: bool,
        compress: bool,
    ) -> Result<RemoteObject> {
        if !path.is_file() {
            bail!("{} is not a file", path.display());
        }
        let recipient = self.recipient_for(encrypt)?;
        let mut temps = TempArtifacts::new();

        let mut artifact = path.to_path_buf();
        if compress {
            // never write next to the source; a sibling .gz may be user data
            let name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();
            let target = collision_free_path(&self.backup_dir()?.join(format!("{}.gz", name)));
            temps.track(&target);
            artifact = archive::compress_file_to(path, &target)?;
        }
        let artifact = self.encrypt_stage(artifact, recipient, &mut temps).await?;

        self.upload_stage(&artifact).await
    }

    /// Downloads the newest dump of the configured database and applies it
    /// with `pg_restore --clean`.
    pub async fn restore_database(&self, decrypt: bool) -> Result<RemoteObject> {
        let db_name = self.settings.database.require_name()?;
        let prefix = database_backup_prefix(&self.settings.backup.scope, db_name);

        let latest = self.latest_with_prefix(&prefix).await?;
        info!("Latest database backup: {} ({})", latest.name, latest.id);

        let mut temps = TempArtifacts::new();
        let downloaded = self.download_stage(&latest, &mut temps).await?;
        let dump = self.decrypt_stage(downloaded, decrypt, &mut temps).await?;

        self.database
            .restore(&dump)
            .await
            .into_result("database restore")?;
        Ok(latest)
    }

    /// Replaces the media root with the newest media backup.
    ///
    /// The current media root is archived first; if extraction fails that
    /// copy is extracted back before the error is returned.
    pub async fn restore_media(&self, decrypt: bool) -> Result<RemoteObject> {
        let media_root = self.settings.backup.media_root.as_path();
        let mut temps = TempArtifacts::new();

        let protected = if media_root.is_dir() {
            let base = self
                .backup_dir()?
                .join(format!("{}{}", PROTECTED_MEDIA_PREFIX, timestamp()));
            let copy = archive::compress_folder(media_root, &base, ArchiveFormat::Zip)
                .into_result("protecting current media")?;
            temps.track(&copy);
            info!("Current media protected in {}", copy.display());
            Some(copy)
        } else {
            None
        };

        let latest = self.latest_with_prefix(MEDIA_PREFIX).await?;
        info!("Latest media backup: {} ({})", latest.name, latest.id);

        let downloaded = self.download_stage(&latest, &mut temps).await?;
        let archive_path = self.decrypt_stage(downloaded, decrypt, &mut temps).await?;

        match archive::extract_folder(&archive_path, media_root) {
            Outcome::Done(_) => Ok(latest),
            Outcome::Failed(reason) => {
                if let Some(copy) = protected {
                    if let Outcome::Failed(e) = archive::extract_folder(&copy, media_root) {
                        warn!("Could not put the previous media back: {}", e);
                    }
                }
                bail!("Extracting {} failed: {}", latest.name, reason)
            }
        }
    }

    /// Downloads the object called `name`, optionally decrypting and
    /// gunzipping it. Only the final file is left in the backup directory.
    pub async fn restore_file(&self, name: &str, decrypt: bool, decompress: bool) -> Result<PathBuf> {
        let object = self
            .store
            .get_by_name(name, false)
            .await?
            .ok_or_else(|| BackupError::NotFound(name.to_string()))?;

        let mut temps = TempArtifacts::new();
        let downloaded = self.download_stage(&object, &mut temps).await?;
        let mut result = self.decrypt_stage(downloaded, decrypt, &mut temps).await?;
        if decompress {
            result = archive::decompress_file(&result)?;
            temps.track(&result);
        }

        temps.keep(&result);
        Ok(result)
    }
}
