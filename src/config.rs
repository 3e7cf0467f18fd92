use crate::error::BackupError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "drivekeep.toml";
const ENV_PREFIX: &str = "DRIVEKEEP_";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub backup: BackupSettings,
    pub encryption: EncryptionSettings,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Service account JSON key file
    pub credentials_path: Option<PathBuf>,
    /// Drive folder new uploads are parented under
    pub folder_id: Option<String>,
    pub page_size: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            credentials_path: None,
            folder_id: None,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Working directory for every intermediate and downloaded file
    pub backup_dir: PathBuf,
    /// Leading segment of database backup names, `<scope>_<db>_<timestamp>.dump`
    pub scope: String,
    pub media_root: PathBuf,
    pub command_timeout_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./backups"),
            scope: "default".to_string(),
            media_root: PathBuf::from("./media"),
            command_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    pub recipient: Option<String>,
    pub gnupg_home: Option<PathBuf>,
    pub passphrase: Option<String>,
}

/// Discrete connection fields, each independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

impl DatabaseConfig {
    /// Assembles a libpq URI. Credentials appear only when both user and
    /// password are set, the authority only when both host and port are set,
    /// and the database path only when a name is set. Missing pieces yield a
    /// partial URI rather than an error.
    pub fn connection_uri(&self) -> String {
        let mut uri = String::from("postgresql://");

        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            uri.push_str(&format!("{}:{}@", user, password));
        }
        if let (Some(host), Some(port)) = (&self.host, self.port) {
            uri.push_str(&format!("{}:{}", host, port));
        }
        if let Some(name) = &self.name {
            uri.push('/');
            uri.push_str(name);
        }

        uri
    }

    pub fn require_name(&self) -> Result<&str, BackupError> {
        self.name
            .as_deref()
            .ok_or_else(|| BackupError::Config("database name is not configured".to_string()))
    }
}

impl Settings {
    /// Reads the TOML file (if any) and overlays `DRIVEKEEP_*` variables from
    /// the process environment and a `.env` file.
    ///
    /// An explicitly given path must exist; the default path is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = match config_path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides from `lookup`, which maps a full variable name to
    /// its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("CREDENTIALS_PATH") {
            self.storage.credentials_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("FOLDER_ID") {
            self.storage.folder_id = Some(v);
        }
        if let Some(v) = var("PAGE_SIZE") {
            self.storage.page_size = v
                .parse()
                .with_context(|| format!("Invalid {}PAGE_SIZE: {}", ENV_PREFIX, v))?;
        }
        if let Some(v) = var("BACKUP_DIR") {
            self.backup.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SCOPE") {
            self.backup.scope = v;
        }
        if let Some(v) = var("MEDIA_ROOT") {
            self.backup.media_root = PathBuf::from(v);
        }
        if let Some(v) = var("COMMAND_TIMEOUT") {
            self.backup.command_timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid {}COMMAND_TIMEOUT: {}", ENV_PREFIX, v))?;
        }
        if let Some(v) = var("GPG_RECIPIENT") {
            self.encryption.recipient = Some(v);
        }
        if let Some(v) = var("GNUPG_HOME") {
            self.encryption.gnupg_home = Some(PathBuf::from(v));
        }
        if let Some(v) = var("GPG_PASSPHRASE") {
            self.encryption.passphrase = Some(v);
        }
        if let Some(v) = var("DB_HOST") {
            self.database.host = Some(v);
        }
        if let Some(v) = var("DB_PORT") {
            self.database.port = Some(
                v.parse()
                    .with_context(|| format!("Invalid {}DB_PORT: {}", ENV_PREFIX, v))?,
            );
        }
        if let Some(v) = var("DB_USER") {
            self.database.user = Some(v);
        }
        if let Some(v) = var("DB_PASSWORD") {
            self.database.password = Some(v);
        }
        if let Some(v) = var("DB_NAME") {
            self.database.name = Some(v);
        }

        debug!("Settings resolved: backup_dir={}", self.backup.backup_dir.display());
        Ok(())
    }

    pub fn credentials_path(&self) -> Result<&Path, BackupError> {
        self.storage.credentials_path.as_deref().ok_or_else(|| {
            BackupError::Config(format!(
                "credentials path is not configured (set storage.credentials_path or {}CREDENTIALS_PATH)",
                ENV_PREFIX
            ))
        })
    }

    pub fn recipient(&self) -> Result<&str, BackupError> {
        self.encryption.recipient.as_deref().ok_or_else(|| {
            BackupError::Config(format!(
                "encryption recipient is not configured (set encryption.recipient or {}GPG_RECIPIENT)",
                ENV_PREFIX
            ))
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.command_timeout_secs)
    }
}

pub const EXAMPLE_CONFIG: &str = r#"# drivekeep configuration
# Every value can also be set through a DRIVEKEEP_* environment variable
# (or a .env file), which takes precedence over this file.

[storage]
# Google service account key (JSON). Share the target folder with its client_email.
credentials_path = "./credentials.json"
# Drive folder id new uploads go into (omit to upload to the service account's root)
# folder_id = "1AbCdEf..."
page_size = 100

[backup]
# Working directory for dumps, archives, ciphertext and downloads
backup_dir = "./backups"
# Database backups are named <scope>_<database>_<timestamp>.dump
scope = "default"
media_root = "./media"
# Upper bound for gpg / pg_dump / pg_restore runs
command_timeout_secs = 3600

[encryption]
# Key fingerprint or email backups are encrypted for
# recipient = "backups@example.com"
# gnupg_home = "/var/lib/drivekeep/gnupg"
# passphrase = "only needed to decrypt with a protected key"

[database]
# host = "localhost"
# port = 5432
# user = "postgres"
# password = "secret"
# name = "app"
"#;
