//! File encryption and keyring management on top of the `gpg` binary.
//!
//! Nothing here returns an error: subprocess failures are logged and become
//! [`Outcome::Failed`], `None`, `false` or an empty list.

use crate::config::Settings;
use crate::error::Outcome;
use crate::process::{CommandRunner, ExternalCommand, ProcessOutput};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const GPG: &str = "gpg";
const GPG_SUFFIX: &str = ".gpg";
const STATUS_PREFIX: &str = "[GNUPG:] ";
const SUFFIX_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn gpg_available() -> bool {
    which::which(GPG).is_ok()
}

/// Parameters for unattended key generation.
#[derive(Debug, Clone)]
pub struct KeySpec {
    pub name_real: String,
    pub name_email: String,
    pub key_length: u32,
    /// `0` for no expiry, otherwise `<n>`, `<n>w`, `<n>m` or `<n>y`
    pub expire_date: String,
    pub passphrase: Option<String>,
}

impl KeySpec {
    pub fn new(name_real: impl Into<String>, name_email: impl Into<String>) -> Self {
        Self {
            name_real: name_real.into(),
            name_email: name_email.into(),
            key_length: 4096,
            expire_date: "0".to_string(),
            passphrase: None,
        }
    }

    fn batch_parameters(&self) -> String {
        let mut params = format!(
            "Key-Type: RSA\nKey-Length: {len}\nSubkey-Type: RSA\nSubkey-Length: {len}\n\
             Name-Real: {}\nName-Email: {}\nExpire-Date: {}\n",
            self.name_real,
            self.name_email,
            self.expire_date,
            len = self.key_length,
        );
        match &self.passphrase {
            Some(passphrase) => params.push_str(&format!("Passphrase: {}\n", passphrase)),
            None => params.push_str("%no-protection\n"),
        }
        params.push_str("%commit\n");
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    pub keyid: String,
    pub fingerprint: String,
    pub length: u32,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub uids: Vec<String>,
}

/// What to export: a key id, a listed key, or several of either.
#[derive(Debug, Clone)]
pub enum KeySelector {
    Id(String),
    Key(KeyMetadata),
    Many(Vec<KeySelector>),
}

impl KeySelector {
    fn ids(&self) -> Vec<String> {
        match self {
            KeySelector::Id(id) => vec![id.clone()],
            KeySelector::Key(key) if !key.fingerprint.is_empty() => vec![key.fingerprint.clone()],
            KeySelector::Key(key) => vec![key.keyid.clone()],
            KeySelector::Many(items) => items.iter().flat_map(KeySelector::ids).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub count: u32,
    pub imported: u32,
    pub fingerprints: Vec<String>,
}

pub struct Encryptor {
    runner: Arc<dyn CommandRunner>,
    backup_dir: PathBuf,
    gnupg_home: Option<PathBuf>,
    passphrase: Option<String>,
    timeout: Duration,
}

impl Encryptor {
    pub fn new(runner: Arc<dyn CommandRunner>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            backup_dir: backup_dir.into(),
            gnupg_home: None,
            passphrase: None,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn from_settings(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(runner, settings.backup.backup_dir.clone())
            .with_home(settings.encryption.gnupg_home.clone())
            .with_passphrase(settings.encryption.passphrase.clone())
            .with_timeout(settings.command_timeout())
    }

    pub fn with_home(mut self, gnupg_home: Option<PathBuf>) -> Self {
        self.gnupg_home = gnupg_home;
        self
    }

    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn gpg(&self) -> ExternalCommand {
        let mut cmd = ExternalCommand::new(GPG)
            .args(["--batch", "--yes", "--no-tty"])
            .timeout(self.timeout);
        if let Some(home) = &self.gnupg_home {
            cmd = cmd.arg("--homedir").arg(home.to_string_lossy());
        }
        cmd
    }

    /// Feeds the configured passphrase through stdin with loopback pinentry.
    fn with_passphrase_input(&self, cmd: ExternalCommand) -> ExternalCommand {
        match &self.passphrase {
            Some(passphrase) => cmd
                .args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"])
                .stdin(format!("{}\n", passphrase)),
            None => cmd,
        }
    }

    async fn run(&self, cmd: ExternalCommand, what: &str) -> Result<ProcessOutput, String> {
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => {
                let reason = output.failure_summary();
                warn!("gpg {} failed: {}", what, reason);
                Err(reason)
            }
            Err(e) => {
                warn!("gpg {} failed: {}", what, e);
                Err(e.to_string())
            }
        }
    }

    /// Encrypts `path` for `recipient` into `<backup_dir>/<name>.gpg`.
    pub async fn encrypt_file(&self, path: &Path, recipient: &str) -> Outcome {
        let Some(name) = path.file_name() else {
            return Outcome::failed(format!("{} has no file name", path.display()));
        };
        if let Err(e) = fs::create_dir_all(&self.backup_dir) {
            return Outcome::failed(format!("cannot create {}: {}", self.backup_dir.display(), e));
        }
        let output = self
            .backup_dir
            .join(format!("{}{}", name.to_string_lossy(), GPG_SUFFIX));

        let cmd = self
            .gpg()
            .args(["--trust-model", "always", "--recipient", recipient])
            .arg("--output")
            .arg(output.to_string_lossy())
            .arg("--encrypt")
            .arg(path.to_string_lossy());

        match self.run(cmd, "encrypt").await {
            Ok(_) => {
                info!("Encrypted {} for {}", path.display(), recipient);
                Outcome::Done(output)
            }
            Err(reason) => {
                fs::remove_file(&output).ok();
                Outcome::Failed(reason)
            }
        }
    }

    /// Decrypts `path` into the backup directory, dropping the `.gpg` suffix.
    pub async fn decrypt_file(&self, path: &Path) -> Outcome {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Outcome::failed(format!("{} has no file name", path.display()));
        };
        if let Err(e) = fs::create_dir_all(&self.backup_dir) {
            return Outcome::failed(format!("cannot create {}: {}", self.backup_dir.display(), e));
        }

        let mut output = self.backup_dir.join(strip_gpg_suffix(&name));
        if output == path {
            output = self.backup_dir.join(format!("{}.decrypted", name));
        }

        let cmd = self
            .with_passphrase_input(self.gpg())
            .arg("--output")
            .arg(output.to_string_lossy())
            .arg("--decrypt")
            .arg(path.to_string_lossy());

        match self.run(cmd, "decrypt").await {
            Ok(_) => {
                info!("Decrypted {} -> {}", path.display(), output.display());
                Outcome::Done(output)
            }
            Err(reason) => {
                fs::remove_file(&output).ok();
                Outcome::Failed(reason)
            }
        }
    }

    pub async fn generate_key(&self, spec: &KeySpec) -> Option<KeyPair> {
        let cmd = self
            .gpg()
            .args(["--pinentry-mode", "loopback", "--status-fd", "1", "--gen-key"])
            .stdin(spec.batch_parameters());

        let output = self.run(cmd, "key generation").await.ok()?;
        let fingerprint = status_lines(&output.stdout_text())
            .filter_map(|line| line.strip_prefix("KEY_CREATED "))
            .find_map(|rest| rest.split_whitespace().nth(1).map(str::to_string));

        match fingerprint {
            Some(fingerprint) => {
                info!("Generated key {} for {}", fingerprint, spec.name_email);
                Some(KeyPair { fingerprint })
            }
            None => {
                warn!("gpg did not report the created key");
                None
            }
        }
    }

    pub async fn list_keys(&self) -> Vec<KeyMetadata> {
        let cmd = self
            .gpg()
            .args(["--with-colons", "--fixed-list-mode", "--list-keys"]);
        match self.run(cmd, "list keys").await {
            Ok(output) => parse_colon_listing(&output.stdout_text()),
            Err(_) => Vec::new(),
        }
    }

    /// Writes each selected key (public and secret, armored) to a fresh
    /// timestamped file under `<gnupg_home>/export/` and returns the paths.
    pub async fn export_key(&self, selector: &KeySelector) -> Vec<PathBuf> {
        let mut written = Vec::new();
        for id in selector.ids() {
            if let Some(path) = self.export_one(&id).await {
                written.push(path);
            }
        }
        written
    }

    fn export_dir(&self) -> PathBuf {
        self.gnupg_home
            .as_deref()
            .unwrap_or(&self.backup_dir)
            .join("export")
    }

    async fn export_one(&self, keyid: &str) -> Option<PathBuf> {
        let public = self
            .run(self.gpg().args(["--armor", "--export", keyid]), "export")
            .await
            .ok()?;
        let secret = self
            .run(
                self.with_passphrase_input(self.gpg())
                    .args(["--armor", "--export-secret-keys", keyid]),
                "secret export",
            )
            .await
            .ok()?;

        let dir = self.export_dir();
        let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S-%6f");
        let path = collision_free_path(&dir.join(format!("{}.asc", stamp)));

        let write = fs::create_dir_all(&dir).and_then(|_| {
            let mut content = public.stdout;
            content.extend_from_slice(&secret.stdout);
            fs::write(&path, content)
        });
        match write {
            Ok(()) => {
                info!("GPG key exported to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn import_keys(&self, key_path: &Path) -> Option<ImportSummary> {
        if !key_path.is_file() {
            warn!("Key file not found: {}", key_path.display());
            return None;
        }
        let cmd = self
            .with_passphrase_input(self.gpg())
            .args(["--status-fd", "1", "--import"])
            .arg(key_path.to_string_lossy());

        // gpg exits non-zero when only some keys import; judge by status lines
        let output = match self.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => {
                warn!("gpg import failed: {}", e);
                return None;
            }
        };
        let summary = parse_import_status(&output.stdout_text());
        if output.success() || !summary.fingerprints.is_empty() {
            info!("Imported {} key(s) from {}", summary.imported, key_path.display());
            Some(summary)
        } else {
            warn!("gpg import failed: {}", output.failure_summary());
            None
        }
    }

    pub async fn delete_key(&self, key: &KeyMetadata) -> bool {
        let id = if key.fingerprint.is_empty() {
            &key.keyid
        } else {
            &key.fingerprint
        };
        let cmd = self
            .gpg()
            .args(["--delete-secret-and-public-key", id.as_str()]);
        let deleted = self.run(cmd, "delete").await.is_ok();
        if deleted {
            info!("Deleted key {}", id);
        }
        deleted
    }

    /// Deletes every key in the keyring; true only when all deletions succeed.
    pub async fn destroy_all_keys(&self) -> bool {
        let mut all_deleted = true;
        for key in self.list_keys().await {
            if !self.delete_key(&key).await {
                all_deleted = false;
            }
        }
        all_deleted
    }
}

fn strip_gpg_suffix(name: &str) -> &str {
    name.strip_suffix(GPG_SUFFIX).unwrap_or(name)
}

/// Returns `path` unchanged when free, otherwise `path` with `_XYZ` appended
/// (three random characters of `[A-Z0-9]`) until the name is unused.
pub fn collision_free_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    let mut rng = rand::thread_rng();
    while candidate.exists() {
        let suffix: String = (0..3)
            .map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char)
            .collect();
        candidate = PathBuf::from(format!("{}_{}", path.display(), suffix));
    }
    candidate
}

fn status_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().filter_map(|line| line.strip_prefix(STATUS_PREFIX))
}

fn parse_import_status(stdout: &str) -> ImportSummary {
    let mut summary = ImportSummary::default();
    for line in status_lines(stdout) {
        if let Some(rest) = line.strip_prefix("IMPORT_OK ") {
            if let Some(fpr) = rest.split_whitespace().nth(1) {
                if !summary.fingerprints.iter().any(|f| f == fpr) {
                    summary.fingerprints.push(fpr.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("IMPORT_RES ") {
            let fields: Vec<u32> = rest
                .split_whitespace()
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            summary.count = fields.first().copied().unwrap_or(0);
            summary.imported = fields.get(2).copied().unwrap_or(0);
        }
    }
    summary
}

fn epoch(field: Option<&&str>) -> Option<DateTime<Utc>> {
    field
        .and_then(|f| f.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Parses `gpg --with-colons --fixed-list-mode` output into primary keys.
fn parse_colon_listing(text: &str) -> Vec<KeyMetadata> {
    let mut keys: Vec<KeyMetadata> = Vec::new();
    // the first fpr record after pub belongs to the primary key
    let mut awaiting_primary_fpr = false;

    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                keys.push(KeyMetadata {
                    keyid: fields.get(4).unwrap_or(&"").to_string(),
                    length: fields.get(2).and_then(|l| l.parse().ok()).unwrap_or(0),
                    created: epoch(fields.get(5)),
                    expires: epoch(fields.get(6)),
                    ..Default::default()
                });
                awaiting_primary_fpr = true;
            }
            Some("fpr") if awaiting_primary_fpr => {
                if let Some(key) = keys.last_mut() {
                    key.fingerprint = fields.get(9).unwrap_or(&"").to_string();
                }
                awaiting_primary_fpr = false;
            }
            Some("uid") => {
                if let (Some(key), Some(uid)) = (keys.last_mut(), fields.get(9)) {
                    key.uids.push(uid.replace("\\x3a", ":"));
                }
            }
            Some("sub") => awaiting_primary_fpr = false,
            _ => {}
        }
    }
    keys
}
