use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivekeep::commands;
use drivekeep::config::{Settings, EXAMPLE_CONFIG};
use drivekeep::crypto::{gpg_available, Encryptor, KeySpec};
use drivekeep::pipeline::BackupPipeline;
use drivekeep::process::{CommandRunner, SystemRunner};
use drivekeep::storage::{authenticate, DriveClient};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drivekeep")]
#[command(about = "Compress, encrypt and ship backups to Google Drive")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Remote(RemoteCommand),
    /// Manage the local GPG keyring
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Generate an example configuration file
    GenerateConfig {
        /// Output path for the config file
        #[arg(short, long, default_value = "drivekeep.toml.example")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Upload a file to Google Drive
    #[command(visible_alias = "backup")]
    Upload {
        /// Encrypt file with GPG
        #[arg(short, long)]
        encrypt: bool,
        /// Gzip the file before uploading
        #[arg(short = 'z', long)]
        compress: bool,
        /// Specific file path
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Download a file from Google Drive by name
    #[command(visible_alias = "restore")]
    Download {
        /// Decrypt downloaded file
        #[arg(short, long)]
        decrypt: bool,
        /// Gunzip the downloaded file
        #[arg(short = 'x', long)]
        decompress: bool,
        /// Remote file name
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Dump the configured database and upload it
    BackupDatabase {
        /// Encrypt dump file
        #[arg(long)]
        encrypt: bool,
    },
    /// Archive the media folder and upload it
    BackupMedia {
        /// Encrypt media archive
        #[arg(long)]
        encrypt: bool,
        /// Gzip the media archive
        #[arg(long)]
        compress: bool,
    },
    /// Restore the database from its latest backup
    RestoreDatabase {
        /// Decrypt database dump file
        #[arg(long)]
        decrypt: bool,
    },
    /// Restore the media folder from its latest backup
    RestoreMedia {
        /// Decrypt media archive
        #[arg(long)]
        decrypt: bool,
    },
    /// List remote files (first page only)
    List {
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Show the newest remote file whose name contains a pattern
    Latest { pattern: String },
    /// Delete remote files by id, stopping at the first failure
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// List keys in the keyring
    List,
    /// Generate a new RSA key pair
    Generate {
        /// Real name on the key
        name: String,
        /// Email address on the key
        email: String,
        #[arg(long, default_value_t = 4096)]
        key_length: u32,
        /// 0 (never), <n> days, <n>w, <n>m or <n>y
        #[arg(long, default_value = "0")]
        expire: String,
        /// Protect the secret key; omitted means no protection
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Export keys (all keys when no id is given)
    Export { ids: Vec<String> },
    /// Import keys from an exported file
    Import { path: PathBuf },
    /// Delete one key (public and secret)
    Delete { id: String },
    /// Delete every key in the keyring
    Destroy {
        /// Confirm deletion of every key
        #[arg(long)]
        yes: bool,
    },
}

impl RemoteCommand {
    /// `upload`/`download` without a file do nothing and print nothing.
    fn is_noop(&self) -> bool {
        matches!(
            self,
            RemoteCommand::Upload { file: None, .. } | RemoteCommand::Download { file: None, .. }
        )
    }
}

fn generate_example_config(output: &Path) -> Result<()> {
    fs::write(output, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", output.display()))?;
    commands::success_line(format!(
        "Example configuration file generated: {}",
        output.display()
    ));
    println!("Edit it with your credentials path, folder id and recipient");
    Ok(())
}

async fn run_key_action(encryptor: &Encryptor, action: KeyAction) -> bool {
    match action {
        KeyAction::List => commands::list_keys(encryptor).await,
        KeyAction::Generate {
            name,
            email,
            key_length,
            expire,
            passphrase,
        } => {
            let spec = KeySpec {
                key_length,
                expire_date: expire,
                passphrase,
                ..KeySpec::new(name, email)
            };
            commands::generate_key(encryptor, &spec).await
        }
        KeyAction::Export { ids } => commands::export_keys(encryptor, &ids).await,
        KeyAction::Import { path } => commands::import_keys(encryptor, &path).await,
        KeyAction::Delete { id } => commands::delete_key(encryptor, &id).await,
        KeyAction::Destroy { yes: false } => {
            commands::error_line("Refusing to delete every key without --yes");
            false
        }
        KeyAction::Destroy { yes: true } => commands::destroy_keys(encryptor).await,
    }
}

async fn run_remote(
    command: RemoteCommand,
    settings: &Settings,
    runner: Arc<dyn CommandRunner>,
) -> Result<bool> {
    // credential problems abort before any pipeline stage runs
    let session = authenticate(settings.credentials_path()?).await?;
    let drive = DriveClient::new(&session, settings.backup.backup_dir.clone());
    let pipeline = BackupPipeline::new(settings, &drive, runner);

    let ok = match command {
        RemoteCommand::Upload {
            encrypt,
            compress,
            file,
        } => commands::upload(&pipeline, file.as_deref(), encrypt, compress).await,
        RemoteCommand::Download {
            decrypt,
            decompress,
            file,
        } => commands::download(&pipeline, file.as_deref(), decrypt, decompress).await,
        RemoteCommand::BackupDatabase { encrypt } => {
            commands::backup_database(&pipeline, encrypt).await
        }
        RemoteCommand::BackupMedia { encrypt, compress } => {
            commands::backup_media(&pipeline, encrypt, compress).await
        }
        RemoteCommand::RestoreDatabase { decrypt } => {
            commands::restore_database(&pipeline, decrypt).await
        }
        RemoteCommand::RestoreMedia { decrypt } => {
            commands::restore_media(&pipeline, decrypt).await
        }
        RemoteCommand::List { page_size } => {
            commands::list(&drive, page_size.unwrap_or(settings.storage.page_size)).await
        }
        RemoteCommand::Latest { pattern } => commands::latest(&drive, &pattern).await,
        RemoteCommand::Delete { ids } => commands::delete(&drive, &ids).await,
    };
    Ok(ok)
}

async fn run(cli: Cli) -> Result<bool> {
    match &cli.command {
        Commands::GenerateConfig { output } => {
            generate_example_config(output)?;
            return Ok(true);
        }
        // checked before any config or credentials are touched
        Commands::Remote(command) if command.is_noop() => return Ok(true),
        _ => {}
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    if !gpg_available() {
        warn!("gpg was not found on PATH; encryption and key commands will fail");
    }

    match cli.command {
        Commands::Remote(command) => run_remote(command, &settings, runner).await,
        Commands::Keys { action } => {
            let encryptor = Encryptor::from_settings(&settings, runner);
            Ok(run_key_action(&encryptor, action).await)
        }
        Commands::GenerateConfig { .. } => Ok(true),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drivekeep=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            commands::error_line(format!("Error: {:#}", e));
            ExitCode::FAILURE
        }
    }
}
