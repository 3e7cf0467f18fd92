//! Compress, encrypt and ship database dumps, media folders and single files
//! to Google Drive, and bring them back.

pub mod archive;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod storage;

pub use config::{DatabaseConfig, Settings};
pub use error::{BackupError, Outcome};
pub use pipeline::{BackupPipeline, TempArtifacts};
pub use storage::{RemoteObject, StorageProvider};
