//! Handlers behind the CLI subcommands. Each prints one human-readable
//! result line and reports whether the command succeeded.

use crate::crypto::{Encryptor, KeyMetadata, KeySelector, KeySpec};
use crate::pipeline::BackupPipeline;
use crate::storage::{RemoteObject, StorageProvider};
use colored::Colorize;
use std::path::Path;

pub fn success_line(text: impl AsRef<str>) {
    println!("{}", text.as_ref().green());
}

pub fn error_line(text: impl AsRef<str>) {
    println!("{}", text.as_ref().red());
}

fn report<T>(result: anyhow::Result<T>, on_success: impl FnOnce(T) -> String, failure: &str) -> bool {
    match result {
        Ok(value) => {
            success_line(on_success(value));
            true
        }
        Err(e) => {
            error_line(format!("{}: {:#}", failure, e));
            false
        }
    }
}

fn describe(object: &RemoteObject) -> String {
    match object.size {
        Some(size) => format!(
            "{} ({}, {:.2} MB)",
            object.name,
            object.id,
            size as f64 / 1_048_576.0
        ),
        None => format!("{} ({})", object.name, object.id),
    }
}

pub async fn backup_database(pipeline: &BackupPipeline<'_>, encrypt: bool) -> bool {
    report(
        pipeline.backup_database(encrypt).await,
        |object| format!("Success: database backed up to {}", describe(&object)),
        "Backup failed",
    )
}

pub async fn backup_media(pipeline: &BackupPipeline<'_>, encrypt: bool, compress: bool) -> bool {
    report(
        pipeline.backup_media(encrypt, compress).await,
        |object| format!("Success: media backed up to {}", describe(&object)),
        "Media backup failed",
    )
}

pub async fn restore_database(pipeline: &BackupPipeline<'_>, decrypt: bool) -> bool {
    report(
        pipeline.restore_database(decrypt).await,
        |object| format!("Success: database restored from {}", object.name),
        "Restore failed",
    )
}

pub async fn restore_media(pipeline: &BackupPipeline<'_>, decrypt: bool) -> bool {
    report(
        pipeline.restore_media(decrypt).await,
        |object| format!("Success: media restored from {}", object.name),
        "Media restore failed",
    )
}

/// `upload`: without a file this is a silent no-op.
pub async fn upload(
    pipeline: &BackupPipeline<'_>,
    file: Option<&Path>,
    encrypt: bool,
    compress: bool,
) -> bool {
    let Some(file) = file else {
        return true;
    };
    report(
        pipeline.backup_file(file, encrypt, compress).await,
        |object| serde_json::to_string_pretty(&object).unwrap_or_else(|_| describe(&object)),
        "Upload failed",
    )
}

/// `download`: without a name this is a silent no-op.
pub async fn download(
    pipeline: &BackupPipeline<'_>,
    name: Option<&str>,
    decrypt: bool,
    decompress: bool,
) -> bool {
    let Some(name) = name else {
        return true;
    };
    report(
        pipeline.restore_file(name, decrypt, decompress).await,
        |path| format!("File saved to {}", path.display()),
        "Download failed",
    )
}

pub async fn list(store: &dyn StorageProvider, page_size: u32) -> bool {
    match store.list(page_size).await {
        Ok(objects) => {
            for object in &objects {
                let created = object.created_time.format("%Y-%m-%d %H:%M:%S");
                println!("  {}  {}", created, describe(object));
            }
            success_line(format!("{} object(s)", objects.len()));
            true
        }
        Err(e) => {
            error_line(format!("Listing failed: {:#}", e));
            false
        }
    }
}

pub async fn latest(store: &dyn StorageProvider, pattern: &str) -> bool {
    match store.get_latest(pattern).await {
        Ok(Some(object)) => {
            success_line(format!(
                "{} created {}",
                describe(&object),
                object.created_time.to_rfc3339()
            ));
            true
        }
        Ok(None) => {
            error_line(format!("No backup matches '{}'", pattern));
            false
        }
        Err(e) => {
            error_line(format!("Lookup failed: {:#}", e));
            false
        }
    }
}

/// One id goes through a single delete, several through the fail-fast bulk delete.
pub async fn delete(store: &dyn StorageProvider, ids: &[String]) -> bool {
    let result = match ids {
        [] => return true,
        [id] => store.delete(id).await,
        _ => store.bulk_delete(ids).await,
    };
    match result {
        Ok(true) => {
            success_line(format!("Deleted {} object(s)", ids.len()));
            true
        }
        Ok(false) => {
            error_line("Deletion was not acknowledged");
            false
        }
        Err(e) => {
            error_line(format!("Deletion failed: {:#}", e));
            false
        }
    }
}

fn print_key(key: &KeyMetadata) {
    let expires = key
        .expires
        .map(|e| e.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!("  {}  rsa{}  expires {}", key.fingerprint, key.length, expires);
    for uid in &key.uids {
        println!("      {}", uid);
    }
}

pub async fn list_keys(encryptor: &Encryptor) -> bool {
    let keys = encryptor.list_keys().await;
    keys.iter().for_each(print_key);
    success_line(format!("{} key(s)", keys.len()));
    true
}

pub async fn generate_key(encryptor: &Encryptor, spec: &KeySpec) -> bool {
    match encryptor.generate_key(spec).await {
        Some(key) => {
            success_line(format!("Generated key {}", key.fingerprint));
            true
        }
        None => {
            error_line("Key generation failed");
            false
        }
    }
}

/// Exports the given ids, or every key when none are given.
pub async fn export_keys(encryptor: &Encryptor, ids: &[String]) -> bool {
    let selector = if ids.is_empty() {
        KeySelector::Many(
            encryptor
                .list_keys()
                .await
                .into_iter()
                .map(KeySelector::Key)
                .collect(),
        )
    } else {
        KeySelector::Many(ids.iter().cloned().map(KeySelector::Id).collect())
    };

    let written = encryptor.export_key(&selector).await;
    if written.is_empty() {
        error_line("No key was exported");
        return false;
    }
    for path in &written {
        success_line(format!("GPG key exported to {}", path.display()));
    }
    true
}

pub async fn import_keys(encryptor: &Encryptor, path: &Path) -> bool {
    match encryptor.import_keys(path).await {
        Some(summary) => {
            success_line(format!(
                "Imported {} of {} key(s): {}",
                summary.imported,
                summary.count,
                summary.fingerprints.join(", ")
            ));
            true
        }
        None => {
            error_line(format!("Import from {} failed", path.display()));
            false
        }
    }
}

pub async fn delete_key(encryptor: &Encryptor, id: &str) -> bool {
    let key = encryptor
        .list_keys()
        .await
        .into_iter()
        .find(|k| k.fingerprint == id || k.keyid == id || k.fingerprint.ends_with(id));

    match key {
        Some(key) if encryptor.delete_key(&key).await => {
            success_line(format!("Deleted key {}", key.fingerprint));
            true
        }
        Some(key) => {
            error_line(format!("Could not delete key {}", key.fingerprint));
            false
        }
        None => {
            error_line(format!("No key matches {}", id));
            false
        }
    }
}

pub async fn destroy_keys(encryptor: &Encryptor) -> bool {
    if encryptor.destroy_all_keys().await {
        success_line("Every key was deleted from the keyring");
        true
    } else {
        error_line("Some keys could not be deleted");
        false
    }
}
