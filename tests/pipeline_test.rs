// Backup and restore orchestration against in-memory doubles

mod common;

use common::{day, leftovers, remote, FakeRunner, FakeStore};
use drivekeep::archive::{self, ArchiveFormat};
use drivekeep::config::{DatabaseConfig, Settings};
use drivekeep::error::BackupError;
use drivekeep::pipeline::{BackupPipeline, TempArtifacts};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    settings: Settings,
    backup_dir: PathBuf,
    media_root: PathBuf,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let backup_dir = temp.path().join("backups");
    let media_root = temp.path().join("media");

    let mut settings = Settings::default();
    settings.backup.backup_dir = backup_dir.clone();
    settings.backup.media_root = media_root.clone();
    settings.backup.scope = "prod".to_string();
    settings.encryption.recipient = Some("ops@example.com".to_string());
    settings.database = DatabaseConfig {
        host: Some("localhost".to_string()),
        port: Some(5432),
        name: Some("app".to_string()),
        ..Default::default()
    };

    Fixture {
        _temp: temp,
        settings,
        backup_dir,
        media_root,
    }
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
    out
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Test that a database backup is dumped, encrypted, uploaded and cleaned up
#[tokio::test]
async fn test_backup_database_encrypted() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    let runner = Arc::new(FakeRunner::default());
    let pipeline = BackupPipeline::new(&fx.settings, &store, runner.clone());

    let uploaded = pipeline.backup_database(true).await.unwrap();

    assert!(uploaded.name.starts_with("prod_app_"));
    assert!(uploaded.name.ends_with(".dump.gpg"));
    assert_eq!(store.body(&uploaded.id).unwrap(), b"PGDMP fake dump");
    assert_eq!(runner.programs(), vec!["pg_dump", "gpg"]);

    let dump = &runner.commands()[0];
    assert!(dump
        .args
        .contains(&"--dbname=postgresql://localhost:5432/app".to_string()));
    assert!(dump.args.contains(&"--format=custom".to_string()));

    // dump and ciphertext are both gone
    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test that a failed upload still removes every intermediate file
#[tokio::test]
async fn test_backup_database_upload_failure_cleans_up() {
    let fx = fixture();
    let mut store = FakeStore::new(&fx.backup_dir);
    store.fail_upload = true;
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    assert!(pipeline.backup_database(true).await.is_err());
    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test that an encryption failure never uploads plaintext
#[tokio::test]
async fn test_encryption_failure_aborts_upload() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::failing("gpg")));

    let err = pipeline.backup_database(true).await.unwrap_err();
    assert!(format!("{:#}", err).contains("encryption"));
    assert!(store.objects().is_empty());
    assert!(leftovers(&fx.backup_dir).is_empty());
}

#[tokio::test]
async fn test_backup_database_requires_name() {
    let mut fx = fixture();
    fx.settings.database.name = None;
    let store = FakeStore::new(&fx.backup_dir);
    let runner = Arc::new(FakeRunner::default());
    let pipeline = BackupPipeline::new(&fx.settings, &store, runner.clone());

    let err = pipeline.backup_database(false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::Config(_))
    ));
    assert!(runner.commands().is_empty());
}

/// Test that restoring without any backup reports NotFound
#[tokio::test]
async fn test_restore_database_without_backup() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    let runner = Arc::new(FakeRunner::default());
    let pipeline = BackupPipeline::new(&fx.settings, &store, runner.clone());

    let err = pipeline.restore_database(false).await.unwrap_err();
    match err.downcast_ref::<BackupError>() {
        Some(BackupError::NotFound(prefix)) => assert_eq!(prefix, "prod_app_"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(runner.commands().is_empty());
}

/// Test that the newest dump is decrypted and handed to pg_restore
#[tokio::test]
async fn test_restore_database_uses_latest() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    store.seed(remote("old", "prod_app_old.dump.gpg", day(1)), b"old");
    store.seed(remote("new", "prod_app_new.dump.gpg", day(3)), b"new");
    store.seed(remote("mid", "prod_app_mid.dump.gpg", day(2)), b"mid");
    let runner = Arc::new(FakeRunner::default());
    let pipeline = BackupPipeline::new(&fx.settings, &store, runner.clone());

    let restored = pipeline.restore_database(true).await.unwrap();
    assert_eq!(restored.id, "new");
    assert_eq!(runner.programs(), vec!["gpg", "pg_restore"]);

    let restore = &runner.commands()[1];
    assert_eq!(restore.args[0], "--clean");
    let dump_arg = restore.args.last().unwrap();
    assert!(dump_arg.ends_with("prod_app_new.dump"));

    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test media backup followed by a restore over modified files
#[tokio::test]
async fn test_media_backup_and_restore() {
    let fx = fixture();
    fs::create_dir_all(fx.media_root.join("avatars")).unwrap();
    fs::write(fx.media_root.join("avatars/me.png"), b"original").unwrap();
    fs::write(fx.media_root.join("index.txt"), b"index").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let uploaded = pipeline.backup_media(false, true).await.unwrap();
    assert!(uploaded.name.starts_with("media_"));
    assert!(uploaded.name.ends_with(".tar.gz"));
    assert!(leftovers(&fx.backup_dir).is_empty());

    fs::write(fx.media_root.join("avatars/me.png"), b"changed").unwrap();

    let restored = pipeline.restore_media(false).await.unwrap();
    assert_eq!(restored.id, uploaded.id);
    assert_eq!(
        fs::read(fx.media_root.join("avatars/me.png")).unwrap(),
        b"original"
    );
    assert_eq!(fs::read(fx.media_root.join("index.txt")).unwrap(), b"index");
    // protection copy and download are removed
    assert!(leftovers(&fx.backup_dir).is_empty());
}

#[tokio::test]
async fn test_media_backup_without_compression_is_tar() {
    let fx = fixture();
    fs::create_dir_all(&fx.media_root).unwrap();
    fs::write(fx.media_root.join("a.txt"), b"a").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let uploaded = pipeline.backup_media(false, false).await.unwrap();
    assert_eq!(
        ArchiveFormat::from_path(Path::new(&uploaded.name)),
        Some(ArchiveFormat::Tar)
    );
}

/// Test that a broken archive leaves the current media in place
#[tokio::test]
async fn test_restore_media_rolls_back_on_extract_failure() {
    let fx = fixture();
    fs::create_dir_all(&fx.media_root).unwrap();
    fs::write(fx.media_root.join("keep.txt"), b"current").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    store.seed(
        remote("broken", "media_2024-01-01.tar.gz", day(1)),
        b"this is not a gzip stream",
    );
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let err = pipeline.restore_media(false).await.unwrap_err();
    assert!(format!("{:#}", err).contains("media_2024-01-01.tar.gz"));
    assert_eq!(fs::read(fx.media_root.join("keep.txt")).unwrap(), b"current");
    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test that uploading a single file never touches the source
#[tokio::test]
async fn test_backup_file_compressed_and_encrypted() {
    let fx = fixture();
    let source_dir = fx.backup_dir.parent().unwrap().join("docs");
    fs::create_dir_all(&source_dir).unwrap();
    let source = source_dir.join("notes.txt");
    fs::write(&source, b"some notes").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let uploaded = pipeline.backup_file(&source, true, true).await.unwrap();
    assert_eq!(uploaded.name, "notes.txt.gz.gpg");

    assert_eq!(fs::read(&source).unwrap(), b"some notes");
    assert_eq!(leftovers(&source_dir), vec!["notes.txt"]);
    assert!(leftovers(&fx.backup_dir).is_empty());
}

#[tokio::test]
async fn test_backup_file_rejects_missing_source() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let missing = fx.backup_dir.join("nope.txt");
    assert!(pipeline.backup_file(&missing, false, false).await.is_err());
    assert!(store.calls().is_empty());
}

/// Test download with decompression keeps only the final file
#[tokio::test]
async fn test_restore_file_decompress() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    store.seed(remote("n", "notes.txt.gz", day(1)), &gzip(b"some notes"));
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let path = pipeline.restore_file("notes.txt.gz", false, true).await.unwrap();
    assert_eq!(path, fx.backup_dir.join("notes.txt"));
    assert_eq!(fs::read(&path).unwrap(), b"some notes");
    assert_eq!(leftovers(&fx.backup_dir), vec!["notes.txt"]);
}

#[tokio::test]
async fn test_restore_file_decrypt() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    store.seed(remote("s", "secret.txt.gpg", day(1)), b"ciphertext");
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let path = pipeline.restore_file("secret.txt.gpg", true, false).await.unwrap();
    assert_eq!(path, fx.backup_dir.join("secret.txt"));
    assert_eq!(leftovers(&fx.backup_dir), vec!["secret.txt"]);
}

#[tokio::test]
async fn test_restore_file_unknown_name() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let err = pipeline.restore_file("ghost.txt", false, false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::NotFound(_))
    ));
}

/// Test that tracked paths are removed exactly once on drop
#[test]
fn test_temp_artifacts_cleanup() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("a.dump");
    let dir = temp_dir.path().join("unpacked");
    let kept = temp_dir.path().join("result.txt");
    fs::write(&file, b"x").unwrap();
    fs::create_dir_all(dir.join("inner")).unwrap();
    fs::write(&kept, b"y").unwrap();

    {
        let mut temps = TempArtifacts::new();
        temps.track(&file);
        temps.track(&file);
        temps.track(&dir);
        temps.track(&kept);
        temps.track(temp_dir.path().join("never-created"));
        temps.keep(&kept);
        assert_eq!(temps.paths().len(), 3);
    }

    assert!(!file.exists());
    assert!(!dir.exists());
    assert!(kept.exists());
}

/// Test that the archive helpers used by media restore agree on formats
#[test]
fn test_protection_copy_format() {
    let temp_dir = TempDir::new().unwrap();
    let media = temp_dir.path().join("media");
    fs::create_dir_all(&media).unwrap();
    fs::write(media.join("f.txt"), b"f").unwrap();

    let copy = archive::compress_folder(&media, &temp_dir.path().join("old_media_1"), ArchiveFormat::Zip);
    let copy = copy.path().unwrap().to_path_buf();
    assert_eq!(ArchiveFormat::from_path(&copy), Some(ArchiveFormat::Zip));
}

/// Test that gzipping a file never clobbers a sibling with the .gz name
#[tokio::test]
async fn test_backup_file_keeps_existing_sibling_archive() {
    let fx = fixture();
    let source_dir = fx.backup_dir.parent().unwrap().join("docs");
    fs::create_dir_all(&source_dir).unwrap();
    let source = source_dir.join("report.pdf");
    fs::write(&source, b"pdf body").unwrap();
    fs::write(source_dir.join("report.pdf.gz"), b"user archive").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let uploaded = pipeline.backup_file(&source, false, true).await.unwrap();
    assert_eq!(uploaded.name, "report.pdf.gz");
    assert_eq!(gunzip(&store.body(&uploaded.id).unwrap()), b"pdf body");

    assert_eq!(leftovers(&source_dir), vec!["report.pdf", "report.pdf.gz"]);
    assert_eq!(
        fs::read(source_dir.join("report.pdf.gz")).unwrap(),
        b"user archive"
    );
    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test that a failed gunzip during download leaves nothing behind
#[tokio::test]
async fn test_restore_file_bad_gzip_cleans_up() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    store.seed(remote("n", "notes.txt.gz", day(1)), b"definitely not gzip");
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    assert!(pipeline.restore_file("notes.txt.gz", false, true).await.is_err());
    assert!(leftovers(&fx.backup_dir).is_empty());
}

/// Test encrypted media restore, ignoring dumps whose names contain media_
#[tokio::test]
async fn test_restore_media_decrypt_skips_lookalike_names() {
    let fx = fixture();
    let staging = fx.backup_dir.parent().unwrap().join("staging");
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("photo.jpg"), b"from backup").unwrap();
    let archive_path = archive::compress_folder(
        &staging,
        &fx.backup_dir.parent().unwrap().join("bundle"),
        ArchiveFormat::TarGz,
    )
    .path()
    .unwrap()
    .to_path_buf();
    let archive_bytes = fs::read(&archive_path).unwrap();

    fs::create_dir_all(&fx.media_root).unwrap();
    fs::write(fx.media_root.join("photo.jpg"), b"current").unwrap();

    let store = FakeStore::new(&fx.backup_dir);
    store.seed(
        remote("media", "media_2024-01-02.tar.gz.gpg", day(2)),
        &archive_bytes,
    );
    // newer, and its name contains "media_", but it is a database dump
    store.seed(remote("dump", "prod_media_2024-01-05.dump", day(5)), b"PGDMP");
    let runner = Arc::new(FakeRunner::default());
    let pipeline = BackupPipeline::new(&fx.settings, &store, runner.clone());

    let restored = pipeline.restore_media(true).await.unwrap();
    assert_eq!(restored.id, "media");
    assert_eq!(runner.programs(), vec!["gpg"]);
    assert_eq!(
        fs::read(fx.media_root.join("photo.jpg")).unwrap(),
        b"from backup"
    );
    assert!(leftovers(&fx.backup_dir).is_empty());
}

#[tokio::test]
async fn test_restore_database_requires_prefix_match() {
    let fx = fixture();
    let store = FakeStore::new(&fx.backup_dir);
    store.seed(remote("x", "old_prod_app_2024.dump", day(9)), b"x");
    let pipeline = BackupPipeline::new(&fx.settings, &store, Arc::new(FakeRunner::default()));

    let err = pipeline.restore_database(false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::NotFound(_))
    ));
}
