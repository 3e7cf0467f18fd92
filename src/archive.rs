//! Gzip for single files, zip/tar/tar.gz for folders.
//!
//! Folder operations report failure as an [`Outcome`] instead of an error so
//! pipeline code can always reach its cleanup.

use crate::error::Outcome;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const GZ_SUFFIX: &str = ".gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    /// Detects the format from the file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Gzips `path` into `<path>.gz` next to it.
pub fn compress_file(path: &Path) -> Result<PathBuf> {
    compress_file_to(path, &with_suffix(path, GZ_SUFFIX))
}

/// Gzips `path` into `target`. A partially written target is removed on failure.
pub fn compress_file_to(path: &Path, target: &Path) -> Result<PathBuf> {
    let written = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
        .and_then(|input| {
            let output = File::create(target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
            io::copy(&mut BufReader::new(input), &mut encoder)
                .with_context(|| format!("Failed to compress {}", path.display()))?;
            encoder
                .finish()
                .and_then(|mut w| w.flush())
                .with_context(|| format!("Failed to finish {}", target.display()))
        });

    if let Err(e) = written {
        fs::remove_file(target).ok();
        return Err(e);
    }
    info!("Compressed {} -> {}", path.display(), target.display());
    Ok(target.to_path_buf())
}

/// Reverses [`compress_file`]. The output name drops the `.gz` suffix; a file
/// without one gets `.out` appended so it never overwrites its input.
/// A partially written output is removed on failure.
pub fn decompress_file(path: &Path) -> Result<PathBuf> {
    let target = match path.to_str().and_then(|p| p.strip_suffix(GZ_SUFFIX)) {
        Some(stripped) if !stripped.is_empty() => PathBuf::from(stripped),
        _ => with_suffix(path, ".out"),
    };

    let input = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let written = File::create(&target)
        .with_context(|| format!("Failed to create {}", target.display()))
        .and_then(|output| {
            let mut decoder = GzDecoder::new(BufReader::new(input));
            let mut output = BufWriter::new(output);
            io::copy(&mut decoder, &mut output)
                .with_context(|| format!("Failed to decompress {}", path.display()))?;
            output.flush()?;
            Ok(())
        });

    if let Err(e) = written {
        fs::remove_file(&target).ok();
        return Err(e);
    }
    info!("Decompressed {} -> {}", path.display(), target.display());
    Ok(target)
}

/// Archives the tree under `folder` into `<archive_name>.<ext>`, with entry
/// paths relative to `folder`.
pub fn compress_folder(folder: &Path, archive_name: &Path, format: ArchiveFormat) -> Outcome {
    let target = with_suffix(archive_name, &format!(".{}", format.extension()));

    if !folder.is_dir() {
        return Outcome::failed(format!("{} is not a directory", folder.display()));
    }

    let written = match format {
        ArchiveFormat::Zip => write_zip(folder, &target),
        ArchiveFormat::Tar => File::create(&target)
            .map_err(anyhow::Error::from)
            .and_then(|file| {
                write_tar(folder, BufWriter::new(file))?.flush()?;
                Ok(())
            }),
        ArchiveFormat::TarGz => File::create(&target)
            .map_err(anyhow::Error::from)
            .and_then(|file| {
                let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
                write_tar(folder, encoder)?.finish()?.flush()?;
                Ok(())
            }),
    };

    match written {
        Ok(()) => {
            info!("Archived {} -> {}", folder.display(), target.display());
            Outcome::Done(target)
        }
        Err(e) => {
            warn!("Archiving {} failed: {:#}", folder.display(), e);
            fs::remove_file(&target).ok();
            Outcome::failed(format!("{:#}", e))
        }
    }
}

/// Extracts `archive` into `dest`, creating it when missing.
pub fn extract_folder(archive: &Path, dest: &Path) -> Outcome {
    let Some(format) = ArchiveFormat::from_path(archive) else {
        return Outcome::failed(format!("unsupported archive format: {}", archive.display()));
    };

    match unpack(archive, dest, format) {
        Ok(()) => {
            info!("Extracted {} into {}", archive.display(), dest.display());
            Outcome::Done(dest.to_path_buf())
        }
        Err(e) => {
            warn!("Extracting {} failed: {:#}", archive.display(), e);
            Outcome::failed(format!("{:#}", e))
        }
    }
}

fn unpack(archive: &Path, dest: &Path, format: ArchiveFormat) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;

    match format {
        ArchiveFormat::Zip => {
            ZipArchive::new(file)
                .context("Failed to read zip archive")?
                .extract(dest)
                .context("Failed to extract zip archive")?;
        }
        ArchiveFormat::Tar => {
            Archive::new(BufReader::new(file))
                .unpack(dest)
                .context("Failed to extract tar archive")?;
        }
        ArchiveFormat::TarGz => {
            Archive::new(GzDecoder::new(BufReader::new(file)))
                .unpack(dest)
                .context("Failed to extract tar.gz archive")?;
        }
    }
    Ok(())
}

/// Entry name inside an archive, always `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn write_tar<W: Write>(folder: &Path, writer: W) -> Result<W> {
    let mut tar = Builder::new(writer);

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.context("Failed to read directory entry")?;
        let name = entry_name(folder, entry.path())?;

        if entry.file_type().is_dir() {
            tar.append_dir(&name, entry.path())
        } else {
            tar.append_path_with_name(entry.path(), &name)
        }
        .with_context(|| format!("Failed to add {} to archive", entry.path().display()))?;
    }

    Ok(tar.into_inner().context("Failed to finish tar archive")?)
}

fn write_zip(folder: &Path, target: &Path) -> Result<()> {
    let file =
        File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.context("Failed to read directory entry")?;
        let name = entry_name(folder, entry.path())?;

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else {
            zip.start_file(name, options)?;
            let mut input = File::open(entry.path())
                .with_context(|| format!("Failed to open {}", entry.path().display()))?;
            io::copy(&mut input, &mut zip)?;
        }
    }

    zip.finish()?.flush()?;
    Ok(())
}
