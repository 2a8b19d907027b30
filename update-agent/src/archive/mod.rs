//! Release archive extraction (`.tar.gz`).
//!
//! The archive is decompressed in one go (release payloads are small), then
//! handed to the [`ustar`] reader on a blocking thread and written out file
//! by file.

pub mod ustar;

use async_compression::tokio::bufread::GzipDecoder;
use std::path::Path;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, info};

use crate::fs::{write_atomic, FileMetadata};
use crate::layout::safe_join;
use crate::utils::{Result, UpdateError};

/// A file written out of the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// Path relative to the payload root (`static/app.js`)
    pub path: String,
    pub size: u64,
    pub mtime: i64,
}

struct ArchiveFile {
    path: String,
    data: Vec<u8>,
    mode: u32,
    mtime: u64,
}

/// Decompress a whole gzip file into memory.
pub async fn decompress_gzip(path: &Path) -> Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut decoder = GzipDecoder::new(BufReader::new(file));
    decoder.multiple_members(true);

    let mut tar = Vec::new();
    decoder
        .read_to_end(&mut tar)
        .await
        .map_err(|e| UpdateError::Archive(format!("gzip decompression failed: {}", e)))?;

    debug!("Decompressed {} to {} bytes", path.display(), tar.len());
    Ok(tar)
}

/// Extract every regular file of `archive` below `dest`.
pub async fn extract_to_dir(archive: &Path, dest: &Path) -> Result<Vec<ExtractedFile>> {
    let tar = decompress_gzip(archive).await?;

    let files = tokio::task::spawn_blocking(move || {
        ustar::unpack(&tar)
            .into_iter()
            .map(|entry| ArchiveFile {
                path: entry.path,
                data: entry.data.to_vec(),
                mode: entry.mode,
                mtime: entry.mtime,
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| UpdateError::Archive(format!("extraction task failed: {}", e)))?;

    if files.is_empty() {
        return Err(UpdateError::Archive(format!(
            "{} contains no extractable files",
            archive.display()
        )));
    }

    tokio::fs::create_dir_all(dest).await?;

    let mut extracted = Vec::with_capacity(files.len());
    for file in files {
        let target = safe_join(dest, &file.path)
            .ok_or_else(|| UpdateError::Archive(format!("unsafe path in archive: {}", file.path)))?;

        let metadata = FileMetadata::from_tar(file.data.len() as u64, file.mode, file.mtime);
        write_atomic(&target, &file.data, &metadata).await?;

        extracted.push(ExtractedFile {
            path: file.path,
            size: metadata.size,
            mtime: metadata.mtime_secs(),
        });
    }

    info!("Extracted {} files into {}", extracted.len(), dest.display());
    Ok(extracted)
}
