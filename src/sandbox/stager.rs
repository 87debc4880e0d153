//! Archive staging.
//!
//! Extracts a submitted agent archive into a per-job working directory.
//! Supported inputs are `.tar`, `.tar.gz`/`.tgz` (detected by extension or
//! gzip magic bytes) and plain directories, which are copied.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ArchiveError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Detected archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Directory,
}

impl ArchiveFormat {
    /// Detects the format of `path` from its extension, falling back to the
    /// gzip magic bytes for unrecognised names.
    pub fn detect(path: &Path) -> Result<Self, ArchiveError> {
        if path.is_dir() {
            return Ok(Self::Directory);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Ok(Self::TarGz);
        }
        if name.ends_with(".tar") {
            return Ok(Self::Tar);
        }

        let mut magic = [0u8; 2];
        let read = File::open(path)?.read(&mut magic)?;
        if read == 2 && magic == GZIP_MAGIC {
            return Ok(Self::TarGz);
        }

        Err(ArchiveError::ExtractionFailed {
            path: path.to_path_buf(),
            reason: format!("unsupported archive format: {name}"),
        })
    }
}

/// Stages agent archives into isolated working directories under a root.
#[derive(Debug, Clone)]
pub struct ArchiveStager {
    root: PathBuf,
}

impl ArchiveStager {
    /// Creates a stager that places work directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory for work directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the work directory path for a job.
    pub fn workdir_for(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Creates the (empty) work directory for a job.
    pub fn prepare(&self, job_id: &str) -> Result<PathBuf, ArchiveError> {
        let workdir = self.workdir_for(job_id);
        fs::create_dir_all(&workdir)?;
        Ok(workdir)
    }

    /// Extracts `archive` into `workdir`. The source archive is never modified.
    pub fn extract(&self, archive: &Path, workdir: &Path) -> Result<(), ArchiveError> {
        if !archive.exists() {
            return Err(ArchiveError::NotFound(archive.to_path_buf()));
        }

        let format = ArchiveFormat::detect(archive)?;
        debug!(archive = %archive.display(), ?format, "Extracting agent archive");

        let extraction = match format {
            ArchiveFormat::Tar => {
                let file = File::open(archive)?;
                tar::Archive::new(BufReader::new(file)).unpack(workdir)
            }
            ArchiveFormat::TarGz => {
                let file = File::open(archive)?;
                tar::Archive::new(GzDecoder::new(BufReader::new(file))).unpack(workdir)
            }
            ArchiveFormat::Directory => copy_dir_recursive(archive, workdir),
        };

        extraction.map_err(|e| ArchiveError::ExtractionFailed {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!(
            archive = %archive.display(),
            workdir = %workdir.display(),
            "Staged agent archive"
        );
        Ok(())
    }

    /// Prepares the job directory and extracts the archive into it.
    pub fn stage(&self, archive: &Path, job_id: &str) -> Result<PathBuf, ArchiveError> {
        let workdir = self.prepare(job_id)?;
        self.extract(archive, &workdir)?;
        Ok(workdir)
    }
}

/// Recursively copies a directory.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
