//! Directory-backed store of restore points.
//!
//! Each restore point is two files in the backup root: the artifact
//! (`<name>.tar.xz`) and a JSON sidecar (`<name>.json`) describing it. Both are
//! written under dot-prefixed temporary names and renamed into place without
//! clobbering, the artifact last. Only entries whose sidecar parses and whose
//! artifact is a readable, non-empty file are ever listed or resolved.

use crate::restore_point::archive::SkippedEntry;
use crate::restore_point::result_error::error::Error;
use crate::restore_point::result_error::result::Result;
use crate::restore_point::result_error::WithMsg;
use crate::restore_point::validate::validate_restore_point_name;
use chrono::NaiveDateTime;
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::fs::{DirBuilder, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

static METADATA_EXT: &str = "json";
static STAGING_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestorePointKind {
    /// System configuration only
    #[default]
    #[display("system")]
    System,
    /// System configuration plus user data
    #[display("full")]
    Full,
}

/// Sidecar content of one restore point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct RestorePointRecord {
    name: String,
    kind: RestorePointKind,
    included_sources: Vec<PathBuf>,
    /// The subset of `included_sources` that were removable volumes
    #[serde(default)]
    removable_sources: Vec<PathBuf>,
    created_at: NaiveDateTime,
    /// Artifact file name, relative to the backup root
    archive_file: String,
}

impl RestorePointRecord {
    pub fn new(
        name: String,
        kind: RestorePointKind,
        included_sources: Vec<PathBuf>,
        removable_sources: Vec<PathBuf>,
        created_at: NaiveDateTime,
        artifact_ext: &str,
    ) -> Self {
        let archive_file = format!("{name}.{artifact_ext}");
        Self {
            name,
            kind,
            included_sources,
            removable_sources,
            created_at,
            archive_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RestorePoint {
    record: RestorePointRecord,
    archive_path: PathBuf,
}

impl RestorePoint {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Size of the artifact, read from disk on every call.
    pub fn size_bytes(&self) -> Result<u64> {
        std::fs::metadata(&self.archive_path)
            .map(|md| md.len())
            .map_err(|e| Error::io_at(&self.archive_path, e))
    }
}

/// Result of [`Registry::list`]: the listable restore points, newest first, and the
/// entries that were passed over.
#[derive(Debug, Default)]
pub struct Listing {
    pub points: Vec<RestorePoint>,
    pub warnings: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// `<label>_<YYYYMMDD>_<HHMMSS>`
    pub fn make_name(label: &str, at: NaiveDateTime) -> String {
        format!("{}_{}", label, at.format("%Y%m%d_%H%M%S"))
    }

    /// Creates the backup root, owner-only, if it is missing.
    pub fn ensure_root(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .map_err(|e| Error::io_at(&self.root, e))
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{METADATA_EXT}"))
    }

    pub fn list(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        let read_dir = match std::fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Backup root {:?} does not exist yet", self.root);
                return Ok(listing);
            }
            Err(e) => return Err(Error::io_at(&self.root, e)),
        };

        for de in read_dir {
            let de = de.map_err(|e| Error::io_at(&self.root, e))?;
            let path = de.path();
            let hidden = de.file_name().to_string_lossy().starts_with('.');
            if hidden || path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            match self.load(&path) {
                Ok(point) => listing.points.push(point),
                Err(e) => {
                    tracing::warn!("Skipping restore point entry {:?}: {}", path, e);
                    listing.warnings.push(SkippedEntry::new(path, e.to_string()));
                }
            }
        }

        listing.points.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then_with(|| a.record.name.cmp(&b.record.name))
        });
        Ok(listing)
    }

    /// Exact, case-sensitive lookup of a fully materialized restore point.
    pub fn resolve(&self, name: &str) -> Result<RestorePoint> {
        validate_restore_point_name(name).map_err(|e| Error::validation(e.to_string()))?;
        let path = self.metadata_path(name);
        if !path.exists() {
            return Err(Error::NotFound(name.to_string()));
        }
        self.load(&path)
            .map_err(|e| Error::NotFound(name.to_string()).chain(e))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metadata_path(name).exists()
    }

    /// A fresh, hidden temporary file in the backup root to stream an artifact into.
    /// Dropping the returned path deletes the file.
    pub fn staging_file(&self, name: &str) -> Result<TempPath> {
        tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.root)
            .map(|f| f.into_temp_path())
            .map_err(|e| Error::io_at(&self.root, e))
            .with_msg(format!("Cannot stage restore point {name:?}"))
    }

    /// Moves a staged artifact into place and makes it listable. Fails with
    /// `Conflict` if the name is already taken; the staged file is then discarded.
    pub fn publish(&self, record: RestorePointRecord, staged: TempPath) -> Result<RestorePoint> {
        let name = record.name.clone();
        let metadata_path = self.metadata_path(&name);
        let archive_path = self.root.join(&record.archive_file);

        let mut metadata = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.root)
            .map_err(|e| Error::io_at(&self.root, e))?;
        {
            let mut writer = BufWriter::new(metadata.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &record)?;
            writer.flush()?;
        }
        metadata.as_file().sync_all()?;

        metadata
            .persist_noclobber(&metadata_path)
            .map_err(|e| conflict_or_io(&name, &metadata_path, e.error))?;

        if let Err(e) = staged.persist_noclobber(&archive_path) {
            let err = conflict_or_io(&name, &archive_path, e.error);
            return match std::fs::remove_file(&metadata_path) {
                Ok(()) => Err(err),
                Err(cleanup) => Err(err.chain(Error::io_at(&metadata_path, cleanup))),
            };
        }

        if let Err(e) = File::open(&self.root).and_then(|dir| dir.sync_all()) {
            tracing::warn!("Cannot sync backup root {:?}: {}", self.root, e);
        }
        tracing::info!("Published restore point {:?} at {:?}", name, archive_path);
        Ok(RestorePoint {
            record,
            archive_path,
        })
    }

    /// Deletes a restore point for good.
    pub fn remove(&self, name: &str) -> Result<()> {
        let point = self.resolve(name)?;
        std::fs::remove_file(&point.archive_path)
            .map_err(|e| Error::io_at(&point.archive_path, e))
            .with_msg(format!("Cannot delete restore point {name:?}"))?;
        let metadata_path = self.metadata_path(name);
        std::fs::remove_file(&metadata_path)
            .map_err(|e| Error::io_at(&metadata_path, e))
            .with_msg(format!("Cannot delete metadata of restore point {name:?}"))?;
        tracing::info!("Removed restore point {:?}", name);
        Ok(())
    }

    fn load(&self, metadata_path: &Path) -> Result<RestorePoint> {
        let file = File::open(metadata_path).map_err(|e| Error::io_at(metadata_path, e))?;
        let record: RestorePointRecord = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(Error::from)
            .with_msg(format!("Invalid restore point metadata {metadata_path:?}"))?;

        let stem = metadata_path.file_stem().map(|s| s.to_string_lossy());
        if stem.as_deref() != Some(record.name.as_str()) {
            return Err(Error::validation(format!(
                "metadata names restore point {:?}",
                record.name
            )));
        }
        validate_restore_point_name(&record.archive_file)
            .map_err(|e| Error::validation(e.to_string()))?;

        let archive_path = self.root.join(&record.archive_file);
        let md = std::fs::metadata(&archive_path).map_err(|e| Error::io_at(&archive_path, e))?;
        if !md.is_file() || md.len() == 0 {
            return Err(Error::validation(format!(
                "artifact {archive_path:?} is empty or not a file"
            )));
        }
        File::open(&archive_path).map_err(|e| Error::io_at(&archive_path, e))?;

        Ok(RestorePoint {
            record,
            archive_path,
        })
    }
}

fn conflict_or_io(name: &str, path: &Path, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::AlreadyExists {
        Error::Conflict(name.to_string())
    } else {
        Error::io_at(path, e).with_msg(format!("Cannot publish restore point {name:?}"))
    }
}
