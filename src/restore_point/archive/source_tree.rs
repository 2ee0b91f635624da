use crate::restore_point::archive::SkippedEntry;
use crate::restore_point::result_error::result::Result;

use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::Formatter;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::result;

/// A glob pattern wrapper that handles custom deserialization
///
/// Wraps the `globset::Glob` type with custom serde support for
/// deserializing glob patterns from strings. Literal separator mode is
/// always on, so `*` never crosses a `/`.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    glob: Glob,
}

impl CustomDeserializedGlob {
    pub fn new<S: AsRef<str>>(pattern: S) -> Result<Self> {
        Ok(GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?
            .into())
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

/// Paths that never enter an archive: configured globs matched against absolute
/// paths, plus protected prefixes such as the backup root itself.
#[derive(Clone, Debug)]
pub struct ExcludeSet {
    globs: GlobSet,
    protected: Vec<PathBuf>,
}

impl ExcludeSet {
    pub fn new<'a, I: IntoIterator<Item = &'a CustomDeserializedGlob>>(
        globs: I,
        protected: Vec<PathBuf>,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            builder.add(glob.glob.clone());
        }
        Ok(Self {
            globs: builder.build()?,
            protected,
        })
    }

    pub fn empty() -> Self {
        Self {
            globs: GlobSet::empty(),
            protected: Vec::new(),
        }
    }

    pub fn is_excluded<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        self.protected.iter().any(|p| path.starts_with(p)) || self.globs.is_match(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// One filesystem object bound for the archive.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Absolute path on the live filesystem
    pub src: PathBuf,
    /// Path inside the archive, `src` without its leading `/`
    pub dst: PathBuf,
    pub kind: EntryKind,
    /// Metadata of the entry itself, symlinks are not followed
    pub metadata: Metadata,
}

#[derive(Debug)]
pub enum WalkItem {
    Entry(ArchiveEntry),
    Skipped(SkippedEntry),
}

/// Archive member name for an absolute source path.
pub fn archive_path_for<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

/// One top-level source directory of a restore point.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Walks the tree depth-first, parents before children.
    ///
    /// Unreadable or special entries come out as [`WalkItem::Skipped`] rather than
    /// ending the walk; a missing root yields a single skipped item.
    pub fn walk<'a>(&self, excludes: ExcludeSet) -> DynIter<'a, WalkItem> {
        tracing::info!("Starting directory scan: {:?}", self.root);

        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |de| {
                let excluded = excludes.is_excluded(de.path());
                if excluded {
                    tracing::debug!("Excluding {:?}", de.path());
                }
                !excluded
            })
            .map(|res| match res {
                Ok(de) => process_dir_entry(de),
                Err(e) => WalkItem::Skipped(SkippedEntry::new(
                    e.path().map(Path::to_path_buf).unwrap_or_default(),
                    e.to_string(),
                )),
            })
            .into_dyn_iter()
    }
}

fn process_dir_entry(de: DirEntry) -> WalkItem {
    let metadata = match de.metadata() {
        Ok(md) => md,
        Err(e) => return WalkItem::Skipped(SkippedEntry::new(de.into_path(), e.to_string())),
    };

    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        return WalkItem::Skipped(SkippedEntry::new(de.into_path(), "special file"));
    };

    let src = de.into_path();
    let dst = archive_path_for(&src);
    tracing::trace!("Including {:?} -> {:?}", src, dst);
    WalkItem::Entry(ArchiveEntry {
        src,
        dst,
        kind,
        metadata,
    })
}
