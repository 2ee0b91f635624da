pub mod progress;
pub mod source_tree;
pub mod tar_engine;

use crate::restore_point::archive::progress::ProgressObserver;
use crate::restore_point::file_ext::FileExtProvider;
use crate::restore_point::result_error::result::Result;
use derive_more::Display;
use getset::Getters;
use std::path::{Path, PathBuf};

/// A path left out of an archive (or out of a restore) with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{}: {}", path.display(), reason)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

impl SkippedEntry {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CompletionStatus {
    #[display("complete")]
    Complete,
    /// Finished, but one or more entries were skipped
    #[display("partial")]
    Partial,
}

#[derive(Debug, Default, Clone, Getters)]
#[getset(get = "pub")]
pub struct ArchiveReport {
    /// Bytes that passed the progress stage
    bytes_streamed: u64,
    /// Size of the written artifact, zero for extraction
    bytes_written: u64,
    /// Entries archived or restored
    entries: u64,
    skipped: Vec<SkippedEntry>,
}

impl ArchiveReport {
    pub fn status(&self) -> CompletionStatus {
        if self.skipped.is_empty() {
            CompletionStatus::Complete
        } else {
            CompletionStatus::Partial
        }
    }

    pub fn into_skipped(self) -> Vec<SkippedEntry> {
        self.skipped
    }
}

/// Streams source trees into one artifact and back.
///
/// Per-entry problems end up in [`ArchiveReport::skipped`]; an `Err` means the
/// stream itself failed and whatever was written must not be trusted.
pub trait ArchiveEngine: FileExtProvider {
    /// Expected number of bytes the create stream will carry, `None` when a source
    /// cannot be inspected.
    fn estimate_size(&self, sources: &[PathBuf]) -> Option<u64>;

    fn create_archive(
        &self,
        sources: &[PathBuf],
        destination: &Path,
        progress: &dyn ProgressObserver,
        estimated_total: Option<u64>,
    ) -> Result<ArchiveReport>;

    /// Unpacks `source` below `destination_root`, overwriting what is there.
    fn extract_archive(
        &self,
        source: &Path,
        destination_root: &Path,
        progress: &dyn ProgressObserver,
    ) -> Result<ArchiveReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_status() {
        let mut report = ArchiveReport::default();
        assert_eq!(report.status(), CompletionStatus::Complete);

        report.skipped.push(SkippedEntry::new("/etc/shadow", "Permission denied"));
        assert_eq!(report.status(), CompletionStatus::Partial);
        assert_eq!(report.skipped()[0].to_string(), "/etc/shadow: Permission denied");
        assert_eq!(report.into_skipped().len(), 1);
    }
}
