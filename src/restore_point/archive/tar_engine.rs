use crate::restore_point::archive::progress::{CountingReader, CountingWriter, Progress, ProgressObserver};
use crate::restore_point::archive::source_tree::{ArchiveEntry, EntryKind, ExcludeSet, SourceTree, WalkItem};
use crate::restore_point::archive::{ArchiveEngine, ArchiveReport, SkippedEntry};
use crate::restore_point::compress::{CompressorBuilder, CompressorConfig, Decompressor};
use crate::restore_point::file_ext::FileExtProvider;
use crate::restore_point::finish::Finish;
use crate::restore_point::result_error::error::Error;
use crate::restore_point::result_error::result::Result;
use crate::restore_point::result_error::WithMsg;
use bon::Builder;
use itertools::Itertools;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, IntoInnerError, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, OnceLock};
use tar::HeaderMode;

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static TAR_BLOCK: u64 = 512;
/// Walk results buffered between the scanning thread and the archive writer
static ENTRY_CHANNEL_BOUND: usize = 256;

/// Archive engine writing (optionally compressed) tar streams.
///
/// Creation runs as a two-stage pipe: a scanning thread walks the sources and
/// feeds entries through a bounded channel, the calling thread appends them to the
/// tar stream, counting bytes on their way into the compressor.
#[derive(Debug, Clone, Builder)]
pub struct TarArchiveEngine {
    #[builder(default)]
    compressor: CompressorConfig,
    #[builder(default = ExcludeSet::empty())]
    excludes: ExcludeSet,
    /// Restore owners and groups recorded in the archive
    #[builder(default = true)]
    preserve_ownership: bool,
}

impl FileExtProvider for TarArchiveEngine {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()).clone())
                .chain(self.compressor.file_ext())
                .join(".")
                .into(),
        )
    }
}

impl ArchiveEngine for TarArchiveEngine {
    fn estimate_size(&self, sources: &[PathBuf]) -> Option<u64> {
        // end-of-archive marker
        let mut total = 2 * TAR_BLOCK;
        for source in sources {
            if let Err(e) = std::fs::symlink_metadata(source) {
                tracing::warn!("Cannot estimate size of {:?}: {}", source, e);
                return None;
            }
            total += SourceTree::new(source)
                .walk(self.excludes.clone())
                .filter_map(|item| match item {
                    WalkItem::Entry(entry) => Some(tar_stream_size(&entry)),
                    WalkItem::Skipped(_) => None,
                })
                .sum::<u64>();
        }
        Some(total)
    }

    fn create_archive(
        &self,
        sources: &[PathBuf],
        destination: &Path,
        progress: &dyn ProgressObserver,
        estimated_total: Option<u64>,
    ) -> Result<ArchiveReport> {
        let (item_tx, item_rx) = sync_channel(ENTRY_CHANNEL_BOUND);
        let trees = sources.iter().map(SourceTree::new).collect_vec();
        let excludes = self.excludes.clone();
        let walker = std::thread::spawn(move || -> Result<()> {
            for tree in trees {
                for item in tree.walk(excludes.clone()) {
                    item_tx.send(item)?;
                }
            }
            Ok(())
        });

        let archive_res = self.write_archive(item_rx, destination, Progress::new(progress, estimated_total));
        let walk_res = walker
            .join()
            .map_err(|_| Error::WorkerPanicked("source walker".into()))?;

        match (archive_res, walk_res) {
            (Ok(report), Ok(())) => {
                tracing::info!(
                    "Archived {} entries into {:?} ({} bytes, {} skipped)",
                    report.entries,
                    destination,
                    report.bytes_written,
                    report.skipped.len()
                );
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(e.with_msg("Walking restore point sources failed")),
            // the walker only fails because the writer hung up
            (Err(e), _) => Err(e.with_msg(format!("Writing archive {:?} failed", destination))),
        }
    }

    fn extract_archive(
        &self,
        source: &Path,
        destination_root: &Path,
        progress: &dyn ProgressObserver,
    ) -> Result<ArchiveReport> {
        if !destination_root.is_dir() {
            return Err(Error::io_at(
                destination_root,
                std::io::Error::new(ErrorKind::NotFound, "restore destination is not a directory"),
            ));
        }

        // permission bits say little for root or read-only mounts
        tempfile::tempfile_in(destination_root)
            .map_err(|e| Error::io_at(destination_root, e))
            .with_msg(format!("Restore destination {:?} is not writable", destination_root))?;

        let file = File::open(source).map_err(|e| Error::io_at(source, e))?;
        let total = file.metadata()?.len();
        let reader = BufReader::new(CountingReader::new(file, Progress::new(progress, Some(total))));
        let mut archive = tar::Archive::new(Decompressor::for_artifact(source, reader));
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(self.preserve_ownership);
        archive.set_overwrite(true);

        let mut report = ArchiveReport::default();
        for entry in archive
            .entries()
            .map_err(Error::from)
            .with_msg(format!("Reading archive {:?} failed", source))?
        {
            let mut entry = entry
                .map_err(Error::from)
                .with_msg(format!("Reading archive {:?} failed", source))?;
            let member = entry.path().map(|p| p.into_owned()).unwrap_or_default();
            let target = destination_root.join(&member);

            match entry.unpack_in(destination_root) {
                Ok(true) => report.entries += 1,
                Ok(false) => {
                    tracing::warn!("Refusing to unpack {:?} outside of {:?}", member, destination_root);
                    report
                        .skipped
                        .push(SkippedEntry::new(target, "path escapes the restore destination"));
                }
                Err(e) if is_stream_fatal(&e) => {
                    return Err(Error::io_at(&target, e)
                        .with_msg(format!("Extracting {:?} into {:?} failed", source, destination_root)));
                }
                Err(e) => {
                    tracing::warn!("Skipping {:?}: {}", target, e);
                    report.skipped.push(SkippedEntry::new(target, e.to_string()));
                }
            }
        }

        let counting = archive.into_inner().into_inner().into_inner();
        report.bytes_streamed = counting.count();
        Progress::new(progress, Some(total)).finish(report.bytes_streamed);
        if report.entries == 0 && !report.skipped.is_empty() {
            let first = &report.skipped[0];
            let reason = format!(
                "none of {} entries restored, first failure: {}",
                report.skipped.len(),
                first.reason
            );
            return Err(Error::io_at(&first.path, std::io::Error::other(reason))
                .with_msg(format!("Extracting {:?} into {:?} failed", source, destination_root)));
        }
        tracing::info!(
            "Restored {} entries from {:?} ({} skipped)",
            report.entries,
            source,
            report.skipped.len()
        );
        Ok(report)
    }
}

impl TarArchiveEngine {
    fn write_archive(
        &self,
        items: Receiver<WalkItem>,
        destination: &Path,
        progress: Progress<'_>,
    ) -> Result<ArchiveReport> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .map_err(|e| Error::io_at(destination, e))?;
        let compressor = self.compressor.build_compressor(BufWriter::new(file))?;
        let mut builder = tar::Builder::new(CountingWriter::new(BufWriter::new(compressor), progress));
        builder.mode(HeaderMode::Complete);
        builder.follow_symlinks(false);

        let mut report = ArchiveReport::default();
        for item in items {
            let skipped = match item {
                WalkItem::Skipped(skipped) => Some(skipped),
                WalkItem::Entry(entry) => append_entry(&mut builder, &entry)?,
            };
            match skipped {
                Some(skipped) => {
                    tracing::warn!("Skipping {}", skipped);
                    report.skipped.push(skipped);
                }
                None => report.entries += 1,
            }
        }

        let counting = builder.into_inner()?;
        report.bytes_streamed = counting.count();
        let file = counting
            .into_inner()
            .into_inner()
            .map_err(IntoInnerError::into_error)?
            .finish()?
            .into_inner()
            .map_err(IntoInnerError::into_error)?;
        file.sync_all()?;
        report.bytes_written = file.metadata()?.len();

        Ok(report)
    }
}

/// Appends one entry. Problems reading the source come back as a skip, problems
/// writing the stream as an error.
fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &ArchiveEntry,
) -> Result<Option<SkippedEntry>> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&entry.metadata, HeaderMode::Complete);

    let res = match entry.kind {
        EntryKind::Directory => builder.append_data(&mut header, &entry.dst, std::io::empty()),
        EntryKind::Symlink => {
            let target = match std::fs::read_link(&entry.src) {
                Ok(target) => target,
                Err(e) => return Ok(Some(SkippedEntry::new(&entry.src, e.to_string()))),
            };
            builder.append_link(&mut header, &entry.dst, target)
        }
        EntryKind::File => {
            let file = match File::open(&entry.src) {
                Ok(file) => file,
                Err(e) => return Ok(Some(SkippedEntry::new(&entry.src, e.to_string()))),
            };
            return append_file(builder, &mut header, entry, file);
        }
    };

    res.map(|_| None)
        .map_err(Error::from)
        .with_msg(format!("Appending {:?} to archive failed", entry.src))
}

/// The header already promised `metadata.len()` bytes: growth is cut, shrinkage and
/// read failures are zero-padded. A read failure turns the entry into a skip.
fn append_file<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    header: &mut tar::Header,
    entry: &ArchiveEntry,
    source: R,
) -> Result<Option<SkippedEntry>> {
    let len = entry.metadata.len();
    let mut source = ZeroFillOnError::new(source.take(len));
    builder
        .append_data(header, &entry.dst, (&mut source).chain(std::io::repeat(0)).take(len))
        .map_err(Error::from)
        .with_msg(format!("Appending {:?} to archive failed", entry.src))?;

    Ok(source.error.map(|e| {
        SkippedEntry::new(
            &entry.src,
            format!("read failed after {} bytes, archived zero-filled: {}", source.read, e),
        )
    }))
}

/// Ends the stream at the first read error and keeps the error.
struct ZeroFillOnError<R> {
    inner: R,
    read: u64,
    error: Option<std::io::Error>,
}

impl<R> ZeroFillOnError<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            read: 0,
            error: None,
        }
    }
}

impl<R: Read> Read for ZeroFillOnError<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.error.is_some() {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(n) => {
                self.read += n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.error = Some(e);
                Ok(0)
            }
        }
    }
}

fn tar_stream_size(entry: &ArchiveEntry) -> u64 {
    let data = match entry.kind {
        EntryKind::File => entry.metadata.len().div_ceil(TAR_BLOCK) * TAR_BLOCK,
        EntryKind::Directory | EntryKind::Symlink => 0,
    };
    TAR_BLOCK + data
}

/// Errors after which the rest of the archive cannot be trusted or written.
fn is_stream_fatal(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::StorageFull
            | ErrorKind::ReadOnlyFilesystem
            | ErrorKind::InvalidData
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore_point::archive::progress::tests::RecordingProgress;
    use crate::restore_point::archive::progress::NoProgress;
    use crate::restore_point::archive::source_tree::{archive_path_for, CustomDeserializedGlob};
    use crate::restore_point::archive::CompletionStatus;
    use crate::restore_point::compress::xz::XzConfig;
    use crate::restore_point::result_error::error::ErrorCategory;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn create_source(dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join("ssh"))?;
        std::fs::write(dir.join("hostname"), "restore-host\n")?;
        std::fs::write(dir.join("fstab"), "UUID=1234 / ext4 defaults 0 1\n".repeat(100))?;
        std::fs::write(dir.join("ssh/sshd_config"), "PermitRootLogin no\n")?;
        std::fs::write(dir.join("motd.cache"), "cached")?;
        std::os::unix::fs::symlink("hostname", dir.join("hostname.link"))?;
        Ok(())
    }

    fn engines() -> Vec<TarArchiveEngine> {
        vec![
            TarArchiveEngine::builder()
                .compressor(CompressorConfig::None)
                .preserve_ownership(false)
                .build(),
            TarArchiveEngine::builder()
                .compressor(CompressorConfig::Xz(XzConfig::builder().level(1).thread(1).build()))
                .preserve_ownership(false)
                .build(),
        ]
    }

    fn restored(root: &Path, original: &Path) -> PathBuf {
        root.join(archive_path_for(original))
    }

    #[test]
    fn test_file_ext() {
        let engines = engines();
        assert_eq!(engines[0].file_ext().as_deref(), Some("tar"));
        assert_eq!(engines[1].file_ext().as_deref(), Some("tar.xz"));
    }

    #[test]
    fn test_create_then_extract_reproduces_tree() {
        for engine in engines() {
            let temp_dir = TempDir::new().unwrap();
            let etc = temp_dir.path().join("src/etc");
            create_source(&etc).unwrap();
            let artifact = temp_dir.path().join(format!("a.{}", engine.file_ext().unwrap()));

            let report = engine
                .create_archive(&[etc.clone()], &artifact, &NoProgress, None)
                .unwrap();
            assert_eq!(report.status(), CompletionStatus::Complete);
            // etc, ssh, 4 files, 1 symlink
            assert_eq!(*report.entries(), 7);
            assert_eq!(*report.bytes_written(), std::fs::metadata(&artifact).unwrap().len());

            let dest = temp_dir.path().join("dest");
            std::fs::create_dir(&dest).unwrap();
            let report = engine.extract_archive(&artifact, &dest, &NoProgress).unwrap();
            assert_eq!(report.status(), CompletionStatus::Complete);

            for file in ["hostname", "fstab", "ssh/sshd_config", "motd.cache"] {
                assert_eq!(
                    std::fs::read(restored(&dest, &etc.join(file))).unwrap(),
                    std::fs::read(etc.join(file)).unwrap()
                );
            }
            assert_eq!(
                std::fs::read_link(restored(&dest, &etc.join("hostname.link"))).unwrap(),
                PathBuf::from("hostname")
            );
        }
    }

    #[test]
    fn test_extract_overwrites_existing_files() {
        let engine = &engines()[0];
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();
        let artifact = temp_dir.path().join("a.tar");
        engine.create_archive(&[etc.clone()], &artifact, &NoProgress, None).unwrap();

        let dest = temp_dir.path().join("dest");
        std::fs::create_dir_all(restored(&dest, &etc)).unwrap();
        std::fs::write(restored(&dest, &etc.join("hostname")), "changed\n").unwrap();
        std::fs::write(restored(&dest, &etc.join("extra")), "untouched").unwrap();

        engine.extract_archive(&artifact, &dest, &NoProgress).unwrap();
        assert_eq!(
            std::fs::read_to_string(restored(&dest, &etc.join("hostname"))).unwrap(),
            "restore-host\n"
        );
        // restore does not prune files absent from the archive
        assert!(restored(&dest, &etc.join("extra")).exists());
    }

    #[test]
    fn test_excluded_and_special_entries() {
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();
        let _socket = std::os::unix::net::UnixListener::bind(etc.join("agent.sock")).unwrap();

        let globs = vec![CustomDeserializedGlob::new("**/*.cache").unwrap()];
        let engine = TarArchiveEngine::builder()
            .compressor(CompressorConfig::None)
            .excludes(ExcludeSet::new(&globs, vec![]).unwrap())
            .build();
        let artifact = temp_dir.path().join("a.tar");
        let missing = temp_dir.path().join("missing");

        let report = engine
            .create_archive(&[etc.clone(), missing.clone()], &artifact, &NoProgress, None)
            .unwrap();
        assert_eq!(report.status(), CompletionStatus::Partial);
        let skipped: Vec<_> = report.skipped().iter().map(|s| s.path.clone()).collect();
        assert!(skipped.contains(&etc.join("agent.sock")));
        assert!(skipped.contains(&missing));
        assert_eq!(skipped.len(), 2);

        let mut archive = tar::Archive::new(File::open(&artifact).unwrap());
        let names: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect();
        assert!(names.contains(&archive_path_for(etc.join("fstab"))));
        assert!(!names.iter().any(|n| n.to_string_lossy().ends_with(".cache")));
    }

    #[test]
    fn test_progress_and_estimate() {
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();
        let engine = &engines()[0];
        let sources = vec![etc.clone()];

        let estimate = engine.estimate_size(&sources).unwrap();
        let recorder = RecordingProgress::default();
        let report = engine
            .create_archive(&sources, &temp_dir.path().join("a.tar"), &recorder, Some(estimate))
            .unwrap();

        assert!(estimate > 0);
        assert!(estimate <= *report.bytes_streamed());
        let updates = recorder.updates.lock().unwrap();
        assert!(!updates.is_empty());
        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(updates.iter().all(|(_, total)| *total == Some(estimate)));
        assert_eq!(*recorder.finished.lock().unwrap(), Some(*report.bytes_streamed()));

        assert_eq!(engine.estimate_size(&[temp_dir.path().join("gone")]), None);
    }

    #[test]
    fn test_unwritable_destination_is_hard_failure() {
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();

        let err = engines()[0]
            .create_archive(&[etc], &temp_dir.path().join("no/such/dir/a.tar"), &NoProgress, None)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::IoFailure);
    }

    #[test]
    fn test_extract_with_nothing_restored_fails() {
        let engine = &engines()[0];
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();
        let artifact = temp_dir.path().join("a.tar");
        engine.create_archive(&[etc.clone()], &artifact, &NoProgress, None).unwrap();

        // a plain file where the first member's directory belongs blocks every member
        let dest = temp_dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let first_component = archive_path_for(&etc).components().next().unwrap().as_os_str().to_owned();
        std::fs::write(dest.join(first_component), "in the way").unwrap();

        let err = engine.extract_archive(&artifact, &dest, &NoProgress).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::IoFailure);
        assert!(err.to_string().contains("none of 7 entries restored"));
    }

    #[test]
    fn test_extract_into_read_only_destination_fails() {
        let engine = &engines()[0];
        let temp_dir = TempDir::new().unwrap();
        let etc = temp_dir.path().join("etc");
        create_source(&etc).unwrap();
        let artifact = temp_dir.path().join("a.tar");
        engine.create_archive(&[etc.clone()], &artifact, &NoProgress, None).unwrap();

        let dest = temp_dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o555)).unwrap();
        let writable_anyway = tempfile::tempfile_in(&dest).is_ok();

        let res = engine.extract_archive(&artifact, &dest, &NoProgress);
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).unwrap();
        if writable_anyway {
            // running as root, mode bits do not apply
            assert!(res.is_ok());
            return;
        }
        assert_eq!(res.unwrap_err().category(), ErrorCategory::PermissionDenied);
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Err(std::io::Error::other("input/output error"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'a');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_failure_mid_file_is_skipped_and_zero_filled() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("etc/big.conf");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, vec![b'x'; 4096]).unwrap();
        let entry = ArchiveEntry {
            src: src.clone(),
            dst: archive_path_for(&src),
            kind: EntryKind::File,
            metadata: std::fs::symlink_metadata(&src).unwrap(),
        };

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&entry.metadata, HeaderMode::Complete);
        let skipped = append_file(&mut builder, &mut header, &entry, FailingReader { remaining: 1000 })
            .unwrap()
            .unwrap();
        assert_eq!(skipped.path, src);
        assert!(skipped.reason.contains("after 1000 bytes"));

        let tar = builder.into_inner().unwrap();
        let mut archive = tar::Archive::new(tar.as_slice());
        let mut member = archive.entries().unwrap().next().unwrap().unwrap();
        let mut data = Vec::new();
        member.read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data[..1000].iter().all(|b| *b == b'a'));
        assert!(data[1000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_extract_failures() {
        let temp_dir = TempDir::new().unwrap();
        let garbage = temp_dir.path().join("a.tar.xz");
        std::fs::write(&garbage, vec![0x42u8; 4096]).unwrap();

        for engine in engines() {
            assert!(engine
                .extract_archive(&garbage, temp_dir.path(), &NoProgress)
                .is_err());
            assert!(engine
                .extract_archive(&garbage, &temp_dir.path().join("missing"), &NoProgress)
                .is_err());
            assert!(engine
                .extract_archive(&temp_dir.path().join("none.tar"), temp_dir.path(), &NoProgress)
                .is_err());
        }
    }
}
