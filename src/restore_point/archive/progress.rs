//! Byte-progress plumbing between the archive stream and whoever renders it.
//!
//! Counting happens inline on the stream: [`CountingWriter`] sits between the tar
//! builder and the compressor when creating, [`CountingReader`] sits on the artifact
//! file when extracting.

use std::io::{Read, Write};

/// Receives `(bytes processed, estimated total)` as the stream advances.
///
/// `processed` never decreases. The total is `None` when it could not be estimated.
pub trait ProgressObserver {
    fn on_progress(&self, processed: u64, estimated_total: Option<u64>);

    fn on_finish(&self, _processed: u64, _estimated_total: Option<u64>) {}
}

/// Observer for callers that do not render anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _processed: u64, _estimated_total: Option<u64>) {}
}

/// `min(100, round(processed / total * 100))`, or `None` when there is no usable total.
pub fn percentage(processed: u64, estimated_total: Option<u64>) -> Option<u8> {
    let total = estimated_total.filter(|t| *t > 0)? as u128;
    let pct = (processed as u128 * 100 + total / 2) / total;
    Some(pct.min(100) as u8)
}

/// An observer paired with the total it reports against.
#[derive(Clone, Copy)]
pub struct Progress<'a> {
    observer: &'a dyn ProgressObserver,
    estimated_total: Option<u64>,
}

impl<'a> Progress<'a> {
    pub fn new(observer: &'a dyn ProgressObserver, estimated_total: Option<u64>) -> Self {
        Self {
            observer,
            estimated_total,
        }
    }

    fn report(&self, processed: u64) {
        self.observer.on_progress(processed, self.estimated_total);
    }

    pub fn finish(&self, processed: u64) {
        self.observer.on_finish(processed, self.estimated_total);
    }
}

pub struct CountingWriter<'a, W: Write> {
    inner: W,
    count: u64,
    progress: Progress<'a>,
}

impl<'a, W: Write> CountingWriter<'a, W> {
    pub fn new(inner: W, progress: Progress<'a>) -> Self {
        Self {
            inner,
            count: 0,
            progress,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.progress.finish(self.count);
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.count += n as u64;
            self.progress.report(self.count);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct CountingReader<'a, R: Read> {
    inner: R,
    count: u64,
    progress: Progress<'a>,
}

impl<'a, R: Read> CountingReader<'a, R> {
    pub fn new(inner: R, progress: Progress<'a>) -> Self {
        Self {
            inner,
            count: 0,
            progress,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.count += n as u64;
            self.progress.report(self.count);
        }
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Records every notification for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingProgress {
        pub(crate) updates: Mutex<Vec<(u64, Option<u64>)>>,
        pub(crate) finished: Mutex<Option<u64>>,
    }

    impl ProgressObserver for RecordingProgress {
        fn on_progress(&self, processed: u64, estimated_total: Option<u64>) {
            self.updates.lock().unwrap().push((processed, estimated_total));
        }

        fn on_finish(&self, processed: u64, _estimated_total: Option<u64>) {
            *self.finished.lock().unwrap() = Some(processed);
        }
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, Some(200)), Some(0));
        assert_eq!(percentage(1, Some(200)), Some(1));
        assert_eq!(percentage(50, Some(200)), Some(25));
        assert_eq!(percentage(199, Some(200)), Some(100));
        assert_eq!(percentage(200, Some(200)), Some(100));
        // stale estimates are clamped
        assert_eq!(percentage(500, Some(200)), Some(100));
        assert_eq!(percentage(10, None), None);
        assert_eq!(percentage(10, Some(0)), None);
        assert_eq!(percentage(u64::MAX, Some(u64::MAX)), Some(100));
    }

    #[test]
    fn test_counting_writer_reports_monotonic_counts() {
        let recorder = RecordingProgress::default();
        let mut writer = CountingWriter::new(Vec::new(), Progress::new(&recorder, Some(10)));
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"").unwrap();
        writer.write_all(b"defgh").unwrap();
        assert_eq!(writer.count(), 8);
        let inner = writer.into_inner();
        assert_eq!(inner, b"abcdefgh");

        let updates = recorder.updates.lock().unwrap();
        assert!(updates.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(updates.last(), Some(&(8, Some(10))));
        assert_eq!(*recorder.finished.lock().unwrap(), Some(8));
    }

    #[test]
    fn test_counting_reader() {
        let recorder = RecordingProgress::default();
        let mut reader =
            CountingReader::new(Cursor::new(vec![7u8; 5000]), Progress::new(&recorder, None));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 5000);
        assert_eq!(reader.count(), 5000);
        assert_eq!(recorder.updates.lock().unwrap().last(), Some(&(5000, None)));
    }

    #[test]
    fn test_no_progress_is_silent() {
        let mut writer = CountingWriter::new(Vec::new(), Progress::new(&NoProgress, None));
        writer.write_all(b"data").unwrap();
        assert_eq!(writer.into_inner(), b"data");
    }
}
