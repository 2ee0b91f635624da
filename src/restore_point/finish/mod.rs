use liblzma::write::XzEncoder;
use std::io::{Error, Write};

/// Flushes trailing stream state and hands back the wrapped writer.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct TestFinisher {
        inner: Cursor<Vec<u8>>,
        should_fail: bool,
    }

    impl Finish<Cursor<Vec<u8>>> for TestFinisher {
        fn finish(self) -> Result<Cursor<Vec<u8>>, Error> {
            if self.should_fail {
                Err(Error::other("Test failure"))
            } else {
                Ok(self.inner)
            }
        }
    }

    #[test]
    fn test_finish_trait() {
        let finisher = TestFinisher {
            inner: Cursor::new(vec![1, 2, 3]),
            should_fail: false,
        };
        assert_eq!(finisher.finish().unwrap().get_ref(), &vec![1, 2, 3]);

        let finisher = TestFinisher {
            inner: Cursor::new(vec![]),
            should_fail: true,
        };
        assert_eq!(finisher.finish().unwrap_err().to_string(), "Test failure");
    }

    #[test]
    fn test_xz_encoder_finish_writes_stream_footer() {
        let mut encoder = XzEncoder::new(Cursor::new(Vec::new()), 1);
        encoder.write_all(b"restore point").unwrap();
        let cursor = Finish::finish(encoder).unwrap();
        // xz streams end with the "YZ" footer magic
        assert!(cursor.get_ref().ends_with(b"YZ"));
    }
}
