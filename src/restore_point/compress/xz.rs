use crate::restore_point::compress::{Compressor, CompressorBuilder};
use crate::restore_point::result_error::result::Result;
use bon::Builder;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use std::num::NonZero;
use validator::Validate;

/// Default compression level (balance of speed vs size)
static DEFAULT_COMPRESSION_LEVEL: u32 = 6;
/// Maximum threads to prevent resource exhaustion
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

/// Configuration for XZ (LZMA) compression of restore-point artifacts
///
/// Configuration trees compress very well, so the default leans towards ratio.
/// Home directories are larger, and multiple threads keep full restore points
/// from taking hours.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq, Builder)]
#[serde(deny_unknown_fields)]
pub struct XzConfig {
    /// Compression level (0-9)
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,

    /// Number of compression threads, half of the available cores when unset
    #[validate(range(min = 1))]
    thread: Option<u32>,
}

impl<W: Write> CompressorBuilder<W> for XzConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);

        let thread = self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| core / 2)
                .map(|t| t.max(1))
                .map(|t| t.min(DEFAULT_MAX_PARALLELIZATION) as u32)
                .unwrap_or(1)
        });

        tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

        if thread == 1 {
            Ok(Compressor::XzEncoder(XzEncoder::new(writer, level)))
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .encoder()?;
            Ok(Compressor::XzEncoder(XzEncoder::new_stream(writer, stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_xz_config_default() {
        let config = XzConfig::default();
        assert!(config.level.is_none());
        assert!(config.thread.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_xz_config_validation() {
        assert!(XzConfig::builder().level(0).thread(1).build().validate().is_ok());
        assert!(XzConfig::builder().level(9).thread(8).build().validate().is_ok());
        assert!(XzConfig::builder().level(10).build().validate().is_err());
        assert!(XzConfig::builder().thread(0).build().validate().is_err());
    }

    #[test]
    fn test_build_compressor_single_and_multi_thread() {
        for thread in [1, 4] {
            let config = XzConfig::builder().level(1).thread(thread).build();
            match config.build_compressor(Cursor::new(Vec::new())).unwrap() {
                Compressor::XzEncoder(_) => (),
                _ => panic!("Expected XzEncoder"),
            }
        }
    }

    #[test]
    fn test_xz_config_yaml() {
        let config: XzConfig = serde_yml::from_str("level: 2\nthread: 3\n").unwrap();
        assert_eq!(config, XzConfig::builder().level(2).thread(3).build());
        assert!(serde_yml::from_str::<XzConfig>("levle: 2\n").is_err());
    }
}
