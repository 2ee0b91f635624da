pub mod xz;

use crate::restore_point::file_ext::FileExtProvider;
use crate::restore_point::finish::Finish;
use crate::restore_point::result_error::result::Result;
use crate::restore_point::result_error::WithMsg;
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Read, Write};
use std::path::Path;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(io_enum::Write)]
pub enum Compressor<W: Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

#[derive(io_enum::Read)]
pub enum Decompressor<R: Read> {
    None(R),
    XzDecoder(XzDecoder<R>),
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Xz(xz::XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Xz(xz::XzConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .with_msg(format!("Building compressor {:?} failed", self))
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()),
        }
    }
}

impl<R: Read> Decompressor<R> {
    /// Picks the decoder from the artifact's extension, as written by [`CompressorConfig`].
    pub fn for_artifact<P: AsRef<Path>>(artifact: P, reader: R) -> Self {
        match artifact.as_ref().extension().and_then(|e| e.to_str()) {
            Some("xz") => Decompressor::XzDecoder(XzDecoder::new(reader)),
            _ => Decompressor::None(reader),
        }
    }

    pub fn into_inner(self) -> R {
        match self {
            Decompressor::None(r) => r,
            Decompressor::XzDecoder(d) => d.into_inner(),
        }
    }
}
