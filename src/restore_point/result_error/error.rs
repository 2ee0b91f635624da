use crate::restore_point::result_error::WithMsg;
use derive_more::Display;
use itertools::Itertools;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    ValidationErrors(#[from] validator::ValidationErrors),
    #[error("Restore point not found: {0:?}")]
    NotFound(String),
    #[error("Restore point already exists: {0:?}")]
    Conflict(String),
    #[error("Permission denied: {path:?}: {source}")]
    PermissionDenied {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error("{0}")]
    ChannelSendError(String),
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Coarse classification used for exit reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorCategory {
    #[display("ValidationError")]
    Validation,
    #[display("NotFound")]
    NotFound,
    #[display("Conflict")]
    Conflict,
    #[display("PermissionDenied")]
    PermissionDenied,
    #[display("IOFailure")]
    IoFailure,
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl Error {
    /// Wraps an I/O failure on `path`, keeping permission problems distinguishable.
    pub fn io_at<P: AsRef<Path>>(path: P, error: std::io::Error) -> Self {
        let path = path.as_ref();
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                path: path.to_path_buf(),
                source: error,
            }
        } else {
            Error::Io(error).with_msg(format!("I/O failure on {:?}", path))
        }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::ValidationErrors(_) => ErrorCategory::Validation,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Conflict(_) => ErrorCategory::Conflict,
            Error::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCategory::PermissionDenied
            }
            Error::WithMsg { error, .. } => error.category(),
            Error::LotsOfError(errors) => errors
                .first()
                .map(Error::category)
                .unwrap_or(ErrorCategory::IoFailure),
            _ => ErrorCategory::IoFailure,
        }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }
}
