use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WimError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("image {0} does not exist in the archive")]
    InvalidImage(u32),
    #[error("path \"{0}\" does not exist in the image")]
    PathDoesNotExist(String),
    #[error("{0:?} is not a directory")]
    NotDir(PathBuf),
    #[error("\"{0}\" is not a regular file")]
    NotRegularFile(String),
    #[error("allocation failed: {0}")]
    Nomem(&'static str),
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stat {path:?}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create directory {path:?}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write error")]
    Write(#[source] std::io::Error),
    #[error("read error")]
    Read(#[source] std::io::Error),
    #[error("failed to rename {from:?} to {to:?}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("NTFS backend error: {0}")]
    NtfsBackend(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("corrupt archive: {0}")]
    Corrupt(&'static str),
    #[error("stream requires a decompression codec that is not available")]
    UnsupportedCodec,
    #[error("archive has no backing filename")]
    NoFilename,
}

pub type Result<T> = std::result::Result<T, WimError>;

impl WimError {
    pub(crate) fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WimError::Open {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn stat(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WimError::Stat {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mkdir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WimError::Mkdir {
            path: path.into(),
            source,
        }
    }
}
