use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::driver::LoaderState;

// Variants raised while a fault is being served only hold integers and
// errno-backed io::Error values, so building them does not allocate.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("page size must be a non-zero power of two, got {page_size}")]
    InvalidPageSize { page_size: usize },
    #[error("cannot allocate page-state table for {pages} pages")]
    Allocation { pages: usize },
    #[error("cannot map page at {addr:#x}: {source}")]
    Map {
        addr: usize,
        #[source]
        source: io::Error,
    },
    #[error("cannot change protection of page at {addr:#x}: {source}")]
    Protect {
        addr: usize,
        #[source]
        source: io::Error,
    },
    #[error("cannot read {len} bytes at file offset {offset:#x}: {source}")]
    Io {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("cannot unmap page at {addr:#x}: {source}")]
    Unmap {
        addr: usize,
        #[source]
        source: io::Error,
    },
    #[error("cannot install SIGSEGV handler: {0}")]
    SignalSetup(#[source] io::Error),
    #[error("cannot load {path:?}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("loader is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: LoaderState,
        actual: LoaderState,
    },
    #[error("another execution session is already running")]
    SessionBusy,
}

impl LoaderError {
    pub(crate) fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LoaderError::Load {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
