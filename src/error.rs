use std::io;

use thiserror::Error;

/// Errors produced by the analysis library.
///
/// Each variant corresponds to one failure domain; the tools print the
/// message and exit with a nonzero status, except for `Decode` errors
/// raised mid-scan, which the explorer turns into a rollback.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Arg(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("internal error: {0}")]
    Logic(String),
    #[error("instruction decode error: {0}")]
    Decode(String),
    #[error("memory access error: {0}")]
    Memory(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("executable format error: {0}")]
    Dos(String),
    #[error("analysis error: {0}")]
    Analysis(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand used by file parsers to report a failure on a given line.
    pub fn parse_line(lineno: usize, msg: impl AsRef<str>) -> Self {
        Error::Parse(format!("line {}: {}", lineno, msg.as_ref()))
    }
}
