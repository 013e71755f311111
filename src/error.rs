//! Typed error surface for callers that need to branch on error kind.
//!
//! Everything in the hot paths still returns `anyhow::Result` with
//! `.context(...)` call-site trails; this enum exists only where a caller
//! needs to `match` on what went wrong (CLI exit codes, construction-time
//! validation).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsslError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("I/O error reading/writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed input: {0}")]
    Format(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
