//! Error taxonomy for the orchestration engine.

use std::path::PathBuf;
use std::sync::OnceLock;

use obs_client::ObsError;
use regex::Regex;

/// klp-build engine errors.
#[derive(Debug, thiserror::Error)]
pub enum KlpError {
    /// Missing directory, identity or persisted input; raised before any
    /// remote interaction.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid codestream filter '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid codestream identifier: {0}")]
    InvalidCodestream(String),

    #[error("unknown codestream: {0}")]
    UnknownCodestream(String),

    #[error("build service error: {0}")]
    Service(#[from] ObsError),

    #[error("{program} failed in {}: {stderr}", .dir.display())]
    Command {
        program: String,
        dir: PathBuf,
        stderr: String,
    },

    #[error("{}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{unit}: {found} rpms found, expected exactly one")]
    ArtifactCount { unit: String, found: usize },

    #[error("unrecognized livepatch rpm name: {0}")]
    UnrecognizedLivepatch(String),

    #[error("task aborted: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KlpError {
    /// Attach the offending path to an I/O error.
    pub fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KlpError::Path {
            path: path.into(),
            source,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, KlpError>;

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| KlpError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compile `pattern` into `cell` on first use.
pub(crate) fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = compile(pattern)?;
    Ok(cell.get_or_init(|| re))
}
