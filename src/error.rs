//! Typed errors raised by the build engine.
//!
//! The orchestration layer (pipeline, phases, CLI) wraps these in
//! `anyhow::Error` with file/recipe context; the lower layers return them
//! directly so callers can match on the failure class.

use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A recipe key is unset or empty in the property store.
    #[error("{recipe} pattern is missing")]
    PatternMissing { recipe: String },

    /// A property file could not be parsed.
    #[error("error reading {path}:{line}: {reason}")]
    PropertyFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("unsupported host OS '{0}'")]
    UnsupportedOs(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A command line has a quoted span with no closing quote.
    #[error("invalid quoting, no closing `{quote}` char found")]
    InvalidQuoting { quote: char },

    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{recipe} failed ({status}){}", format_stderr(.stderr))]
    CommandFailed {
        recipe: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("build cancelled")]
    Cancelled,

    #[error("build timed out")]
    TimedOut,

    #[error("{section} section exceeds available space in board ({size} > {max} bytes)")]
    SizeExceeded {
        section: &'static str,
        size: u64,
        max: u64,
    },

    #[error("invalid value '{value}' for {key}")]
    InvalidSizeConfig { key: String, value: String },

    #[error("invalid regexp in {key}: {source}")]
    InvalidRegex { key: String, source: regex::Error },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the errors produced by a tripped cancel token rather than
    /// by the work itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BuildError::Cancelled | BuildError::TimedOut)
    }
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_missing_names_recipe() {
        let err = BuildError::PatternMissing {
            recipe: "recipe.cpp.o.pattern".to_string(),
        };
        assert_eq!(err.to_string(), "recipe.cpp.o.pattern pattern is missing");
    }

    #[test]
    fn test_io_error_names_path() {
        let err = BuildError::io(
            "/tmp/build/core.a",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/build/core.a"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_size_exceeded_display() {
        let err = BuildError::SizeExceeded {
            section: "text",
            size: 40000,
            max: 32256,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("text section exceeds available space"));
        assert!(msg.contains("40000 > 32256"));
    }

    #[test]
    fn test_cancellation_classes() {
        assert!(BuildError::Cancelled.is_cancellation());
        assert!(BuildError::TimedOut.is_cancellation());
        assert!(!BuildError::InvalidQuoting { quote: '"' }.is_cancellation());
    }
}
