use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::operators::{OperatorCategory, OperatorKind};
use crate::syntax::ParseError;

/// Invalid configuration, detected before anything is mutated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("path {0:?} does not exist")]
    MissingPath(PathBuf),

    #[error("{0:?} is not a Python source file (expected a `.py` extension)")]
    NotPython(PathBuf),

    #[error("unknown {category} operator {name:?}")]
    UnknownOperator {
        category: OperatorCategory,
        name: String,
    },

    #[error("operator {kind} does not belong to the {category} category")]
    WrongCategory {
        category: OperatorCategory,
        kind: OperatorKind,
    },

    #[error("failed to load config file {path:?}: {message}")]
    File { path: PathBuf, message: String },

    #[error("{0}")]
    Invalid(String),
}

/// A covered file could not be turned into a syntax tree.
#[derive(Debug, Error)]
#[error("failed to parse {file:?}: {source}")]
pub struct AnalyzeError {
    pub file: PathBuf,
    #[source]
    pub source: ParseError,
}

/// Failure to launch the test runner or to read what it produced.
#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error("failed to launch test runner `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("test runner exceeded the timeout of {0:?} and was killed")]
    Timeout(Duration),

    #[error("test runner did not write a report to {0:?}")]
    MissingReport(PathBuf),

    #[error("test report {path:?} is not valid: {source}")]
    CorruptReport {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("test runner I/O error: {0}")]
    Io(#[from] std::io::Error),
}
