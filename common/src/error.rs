use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Config key not found: {0}")]
    KeyNotFound(String),
    #[error("Config resolution cycle: {0}")]
    ResolutionCycle(String),
    #[error("Config key {key} expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unable to parse output:\n```\n{output}\n```\nwith '{pattern}'")]
    Unparseable { output: String, pattern: String },
    #[error(
        "Failed to parse output:\n```\n{output}\n```\nwith '{pattern}'.  Captured: '{captured}'"
    )]
    NonNumeric {
        output: String,
        pattern: String,
        captured: String,
    },
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Empty argument list")]
    EmptyCommand,
    #[error("Could not spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not exit within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}
