use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid package graph: {reason}")]
    Planning { reason: String },

    #[error("Dependency {name} of {package} is missing and not marked optional")]
    MissingDependency { package: String, name: String },

    #[error("Compilation failed for target {target} (exit code {code})")]
    CompileFailed { target: String, code: i32 },

    #[error("Linking failed for target {target} (exit code {code})")]
    LinkFailed { target: String, code: i32 },

    #[error("Build command failed (exit code {code}): {command}")]
    BuildCommandFailed { command: String, code: i32 },

    #[error("Program {program} exited with code {code}")]
    RunFailed { program: String, code: i32 },

    #[error("Unknown compiler id: {id}")]
    UnknownCompiler { id: String },

    #[error("Generator {name} is not available in this build")]
    UnknownGenerator { name: String },

    #[error("File watch setup failed for {path}: {reason}")]
    Watcher { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn planning(reason: impl Into<String>) -> Self {
        BuildError::Planning {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
