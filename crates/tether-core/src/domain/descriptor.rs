//! Input/output declarations for a wrapped invocation.
//!
//! Inputs are declared as `local-path=content-id`, named outputs as
//! `name=local-path`. Stdio is modelled as in-memory output descriptors
//! flagged `is_stdout` / `is_stderr` so it goes through the same upload path.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

use super::ids::ContentId;

/// Malformed `a=b` declaration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("expected `{expected}`, got `{raw}`")]
    Malformed { raw: String, expected: &'static str },

    #[error("empty {field} in `{raw}`")]
    Empty { raw: String, field: &'static str },
}

/// A blob to download before the command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDescriptor {
    pub path: PathBuf,
    pub content_id: ContentId,
}

impl FromStr for InputDescriptor {
    type Err = MappingError;

    /// The content id never contains `=`, so split on the last one and let
    /// the path keep any of its own.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (path, id) = raw.rsplit_once('=').ok_or_else(|| MappingError::Malformed {
            raw: raw.to_string(),
            expected: "local-path=content-id",
        })?;
        if path.is_empty() {
            return Err(MappingError::Empty {
                raw: raw.to_string(),
                field: "path",
            });
        }
        if id.is_empty() {
            return Err(MappingError::Empty {
                raw: raw.to_string(),
                field: "content id",
            });
        }
        Ok(Self {
            path: PathBuf::from(path),
            content_id: ContentId::new(id),
        })
    }
}

/// A caller-declared named output file (`name=local-path`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredOutput {
    pub name: String,
    pub path: PathBuf,
}

impl FromStr for DeclaredOutput {
    type Err = MappingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (name, path) = raw.split_once('=').ok_or_else(|| MappingError::Malformed {
            raw: raw.to_string(),
            expected: "name=local-path",
        })?;
        if name.is_empty() {
            return Err(MappingError::Empty {
                raw: raw.to_string(),
                field: "name",
            });
        }
        if path.is_empty() {
            return Err(MappingError::Empty {
                raw: raw.to_string(),
                field: "path",
            });
        }
        Ok(Self {
            name: name.to_string(),
            path: PathBuf::from(path),
        })
    }
}

/// Where an output's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    Path(PathBuf),
    InMemory(Bytes),
}

/// One payload to upload after the command finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub name: String,
    pub source: OutputSource,
    pub is_stdout: bool,
    pub is_stderr: bool,
}

impl OutputDescriptor {
    pub fn stdout(content: impl Into<Bytes>) -> Self {
        Self {
            name: "stdout".to_string(),
            source: OutputSource::InMemory(content.into()),
            is_stdout: true,
            is_stderr: false,
        }
    }

    pub fn stderr(content: impl Into<Bytes>) -> Self {
        Self {
            name: "stderr".to_string(),
            source: OutputSource::InMemory(content.into()),
            is_stdout: false,
            is_stderr: true,
        }
    }

    pub fn file(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            source: OutputSource::Path(path.as_ref().to_path_buf()),
            is_stdout: false,
            is_stderr: false,
        }
    }

    pub fn is_stdio(&self) -> bool {
        self.is_stdout || self.is_stderr
    }
}

impl From<DeclaredOutput> for OutputDescriptor {
    fn from(decl: DeclaredOutput) -> Self {
        Self::file(decl.name, decl.path)
    }
}
