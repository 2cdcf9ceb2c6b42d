//! ResultEnvelope - the structured outcome emitted at the boundary.

use serde::{Deserialize, Serialize};

use super::ids::ContentId;

/// A caller-declared output that made it to the blob service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub content_blob_id: ContentId,
}

/// Structured result of one wrapped invocation.
///
/// Built incrementally while the invocation runs and frozen once serialized.
/// `files` holds only named outputs; stdio is referenced by its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Exit code of the wrapped process. -1 if it never started.
    pub exit_code: i32,

    /// Internal error when trying to execute the wrapped process.
    pub exec_error: Option<String>,

    /// Wrapper version.
    pub version: String,

    pub start_ts_ns: i64,

    pub duration_ns: i64,

    pub hostname: String,

    /// Stdio is always uploaded, so both references are always present.
    pub stdout_blob_id: ContentId,

    pub stderr_blob_id: ContentId,

    #[serde(default)]
    pub files: Vec<FileRef>,
}
