//! EnvelopeBuilder - assembles the ResultEnvelope as the invocation progresses
//!
//! # 流れ
//! 1. `EnvelopeBuilder::start()` で起動時刻を記録（exit code は未設定）
//! 2. `record_outcome()` で exit code / exec error / duration を設定
//! 3. `upload_outputs()` の結果を `record_outputs()` で反映
//! 4. `build()` で確定（exit code 未設定ならエラー）

use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::ExitCodePolicy;
use crate::domain::{
    ContentId, FileRef, OutputDescriptor, OutputSource, ProcessOutcome, ResultEnvelope,
    TransferError, WrapperError,
};
use crate::transfer::ChunkedTransfer;

/// Wrapper version recorded in every envelope.
pub const WRAPPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Content ids of everything that reached the blob service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadedOutputs {
    pub stdout: Option<ContentId>,
    pub stderr: Option<ContentId>,
    /// Named outputs only, in declaration order.
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    start: DateTime<Utc>,
    hostname: String,
    exit_code: Option<i32>,
    exec_error: Option<String>,
    duration: Duration,
    outputs: UploadedOutputs,
}

impl EnvelopeBuilder {
    pub fn start(start: DateTime<Utc>) -> Self {
        Self {
            start,
            hostname: local_hostname(),
            exit_code: None,
            exec_error: None,
            duration: Duration::ZERO,
            outputs: UploadedOutputs::default(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn record_outcome(&mut self, outcome: &ProcessOutcome, duration: Duration) -> &mut Self {
        self.exit_code = Some(outcome.exit_code());
        self.exec_error = outcome.exec_error().map(str::to_string);
        self.duration = duration;
        self
    }

    pub fn record_outputs(&mut self, outputs: UploadedOutputs) -> &mut Self {
        self.outputs = outputs;
        self
    }

    pub fn build(self) -> Result<ResultEnvelope, WrapperError> {
        let missing = |what: &str| WrapperError::Serialization(format!("{what} was never recorded"));
        let exit_code = self.exit_code.ok_or_else(|| missing("exit code"))?;
        let stdout_blob_id = self.outputs.stdout.ok_or_else(|| missing("stdout blob id"))?;
        let stderr_blob_id = self.outputs.stderr.ok_or_else(|| missing("stderr blob id"))?;
        Ok(ResultEnvelope {
            exit_code,
            exec_error: self.exec_error,
            version: WRAPPER_VERSION.to_string(),
            start_ts_ns: self.start.timestamp_nanos_opt().unwrap_or_default(),
            duration_ns: i64::try_from(self.duration.as_nanos()).unwrap_or(i64::MAX),
            hostname: self.hostname,
            stdout_blob_id,
            stderr_blob_id,
            files: self.outputs.files,
        })
    }
}

/// One-shot form of the builder.
pub fn build_envelope(
    start: DateTime<Utc>,
    duration: Duration,
    outcome: &ProcessOutcome,
    outputs: UploadedOutputs,
) -> Result<ResultEnvelope, WrapperError> {
    let mut builder = EnvelopeBuilder::start(start);
    builder.record_outcome(outcome, duration).record_outputs(outputs);
    builder.build()
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Upload every descriptor in order.
///
/// A missing declared file is skipped when the process exited with a code in
/// the success set, and fatal otherwise. Every descriptor is attempted even
/// after a failure; all failures are returned together.
pub async fn upload_outputs(
    transfer: &ChunkedTransfer,
    descriptors: &[OutputDescriptor],
    outcome: &ProcessOutcome,
    policy: &ExitCodePolicy,
) -> Result<UploadedOutputs, WrapperError> {
    validate_descriptors(descriptors)?;

    let tolerate_missing = outcome.started() && policy.is_success(outcome.exit_code());
    let mut uploaded = UploadedOutputs::default();
    let mut failures = Vec::new();

    for desc in descriptors {
        match transfer.upload(&desc.source).await {
            Ok(id) => {
                if desc.is_stdout {
                    uploaded.stdout = Some(id);
                } else if desc.is_stderr {
                    uploaded.stderr = Some(id);
                } else {
                    uploaded.files.push(FileRef {
                        name: desc.name.clone(),
                        content_blob_id: id,
                    });
                }
            }
            Err(TransferError::Cancelled) => return Err(WrapperError::Cancelled),
            Err(TransferError::MissingSource(path)) if tolerate_missing => {
                info!("[upload] output `{}` not produced at {}, skipping", desc.name, path.display());
            }
            Err(TransferError::MissingSource(path)) => {
                warn!("[upload] output `{}` missing at {} after failed run", desc.name, path.display());
                failures.push(WrapperError::MissingOutput {
                    name: desc.name.clone(),
                    path,
                });
            }
            Err(source) => {
                warn!("[upload] output `{}` failed: {}", desc.name, source);
                failures.push(WrapperError::Transfer {
                    name: desc.name.clone(),
                    source,
                });
            }
        }
    }

    match failures.len() {
        0 => Ok(uploaded),
        1 => Err(failures.remove(0)),
        _ => Err(WrapperError::Uploads(failures)),
    }
}

fn validate_descriptors(descriptors: &[OutputDescriptor]) -> Result<(), WrapperError> {
    let stdout = descriptors.iter().filter(|d| d.is_stdout).count();
    let stderr = descriptors.iter().filter(|d| d.is_stderr).count();
    if stdout > 1 || stderr > 1 {
        return Err(WrapperError::Config(format!(
            "at most one stdout and one stderr output allowed (got {stdout} and {stderr})"
        )));
    }
    if let Some(d) = descriptors.iter().find(|d| d.is_stdout && d.is_stderr) {
        return Err(WrapperError::Config(format!(
            "output `{}` cannot be both stdout and stderr",
            d.name
        )));
    }
    Ok(())
}

/// Dump everything an operator needs after a fatal upload failure: the
/// subprocess stderr first, then each declared output in order.
pub fn dump_debug_outputs(
    console: &mut dyn Write,
    stderr: &[u8],
    descriptors: &[OutputDescriptor],
) -> std::io::Result<()> {
    writeln!(console, "==== stderr ====")?;
    console.write_all(stderr)?;
    writeln!(console)?;

    for desc in descriptors.iter().filter(|d| !d.is_stderr) {
        writeln!(console, "==== {} ====", desc.name)?;
        match &desc.source {
            OutputSource::InMemory(content) => console.write_all(content)?,
            OutputSource::Path(path) => match std::fs::File::open(path) {
                Ok(mut file) => {
                    std::io::copy(&mut file, console)?;
                }
                Err(e) => writeln!(console, "<unreadable {}: {}>", path.display(), e)?,
            },
        }
        writeln!(console)?;
    }
    console.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBlobStore;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn transfer(store: &Arc<InMemoryBlobStore>) -> ChunkedTransfer {
        ChunkedTransfer::new(store.clone(), CancellationToken::new())
    }

    fn stdio_only() -> UploadedOutputs {
        UploadedOutputs {
            stdout: Some(ContentId::new("sha256:01")),
            stderr: Some(ContentId::new("sha256:02")),
            files: Vec::new(),
        }
    }

    #[test]
    fn build_requires_exit_code() {
        let mut builder = EnvelopeBuilder::start(Utc::now());
        builder.record_outputs(stdio_only());
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_requires_stdio_refs() {
        let mut builder = EnvelopeBuilder::start(Utc::now());
        builder.record_outcome(&ProcessOutcome::exited(0), Duration::ZERO);
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("stdout blob id"));
    }

    #[test]
    fn envelope_carries_timing_and_identity() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut builder = EnvelopeBuilder::start(start).with_hostname("runner-3");
        builder
            .record_outcome(&ProcessOutcome::exited(0), Duration::from_millis(1500))
            .record_outputs(stdio_only());
        let env = builder.build().unwrap();
        assert_eq!(env.stdout_blob_id, ContentId::new("sha256:01"));
        assert_eq!(env.stderr_blob_id, ContentId::new("sha256:02"));
        assert_eq!(env.start_ts_ns, start.timestamp_nanos_opt().unwrap());
        assert_eq!(env.duration_ns, 1_500_000_000);
        assert_eq!(env.hostname, "runner-3");
        assert_eq!(env.version, WRAPPER_VERSION);
        assert!(env.duration_ns >= 0);
    }

    #[test]
    fn never_started_is_recorded() {
        let env = build_envelope(
            Utc::now(),
            Duration::ZERO,
            &ProcessOutcome::never_started("exec: not found"),
            stdio_only(),
        )
        .unwrap();
        assert_eq!(env.exit_code, -1);
        assert_eq!(env.exec_error.as_deref(), Some("exec: not found"));
    }

    #[tokio::test]
    async fn stdio_is_referenced_separately_from_files() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plan.json");
        std::fs::write(&plan, b"{}").unwrap();

        let descriptors = vec![
            OutputDescriptor::stdout("out"),
            OutputDescriptor::stderr("err"),
            OutputDescriptor::file("plan", &plan),
        ];
        let uploaded = upload_outputs(
            &transfer(&store),
            &descriptors,
            &ProcessOutcome::exited(0),
            &ExitCodePolicy::default(),
        )
        .await
        .unwrap();

        assert!(uploaded.stdout.is_some());
        assert!(uploaded.stderr.is_some());
        assert_eq!(uploaded.files.len(), 1);
        assert_eq!(uploaded.files[0].name, "plan");
        assert_eq!(
            store.get(&uploaded.files[0].content_blob_id).unwrap(),
            bytes::Bytes::from_static(b"{}")
        );
    }

    #[tokio::test]
    async fn missing_output_is_skipped_after_success() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, b"here").unwrap();
        let descriptors = vec![
            OutputDescriptor::file("absent", dir.path().join("absent.txt")),
            OutputDescriptor::file("present", &present),
        ];

        let uploaded = upload_outputs(
            &transfer(&store),
            &descriptors,
            &ProcessOutcome::exited(0),
            &ExitCodePolicy::default(),
        )
        .await
        .unwrap();
        let names: Vec<_> = uploaded.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["present"]);
    }

    #[tokio::test]
    async fn missing_output_is_fatal_after_failure() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, b"here").unwrap();
        let descriptors = vec![
            OutputDescriptor::file("absent", dir.path().join("absent.txt")),
            OutputDescriptor::file("present", &present),
        ];

        let err = upload_outputs(
            &transfer(&store),
            &descriptors,
            &ProcessOutcome::exited(1),
            &ExitCodePolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WrapperError::MissingOutput { ref name, .. } if name == "absent"));
        // the later output was still attempted
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn custom_success_set_tolerates_missing_output() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let policy = ExitCodePolicy {
            success_exit_codes: vec![0, 2],
            ..ExitCodePolicy::default()
        };
        let uploaded = upload_outputs(
            &transfer(&store),
            &[OutputDescriptor::file("plan", dir.path().join("plan"))],
            &ProcessOutcome::exited(2),
            &policy,
        )
        .await
        .unwrap();
        assert!(uploaded.files.is_empty());
    }

    #[tokio::test]
    async fn every_failure_is_reported() {
        let store = Arc::new(InMemoryBlobStore::rejecting_uploads());
        let descriptors = vec![OutputDescriptor::stdout("a"), OutputDescriptor::stderr("b")];
        let err = upload_outputs(
            &transfer(&store),
            &descriptors,
            &ProcessOutcome::exited(0),
            &ExitCodePolicy::default(),
        )
        .await
        .unwrap_err();
        match err {
            WrapperError::Uploads(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn duplicate_stdout_is_rejected() {
        let store = Arc::new(InMemoryBlobStore::new());
        let descriptors = vec![OutputDescriptor::stdout("a"), OutputDescriptor::stdout("b")];
        let err = upload_outputs(
            &transfer(&store),
            &descriptors,
            &ProcessOutcome::exited(0),
            &ExitCodePolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WrapperError::Config(_)));
    }

    #[test]
    fn dump_writes_stderr_before_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, b"FIRST").unwrap();
        std::fs::write(&second, b"SECOND").unwrap();
        let descriptors = vec![
            OutputDescriptor::stdout("STDOUT"),
            OutputDescriptor::stderr("ignored, passed separately"),
            OutputDescriptor::file("first", &first),
            OutputDescriptor::file("second", &second),
        ];

        let mut console: Vec<u8> = Vec::new();
        dump_debug_outputs(&mut console, b"STDERR", &descriptors).unwrap();
        let text = String::from_utf8(console).unwrap();

        let pos = |needle: &str| text.find(needle).unwrap();
        assert!(pos("STDERR") < pos("STDOUT"));
        assert!(pos("STDOUT") < pos("FIRST"));
        assert!(pos("FIRST") < pos("SECOND"));
        assert!(!text.contains("ignored"));
    }
}
