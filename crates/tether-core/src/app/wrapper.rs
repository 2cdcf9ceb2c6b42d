//! Wrapper - 1 回の起動を最後まで進める
//!
//! # Envelope mode (`Wrapper`)
//! 1. 宣言された input を blob service から download
//! 2. コマンドを実行（stdout / stderr をバッファ）
//! 3. stdout / stderr / 宣言された output を upload
//! 4. exit code を分類し envelope を組み立てる
//! 5. job id があれば提出し、envelope を 1 行の JSON で出力
//!
//! # Transparent mode (`TransparentRunner`)
//! stdout はそのまま、stderr はバッファしてから転送し、分類結果の exit code を返す。

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::builder::{EnvelopeBuilder, UploadedOutputs, dump_debug_outputs, upload_outputs};
use super::exec::{Captured, StdoutMode, run_command};
use super::reporter::ResultReporter;
use crate::config::WrapperConfig;
use crate::domain::{
    Classification, ExitClassifier, InvocationId, OutputDescriptor, ResultEnvelope,
    TransferError, WrapperError,
};
use crate::ports::{BlobStore, Clock, SystemClock};
use crate::transfer::ChunkedTransfer;

/// What one envelope-mode invocation produced.
#[derive(Debug, Clone)]
pub struct Execution {
    pub envelope: ResultEnvelope,
    pub classification: Classification,
    /// Code the wrapper itself should exit with.
    pub exit_code: i32,
}

pub struct Wrapper {
    config: WrapperConfig,
    transfer: ChunkedTransfer,
    reporter: ResultReporter,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Wrapper {
    pub fn new(
        config: WrapperConfig,
        store: Arc<dyn BlobStore>,
        reporter: ResultReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transfer: ChunkedTransfer::new(store, cancel.clone()),
            reporter,
            clock: Arc::new(SystemClock),
            cancel,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the whole pipeline, then report and emit the envelope on `out`.
    /// Returns the classified exit code.
    pub async fn run(
        &self,
        out: &mut (dyn Write + Send),
        console: &mut (dyn Write + Send),
    ) -> Result<i32, WrapperError> {
        let execution = self.execute(console).await?;
        self.reporter.report(&execution.envelope).await?;
        self.reporter.emit(&execution.envelope, out)?;
        Ok(execution.exit_code)
    }

    /// Download inputs, run the command, upload outputs and build the
    /// envelope. Debug output goes to `console` when uploads fail.
    pub async fn execute(
        &self,
        console: &mut (dyn Write + Send),
    ) -> Result<Execution, WrapperError> {
        let invocation = InvocationId::generate();
        info!("[wrapper] {} starting {}", invocation, self.config.program);

        // timing covers input staging as well as the command itself
        let mut builder = EnvelopeBuilder::start(self.clock.now());
        let started = Instant::now();

        self.download_inputs().await?;

        let captured = run_command(
            &self.config.program,
            &self.config.args,
            StdoutMode::Capture,
            &self.cancel,
        )
        .await?;
        if captured.cancelled {
            return Err(WrapperError::Cancelled);
        }
        builder.record_outcome(&captured.outcome, started.elapsed());

        let mut descriptors = vec![
            OutputDescriptor::stdout(captured.stdout.clone()),
            OutputDescriptor::stderr(captured.stderr.clone()),
        ];
        if captured.outcome.started() {
            descriptors.extend(self.config.outputs.iter().cloned().map(OutputDescriptor::from));
        }

        let uploaded = self.upload(console, &descriptors, &captured).await?;
        builder.record_outputs(uploaded);

        let classifier = self.config.policy.classifier();
        let (classification, exit_code) =
            classifier.classify_code(&captured.outcome, &captured.stderr);
        info!(
            "[wrapper] {} finished: {:?}, exiting with {}",
            invocation, classification, exit_code
        );

        Ok(Execution {
            envelope: builder.build()?,
            classification,
            exit_code,
        })
    }

    async fn download_inputs(&self) -> Result<(), WrapperError> {
        for input in &self.config.inputs {
            match self.transfer.download(&input.content_id, &input.path).await {
                Ok(written) => info!(
                    "[wrapper] fetched {} ({} bytes) into {}",
                    input.content_id,
                    written,
                    input.path.display()
                ),
                Err(TransferError::Cancelled) => return Err(WrapperError::Cancelled),
                Err(source) => {
                    return Err(WrapperError::Transfer {
                        name: input.path.display().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        console: &mut (dyn Write + Send),
        descriptors: &[OutputDescriptor],
        captured: &Captured,
    ) -> Result<UploadedOutputs, WrapperError> {
        match upload_outputs(&self.transfer, descriptors, &captured.outcome, &self.config.policy)
            .await
        {
            Ok(uploaded) => Ok(uploaded),
            Err(WrapperError::Cancelled) => Err(WrapperError::Cancelled),
            Err(e) => {
                if let Err(dump_err) = dump_debug_outputs(console, &captured.stderr, descriptors) {
                    warn!("[wrapper] could not dump outputs: {}", dump_err);
                }
                Err(e)
            }
        }
    }
}

/// Transparent mode: the wrapped tool owns stdout, stderr is forwarded
/// verbatim after exit (or after it was killed on cancellation), and only
/// the exit code is rewritten.
pub struct TransparentRunner {
    program: String,
    args: Vec<String>,
    classifier: ExitClassifier,
    cancel: CancellationToken,
}

impl TransparentRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        classifier: ExitClassifier,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            classifier,
            cancel,
        }
    }

    pub async fn run(
        &self,
        stderr_out: &mut (dyn Write + Send),
    ) -> Result<(Classification, i32), WrapperError> {
        let captured =
            run_command(&self.program, &self.args, StdoutMode::Inherit, &self.cancel).await?;

        stderr_out
            .write_all(&captured.stderr)
            .and_then(|_| stderr_out.flush())
            .map_err(WrapperError::Forward)?;

        if captured.cancelled {
            warn!("[wrapper] {} was interrupted", self.program);
            return Err(WrapperError::Cancelled);
        }

        if let Some(error) = captured.outcome.exec_error() {
            warn!("[wrapper] could not execute {}: {}", self.program, error);
        }

        let (classification, code) = self
            .classifier
            .classify_code(&captured.outcome, &captured.stderr);
        if classification == Classification::RetryableFailure {
            info!(
                "[wrapper] retryable failure of {} (exit {}), exiting with {}",
                self.program,
                captured.outcome.exit_code(),
                code
            );
        }
        Ok((classification, code))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ExitCodePolicy;
    use crate::domain::{
        DEFAULT_RETRYABLE_EXIT_CODE, DeclaredOutput, INTERNAL_ERROR_EXIT_CODE, InputDescriptor,
        JobId, OutputSource, PatternPreset, PatternSet,
    };
    use crate::impls::{InMemoryBlobStore, InMemoryJobTracker};
    use crate::ports::{DownloadStream, FixedClock, UploadStream};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::time::Duration;

    fn sh(script: &str) -> WrapperConfig {
        WrapperConfig::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn wrapper(config: WrapperConfig, store: &Arc<InMemoryBlobStore>) -> Wrapper {
        Wrapper::new(
            config,
            store.clone(),
            ResultReporter::local(),
            CancellationToken::new(),
        )
    }

    async fn seed(store: &Arc<InMemoryBlobStore>, content: &'static [u8]) -> crate::domain::ContentId {
        ChunkedTransfer::new(store.clone(), CancellationToken::new())
            .upload(&OutputSource::InMemory(Bytes::from_static(content)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn inputs_flow_through_to_declared_outputs() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in/plan.tfplan");
        let output = dir.path().join("out.txt");
        let input_id = seed(&store, b"plan-bytes").await;

        let mut config = sh(&format!(
            "cat {} > {}; printf hello; printf warn >&2",
            input.display(),
            output.display()
        ));
        config.inputs.push(InputDescriptor {
            path: input.clone(),
            content_id: input_id,
        });
        config.outputs.push(DeclaredOutput {
            name: "result".to_string(),
            path: output.clone(),
        });

        let start = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let tracker = Arc::new(InMemoryJobTracker::new());
        let w = Wrapper::new(
            config,
            store.clone(),
            ResultReporter::new(Some(tracker.clone()), Some(JobId::new("job-9"))),
            CancellationToken::new(),
        )
        .with_clock(Arc::new(FixedClock::new(start)));

        let mut out: Vec<u8> = Vec::new();
        let mut console: Vec<u8> = Vec::new();
        let code = w.run(&mut out, &mut console).await.unwrap();
        assert_eq!(code, 0);

        let line = String::from_utf8(out).unwrap();
        let envelope: ResultEnvelope = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(envelope.exit_code, 0);
        assert_eq!(envelope.start_ts_ns, start.timestamp_nanos_opt().unwrap());
        let stdout_id = envelope.stdout_blob_id.clone();
        let stderr_id = envelope.stderr_blob_id.clone();
        assert_eq!(store.get(&stdout_id).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.get(&stderr_id).unwrap(), Bytes::from_static(b"warn"));
        assert_eq!(envelope.files.len(), 1);
        assert_eq!(envelope.files[0].name, "result");
        assert_eq!(
            store.get(&envelope.files[0].content_blob_id).unwrap(),
            Bytes::from_static(b"plan-bytes")
        );

        let subs = tracker.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].1, envelope);
        assert!(console.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_keeps_raw_code_in_envelope() {
        let store = Arc::new(InMemoryBlobStore::new());
        let mut config = sh("echo 'Error acquiring the state lock' >&2; exit 1");
        config.policy = ExitCodePolicy {
            retryable_patterns: PatternPreset::TerraformApply
                .patterns()
                .iter()
                .map(|p| p.to_string())
                .collect(),
            ..ExitCodePolicy::default()
        };

        let execution = wrapper(config, &store)
            .execute(&mut Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(execution.classification, Classification::RetryableFailure);
        assert_eq!(execution.exit_code, DEFAULT_RETRYABLE_EXIT_CODE);
        assert_eq!(execution.envelope.exit_code, 1);
    }

    #[tokio::test]
    async fn fatal_failure_passes_code_through() {
        let store = Arc::new(InMemoryBlobStore::new());
        let execution = wrapper(sh("exit 7"), &store)
            .execute(&mut Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(execution.classification, Classification::FatalFailure { code: 7 });
        assert_eq!(execution.exit_code, 7);
    }

    #[tokio::test]
    async fn never_started_still_produces_an_envelope() {
        let store = Arc::new(InMemoryBlobStore::new());
        let mut config = WrapperConfig::new("/definitely/not/a/binary", Vec::new());
        config.outputs.push(DeclaredOutput {
            name: "plan".to_string(),
            path: "/definitely/not/here".into(),
        });

        let mut out: Vec<u8> = Vec::new();
        let code = wrapper(config, &store)
            .run(&mut out, &mut Vec::<u8>::new())
            .await
            .unwrap();
        assert_eq!(code, INTERNAL_ERROR_EXIT_CODE);

        let envelope: ResultEnvelope =
            serde_json::from_str(String::from_utf8(out).unwrap().trim_end()).unwrap();
        assert_eq!(envelope.exit_code, -1);
        assert!(envelope.exec_error.is_some());
        assert!(envelope.files.is_empty());
    }

    #[tokio::test]
    async fn missing_output_after_failure_dumps_and_fails() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh("printf partial; echo 'boom' >&2; exit 3");
        config.outputs.push(DeclaredOutput {
            name: "plan".to_string(),
            path: dir.path().join("plan.json"),
        });

        let mut out: Vec<u8> = Vec::new();
        let mut console: Vec<u8> = Vec::new();
        let err = wrapper(config, &store)
            .run(&mut out, &mut console)
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::MissingOutput { .. }));
        assert_eq!(err.exit_code(), INTERNAL_ERROR_EXIT_CODE);
        assert!(out.is_empty());

        let dump = String::from_utf8(console).unwrap();
        assert!(dump.find("boom").unwrap() < dump.find("partial").unwrap());
    }

    #[tokio::test]
    async fn missing_output_after_success_is_skipped() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh("true");
        config.outputs.push(DeclaredOutput {
            name: "plan".to_string(),
            path: dir.path().join("plan.json"),
        });

        let execution = wrapper(config, &store)
            .execute(&mut Vec::<u8>::new())
            .await
            .unwrap();
        assert!(execution.envelope.files.is_empty());
        assert_eq!(execution.exit_code, 0);
    }

    #[tokio::test]
    async fn rejected_report_is_fatal_and_emits_nothing() {
        let store = Arc::new(InMemoryBlobStore::new());
        let w = Wrapper::new(
            sh("true"),
            store.clone(),
            ResultReporter::new(
                Some(Arc::new(InMemoryJobTracker::failing("gone"))),
                Some(JobId::new("job-1")),
            ),
            CancellationToken::new(),
        );
        let mut out: Vec<u8> = Vec::new();
        let err = w.run(&mut out, &mut Vec::<u8>::new()).await.unwrap_err();
        assert!(matches!(err, WrapperError::Reporting { .. }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unknown_input_blob_fails_before_running() {
        let store = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut config = sh(&format!("touch {}", marker.display()));
        config.inputs.push(InputDescriptor {
            path: dir.path().join("in"),
            content_id: crate::domain::ContentId::new("sha256:missing"),
        });

        let err = wrapper(config, &store)
            .execute(&mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::Transfer { .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn transparent_mode_forwards_stderr_and_rewrites_code() {
        let classifier = ExitClassifier::new(
            PatternSet::new().with_preset(PatternPreset::PulumiUp),
            DEFAULT_RETRYABLE_EXIT_CODE,
        );
        let runner = TransparentRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'error: the stack is currently locked by 1 lock(s)' >&2; exit 255".to_string(),
            ],
            classifier,
            CancellationToken::new(),
        );

        let mut stderr: Vec<u8> = Vec::new();
        let (classification, code) = runner.run(&mut stderr).await.unwrap();
        assert_eq!(classification, Classification::RetryableFailure);
        assert_eq!(code, DEFAULT_RETRYABLE_EXIT_CODE);
        assert_eq!(
            String::from_utf8(stderr).unwrap(),
            "error: the stack is currently locked by 1 lock(s)\n"
        );
    }

    #[tokio::test]
    async fn transparent_mode_reports_launch_failure() {
        let runner = TransparentRunner::new(
            "/definitely/not/a/binary",
            Vec::new(),
            ExitClassifier::default(),
            CancellationToken::new(),
        );
        let mut stderr: Vec<u8> = Vec::new();
        let (classification, code) = runner.run(&mut stderr).await.unwrap();
        assert_eq!(classification, Classification::InternalError);
        assert_eq!(code, INTERNAL_ERROR_EXIT_CODE);
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn transparent_mode_forwards_stderr_when_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let runner = TransparentRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'Error acquiring the state lock' >&2; sleep 30".to_string(),
            ],
            ExitClassifier::default(),
            cancel,
        );

        let mut stderr: Vec<u8> = Vec::new();
        let res = tokio::time::timeout(Duration::from_secs(10), runner.run(&mut stderr))
            .await
            .expect("cancellation should end the run");
        assert!(matches!(res, Err(WrapperError::Cancelled)));
        assert_eq!(
            String::from_utf8(stderr).unwrap(),
            "Error acquiring the state lock\n"
        );
    }

    /// Delegates to an in-memory store but stalls before every download.
    struct SlowDownloads {
        inner: Arc<InMemoryBlobStore>,
        delay: Duration,
    }

    #[async_trait]
    impl BlobStore for SlowDownloads {
        async fn open_upload(&self) -> Result<Box<dyn UploadStream>, TransferError> {
            self.inner.open_upload().await
        }

        async fn open_download(
            &self,
            id: &crate::domain::ContentId,
        ) -> Result<Box<dyn DownloadStream>, TransferError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open_download(id).await
        }
    }

    #[tokio::test]
    async fn envelope_timing_includes_input_staging() {
        let inner = Arc::new(InMemoryBlobStore::new());
        let dir = tempfile::tempdir().unwrap();
        let input_id = seed(&inner, b"state").await;
        let mut config = sh("true");
        config.inputs.push(InputDescriptor {
            path: dir.path().join("state.json"),
            content_id: input_id,
        });

        let store = Arc::new(SlowDownloads {
            inner,
            delay: Duration::from_millis(200),
        });
        let w = Wrapper::new(config, store, ResultReporter::local(), CancellationToken::new());
        let execution = w.execute(&mut Vec::<u8>::new()).await.unwrap();
        assert!(execution.envelope.duration_ns >= 200_000_000);
    }
}
