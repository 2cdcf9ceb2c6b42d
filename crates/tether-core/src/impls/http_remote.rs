//! HTTP client for the remote service: blob streaming and job results.
//!
//! ```text
//! POST {endpoint}/v1/blobs              streamed body, one frame per chunk -> {"id": "..."}
//! GET  {endpoint}/v1/blobs/{id}         streamed body, one frame per chunk
//! POST {endpoint}/v1/jobs/{id}/result   ResultEnvelope JSON
//! ```
//!
//! `RemoteClient` is built once per invocation and shared by the blob store
//! and the job tracker. The underlying connection pool is created on first
//! use, so invocations that never talk to the service never open it.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::domain::{ContentId, JobId, ResultEnvelope, TransferError};
use crate::ports::{BlobStore, DownloadStream, JobTracker, UploadStream};

pub struct RemoteClient {
    config: RemoteConfig,
    http: OnceCell<reqwest::Client>,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            http: OnceCell::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn http(&self) -> Result<&reqwest::Client, String> {
        self.http
            .get_or_try_init(|| async {
                debug!("[remote] connecting to {}", self.config.endpoint);
                reqwest::Client::builder()
                    .connect_timeout(self.config.connect_timeout())
                    .build()
                    .map_err(|e| format!("failed to build http client: {e}"))
            })
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

pub struct HttpBlobStore {
    client: Arc<RemoteClient>,
}

impl HttpBlobStore {
    pub fn new(client: Arc<RemoteClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn open_upload(&self) -> Result<Box<dyn UploadStream>, TransferError> {
        let http = self.client.http().await.map_err(TransferError::Remote)?.clone();
        let url = self.client.url("/v1/blobs");

        // capacity 1: at most one frame waits while another is on the wire
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|frame| (Ok::<Bytes, std::io::Error>(frame), rx))
        });

        let response = tokio::spawn(async move {
            let resp = http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(reqwest::Body::wrap_stream(frames))
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| TransferError::remote(e.to_string()))?;
            let body: UploadResponse = resp
                .json()
                .await
                .map_err(|e| TransferError::remote(format!("bad upload response: {e}")))?;
            Ok::<ContentId, TransferError>(ContentId::new(body.id))
        });

        Ok(Box::new(HttpUpload {
            tx: Some(tx),
            response: Some(response),
        }))
    }

    async fn open_download(
        &self,
        id: &ContentId,
    ) -> Result<Box<dyn DownloadStream>, TransferError> {
        let http = self.client.http().await.map_err(TransferError::Remote)?;
        let resp = http
            .get(self.client.url(&format!("/v1/blobs/{id}")))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransferError::remote(e.to_string()))?;
        Ok(Box::new(HttpDownload {
            body: Box::pin(resp.bytes_stream()),
        }))
    }
}

type UploadResult = Result<ContentId, TransferError>;

struct HttpUpload {
    tx: Option<mpsc::Sender<Bytes>>,
    response: Option<JoinHandle<UploadResult>>,
}

impl HttpUpload {
    async fn finish(&mut self) -> UploadResult {
        self.tx.take();
        match self.response.take() {
            Some(handle) => handle
                .await
                .map_err(|e| TransferError::remote(format!("upload task failed: {e}")))?,
            None => Err(TransferError::remote("upload already finished")),
        }
    }
}

#[async_trait]
impl UploadStream for HttpUpload {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransferError::remote("upload stream already closed"));
        };
        if tx.send(frame).await.is_err() {
            // the request ended early; its result says why
            return match self.finish().await {
                Err(e) => Err(e),
                Ok(_) => Err(TransferError::remote("server closed the upload early")),
            };
        }
        Ok(())
    }

    async fn close_and_recv(mut self: Box<Self>) -> Result<ContentId, TransferError> {
        self.finish().await
    }
}

impl Drop for HttpUpload {
    fn drop(&mut self) {
        // an abandoned upload must not complete as a truncated blob
        if let Some(handle) = self.response.take() {
            handle.abort();
        }
    }
}

struct HttpDownload {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
}

#[async_trait]
impl DownloadStream for HttpDownload {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransferError> {
        self.body
            .next()
            .await
            .transpose()
            .map_err(|e| TransferError::remote(e.to_string()))
    }
}

pub struct HttpJobTracker {
    client: Arc<RemoteClient>,
}

impl HttpJobTracker {
    pub fn new(client: Arc<RemoteClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobTracker for HttpJobTracker {
    async fn submit(&self, job_id: &JobId, envelope: &ResultEnvelope) -> Result<(), String> {
        let http = self.client.http().await?;
        http.post(self.client.url(&format!("/v1/jobs/{job_id}/result")))
            .json(envelope)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}
