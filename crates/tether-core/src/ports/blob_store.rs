//! BlobStore port - content-addressable blob service
//!
//! Upload is client-streaming: open a stream, send frames, half-close and
//! receive exactly one content id. Download is server-streaming: frames
//! arrive in order for one content id. Streams are closed when dropped, so
//! an early return on any path releases them.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{ContentId, TransferError};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn open_upload(&self) -> Result<Box<dyn UploadStream>, TransferError>;

    async fn open_download(&self, id: &ContentId)
    -> Result<Box<dyn DownloadStream>, TransferError>;
}

/// Send side of an upload.
#[async_trait]
pub trait UploadStream: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError>;

    /// Half-close and wait for the content id.
    async fn close_and_recv(self: Box<Self>) -> Result<ContentId, TransferError>;
}

/// Receive side of a download.
#[async_trait]
pub trait DownloadStream: Send {
    /// Next frame, or `None` once the server has sent everything.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransferError>;
}
