//! InMemoryBlobStore - 開発用・テスト用の content-addressable store
//!
//! Content ids are `sha256:<hex>` of the uploaded bytes, so identical
//! payloads map to the same id. Like the real service, an upload that is
//! closed without a single frame is rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::domain::{ContentId, TransferError};
use crate::ports::{BlobStore, DownloadStream, UploadStream};
use crate::transfer::CHUNK_SIZE;

#[derive(Default)]
struct State {
    blobs: HashMap<ContentId, Bytes>,
    /// Frame sizes of the most recent completed upload.
    last_upload_frames: Option<Vec<usize>>,
    reject_uploads: bool,
}

pub struct InMemoryBlobStore {
    state: Arc<Mutex<State>>,
    frame_size: usize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            frame_size: CHUNK_SIZE,
        }
    }

    /// A store whose uploads all fail with a remote error.
    pub fn rejecting_uploads() -> Self {
        let store = Self::new();
        store.lock().reject_uploads = true;
        store
    }

    /// Frame size used when serving downloads.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(1);
        self
    }

    pub fn get(&self, id: &ContentId) -> Option<Bytes> {
        self.lock().blobs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_upload_frames(&self) -> Option<Vec<usize>> {
        self.lock().last_upload_frames.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a poisoned lock only means a test thread panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn open_upload(&self) -> Result<Box<dyn UploadStream>, TransferError> {
        if self.lock().reject_uploads {
            return Err(TransferError::remote("upload rejected"));
        }
        Ok(Box::new(InMemoryUpload {
            state: Arc::clone(&self.state),
            hasher: Sha256::new(),
            data: BytesMut::new(),
            frames: Vec::new(),
        }))
    }

    async fn open_download(
        &self,
        id: &ContentId,
    ) -> Result<Box<dyn DownloadStream>, TransferError> {
        let blob = self
            .get(id)
            .ok_or_else(|| TransferError::remote(format!("blob {id} not found")))?;
        Ok(Box::new(InMemoryDownload {
            remaining: blob,
            frame_size: self.frame_size,
        }))
    }
}

struct InMemoryUpload {
    state: Arc<Mutex<State>>,
    hasher: Sha256,
    data: BytesMut,
    frames: Vec<usize>,
}

#[async_trait]
impl UploadStream for InMemoryUpload {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        self.hasher.update(&frame);
        self.data.extend_from_slice(&frame);
        self.frames.push(frame.len());
        Ok(())
    }

    async fn close_and_recv(self: Box<Self>) -> Result<ContentId, TransferError> {
        let this = *self;
        if this.frames.is_empty() {
            return Err(TransferError::remote("upload closed before any frame"));
        }
        let id = ContentId::new(format!("sha256:{:x}", this.hasher.finalize()));
        let mut state = this.state.lock().unwrap_or_else(|e| e.into_inner());
        state.blobs.insert(id.clone(), this.data.freeze());
        state.last_upload_frames = Some(this.frames);
        Ok(id)
    }
}

struct InMemoryDownload {
    remaining: Bytes,
    frame_size: usize,
}

#[async_trait]
impl DownloadStream for InMemoryDownload {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let n = self.frame_size.min(self.remaining.len());
        Ok(Some(self.remaining.split_to(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_content_gets_identical_id() {
        let store = InMemoryBlobStore::new();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut up = store.open_upload().await.unwrap();
            up.send(Bytes::from_static(b"hello")).await.unwrap();
            ids.push(up.close_and_recv().await.unwrap());
        }
        assert_eq!(ids[0], ids[1]);
        assert!(ids[0].as_str().starts_with("sha256:"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn upload_without_frames_is_rejected() {
        let store = InMemoryBlobStore::new();
        let up = store.open_upload().await.unwrap();
        assert!(up.close_and_recv().await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn download_serves_frames_in_order() {
        let store = InMemoryBlobStore::new().with_frame_size(2);
        let mut up = store.open_upload().await.unwrap();
        up.send(Bytes::from_static(b"abcde")).await.unwrap();
        let id = up.close_and_recv().await.unwrap();

        let mut down = store.open_download(&id).await.unwrap();
        let mut frames = Vec::new();
        while let Some(f) = down.next_frame().await.unwrap() {
            frames.push(f);
        }
        assert_eq!(frames, vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd"), Bytes::from_static(b"e")]);
    }

    #[tokio::test]
    async fn rejecting_store_fails_uploads() {
        let store = InMemoryBlobStore::rejecting_uploads();
        assert!(matches!(store.open_upload().await, Err(TransferError::Remote(_))));
    }
}
