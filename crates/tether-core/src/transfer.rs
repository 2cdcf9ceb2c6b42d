//! ChunkedTransfer - moves payloads to and from the blob service in fixed
//! size frames, so memory stays bounded by one window regardless of payload
//! size.

use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{ContentId, OutputSource, TransferError};
use crate::ports::BlobStore;

/// Frame size on the wire.
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ChunkedTransfer {
    store: Arc<dyn BlobStore>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl ChunkedTransfer {
    pub fn new(store: Arc<dyn BlobStore>, cancel: CancellationToken) -> Self {
        Self {
            store,
            chunk_size: CHUNK_SIZE,
            cancel,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Upload a file or an in-memory buffer and return its content id.
    pub async fn upload(&self, source: &OutputSource) -> Result<ContentId, TransferError> {
        match source {
            OutputSource::Path(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| TransferError::local(path, e))?;
                self.upload_reader(file, path).await
            }
            OutputSource::InMemory(content) => {
                self.upload_reader(Cursor::new(content.clone()), Path::new("<memory>"))
                    .await
            }
        }
    }

    /// Stream `reader` as frames. An empty source still sends one empty
    /// frame; the service waits for at least one before it answers.
    pub async fn upload_reader<R>(&self, mut reader: R, origin: &Path) -> Result<ContentId, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut stream = self.guarded(self.store.open_upload()).await?;
        let mut window = vec![0u8; self.chunk_size];
        let mut frames = 0usize;
        let mut total = 0usize;

        loop {
            let filled = self
                .guarded(async {
                    fill_window(&mut reader, &mut window)
                        .await
                        .map_err(|e| TransferError::io(origin, e))
                })
                .await?;
            if filled == 0 {
                break;
            }
            self.guarded(stream.send(Bytes::copy_from_slice(&window[..filled])))
                .await?;
            frames += 1;
            total += filled;
            if filled < window.len() {
                break;
            }
        }

        if frames == 0 {
            self.guarded(stream.send(Bytes::new())).await?;
            frames = 1;
        }

        let id = self.guarded(stream.close_and_recv()).await?;
        debug!(
            "[transfer] uploaded {} ({} bytes, {} frames) as {}",
            origin.display(),
            total,
            frames,
            id
        );
        Ok(id)
    }

    /// Write the blob `id` to `dest`, creating or truncating it. Returns the
    /// number of bytes written.
    pub async fn download(&self, id: &ContentId, dest: &Path) -> Result<u64, TransferError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }

        // dropped (and therefore closed) on every return below
        let mut stream = self.guarded(self.store.open_download(id)).await?;

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransferError::io(dest, e))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        while let Some(frame) = self.guarded(stream.next_frame()).await? {
            writer
                .write_all(&frame)
                .await
                .map_err(|e| TransferError::io(dest, e))?;
            written += frame.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| TransferError::io(dest, e))?;

        debug!("[transfer] downloaded {} to {} ({} bytes)", id, dest.display(), written);
        Ok(written)
    }

    async fn guarded<T, F>(&self, fut: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransferError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            res = fut => res,
        }
    }
}

/// Read until `window` is full or the reader is exhausted, so a short OS
/// read never produces a short frame.
async fn fill_window<R>(reader: &mut R, window: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < window.len() {
        let n = reader.read(&mut window[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
