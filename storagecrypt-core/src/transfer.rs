use std::{
    env,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use md5::Context;
use reqwest::{Body, Response};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;

use crate::error::{Reason, StorageError};
use crate::progress::{Phase, SharedListener, checkpoint};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Per-provider cap on concurrent transfers.
#[derive(Clone)]
pub struct TransferLimits {
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("STORAGECRYPT_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("STORAGECRYPT_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferLimits {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    pub async fn download_permit(&self) -> Result<OwnedSemaphorePermit, StorageError> {
        Arc::clone(&self.download_limit)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::new(Reason::Other, "download limiter is closed"))
    }

    pub async fn upload_permit(&self) -> Result<OwnedSemaphorePermit, StorageError> {
        Arc::clone(&self.upload_limit)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::new(Reason::Other, "upload limiter is closed"))
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams a response body into `target` through a `.partial` sibling.
///
/// The partial file is removed on cancellation or integrity failure, so the
/// target only ever appears complete.
pub async fn download_to_path(
    response: Response,
    target: &Path,
    expected_md5: Option<&str>,
    listener: &SharedListener,
) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let result = stream_into(response, &partial, expected_md5, listener).await;
    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, target).await?;
    Ok(())
}

async fn stream_into(
    response: Response,
    partial: &Path,
    expected_md5: Option<&str>,
    listener: &SharedListener,
) -> Result<(), StorageError> {
    if let Some(len) = response.content_length() {
        listener.on_set_max(Phase::Download, len);
    }
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut md5 = expected_md5.map(|_| Context::new());
    let mut received = 0u64;

    while let Some(chunk) = stream.next().await {
        checkpoint(listener.as_ref()).await?;
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&chunk);
        }
        received += chunk.len() as u64;
        listener.on_progress(Phase::Download, received);
    }
    file.flush().await?;
    file.sync_all().await?;

    if let (Some(expected), Some(ctx)) = (expected_md5, md5) {
        let actual = format!("{:x}", ctx.compute());
        if actual != expected.to_ascii_lowercase() {
            return Err(StorageError::invalid_response(format!(
                "download integrity check failed: expected {}, got {actual}",
                expected.to_ascii_lowercase()
            )));
        }
    }
    Ok(())
}

pub async fn download_to_vec(
    response: Response,
    listener: &SharedListener,
) -> Result<Vec<u8>, StorageError> {
    if let Some(len) = response.content_length() {
        listener.on_set_max(Phase::Download, len);
    }
    let mut out = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        checkpoint(listener.as_ref()).await?;
        out.extend_from_slice(&chunk?);
        listener.on_progress(Phase::Download, out.len() as u64);
    }
    Ok(out)
}

/// Request body reading `source` in chunks, polling the listener per chunk.
pub async fn file_body(
    source: &Path,
    listener: &SharedListener,
) -> Result<(Body, u64), StorageError> {
    let file = tokio::fs::File::open(source).await?;
    let len = file.metadata().await?.len();
    listener.on_set_max(Phase::Upload, len);
    let stream = ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE);
    Ok((Body::wrap_stream(watch_upload(stream, listener)), len))
}

pub fn data_body(data: Vec<u8>, listener: &SharedListener) -> (Body, u64) {
    let len = data.len() as u64;
    listener.on_set_max(Phase::Upload, len);
    let chunks: Vec<Result<Vec<u8>, std::io::Error>> = data
        .chunks(UPLOAD_CHUNK_SIZE)
        .map(|chunk| Ok(chunk.to_vec()))
        .collect();
    let stream = futures_util::stream::iter(chunks);
    (Body::wrap_stream(watch_upload(stream, listener)), len)
}

fn watch_upload<S, B>(
    stream: S,
    listener: &SharedListener,
) -> impl futures_util::Stream<Item = Result<B, std::io::Error>> + Send + 'static
where
    S: futures_util::Stream<Item = Result<B, std::io::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let listener = Arc::clone(listener);
    let sent = Arc::new(AtomicU64::new(0));
    stream.then(move |chunk| {
        let listener = Arc::clone(&listener);
        let sent = Arc::clone(&sent);
        async move {
            let chunk = chunk?;
            if checkpoint(listener.as_ref()).await.is_err() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "upload canceled",
                ));
            }
            let len = chunk.as_ref().len() as u64;
            let total = sent.fetch_add(len, Ordering::Relaxed) + len;
            listener.on_progress(Phase::Upload, total);
            Ok(chunk)
        }
    })
}

/// Maps a failed transfer to `UserCanceled` when the listener asked for it.
pub fn canceled_or(err: StorageError, listener: &SharedListener) -> StorageError {
    if listener.is_canceled() {
        StorageError::canceled()
    } else {
        err
    }
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
