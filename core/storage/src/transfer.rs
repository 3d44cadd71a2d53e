//! Sequential chunked uploads with a per-chunk retry budget.
//!
//! Chunks are read from the source one at a time, so a chunk's offset is the
//! number of bytes consumed before it. Each chunk is sent until it gets a 2xx
//! status or the retry budget runs out; the caller's cancellation token
//! aborts the transfer between or during any step.

use bytes::Bytes;
use reqwest::StatusCode;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use driveshare_common::{Error, Result};

use crate::retry::RetryConfig;

/// Size of one upload chunk.
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Number of chunks needed for `total` bytes; an empty body is one chunk.
pub fn chunk_count(total: u64, chunk_size: u64) -> usize {
    if total == 0 {
        return 1;
    }
    total.div_ceil(chunk_size) as usize
}

/// One slice of an upload.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 0-based chunk number.
    pub index: usize,
    /// Offset of the first byte within the whole body.
    pub offset: u64,
    pub data: Bytes,
    /// Size of the whole body.
    pub total: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `Content-Range` header value, `bytes {first}-{last}/{total}`.
    pub fn content_range(&self) -> String {
        let last = (self.offset + self.len()).saturating_sub(1);
        format!("bytes {}-{}/{}", self.offset, last, self.total)
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Upload `total` bytes from `reader` in `chunk_size` pieces.
///
/// `send` performs one attempt for one chunk and returns the response
/// status. A non-2xx status or a transient error is retried up to the
/// budget in `retry`; any other error aborts immediately. Returns the
/// number of chunks sent.
///
/// # Errors
/// - `TransferFailed` if a chunk exhausts its budget or the body is shorter
///   than `total`
/// - `Cancelled` if `cancel` fires
pub async fn upload_chunks<R, F, Fut>(
    reader: &mut R,
    total: u64,
    chunk_size: u64,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    mut send: F,
) -> Result<usize>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    F: FnMut(Chunk) -> Fut + Send,
    Fut: Future<Output = Result<StatusCode>> + Send,
{
    let count = chunk_count(total, chunk_size);
    let mut offset = 0u64;

    for index in 0..count {
        let len = chunk_size.min(total - offset) as usize;
        let mut buf = vec![0u8; len];
        cancellable(cancel, async {
            reader.read_exact(&mut buf).await.map(|_| ()).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::TransferFailed(format!(
                        "Body ended early: chunk {} expected {} bytes at offset {} of {}",
                        index, len, offset, total
                    ))
                } else {
                    Error::Io(e)
                }
            })
        })
        .await?;

        let chunk = Chunk {
            index,
            offset,
            data: Bytes::from(buf),
            total,
        };
        send_with_retry(&chunk, retry, cancel, &mut send).await?;
        offset += chunk.len();
    }

    debug!("Uploaded {} bytes in {} chunks", total, count);
    Ok(count)
}

async fn send_with_retry<F, Fut>(
    chunk: &Chunk,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    send: &mut F,
) -> Result<()>
where
    F: FnMut(Chunk) -> Fut + Send,
    Fut: Future<Output = Result<StatusCode>> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match cancellable(cancel, send(chunk.clone())).await {
            Ok(status) if status.is_success() => {
                if attempt > 1 {
                    debug!("Chunk {} succeeded after {} attempts", chunk.index, attempt);
                }
                return Ok(());
            }
            Ok(status) => format!("status {}", status),
            Err(e) if e.is_transient() => e.to_string(),
            Err(e) => return Err(e),
        };

        if attempt >= retry.max_attempts {
            warn!(
                "Chunk {} failed after {} attempts: {}",
                chunk.index, attempt, failure
            );
            return Err(Error::TransferFailed(format!(
                "Chunk {} ({}) failed after {} attempts: {}",
                chunk.index,
                chunk.content_range(),
                attempt,
                failure
            )));
        }

        let delay = retry.delay_for_attempt(attempt - 1);
        warn!(
            "Chunk {} attempt {} failed: {}. Retrying in {:?}...",
            chunk.index, attempt, failure, delay
        );
        cancellable(cancel, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
    }
}
