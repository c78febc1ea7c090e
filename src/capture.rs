//! Size-bounded response body capture.
//!
//! A body is streamed chunk by chunk into two destinations at once:
//! - a small in-memory snippet (at most `snippet_bytes`)
//! - an optional sink (at most `max_body_bytes`), awaited on every write so a
//!   slow sink throttles the producer instead of growing a buffer
//!
//! Resident memory per capture is the snippet plus one chunk. A `Vec<u8>` sink
//! is the in-memory body buffer used for decoding 2xx responses, a file is the
//! on-disk diagnostic capture for failures.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::failure::ThrownError;
use crate::types::Variant;

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Error types for capture operations
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The attempt deadline fired while the body was being read
    #[error("body read cancelled by deadline")]
    Cancelled,

    /// The byte source failed mid-stream
    #[error("body stream failed: {}", .0.message)]
    Source(ThrownError),
}

/// Byte caps for one capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub snippet_bytes: usize,
    pub max_body_bytes: u64,
}

/// What a capture retained
#[derive(Debug)]
pub struct Capture<W> {
    /// UTF-8 snippet, never longer than `snippet_bytes`
    pub snippet: String,
    /// Bytes accepted by the sink, never more than `max_body_bytes`
    pub bytes_written: u64,
    /// Input was dropped because a cap was reached
    pub truncated: bool,
    /// The sink handed back to the caller (None if absent or failed)
    pub sink: Option<W>,
    /// A sink write failed and the sink was abandoned
    pub sink_failed: bool,
}

/// Metadata sidecar written next to a captured body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub case_id: String,
    pub version: Variant,
    pub attempt: u32,
    pub max_body_bytes: u64,
    pub truncated: bool,
    pub bytes_written: u64,
    pub content_type: Option<String>,
}

/// Stream `source` into the snippet buffer and `sink` under `limits`.
///
/// Stops at end of stream, or as soon as a byte has to be dropped (the sink,
/// or the snippet when there is no sink, is full and input remains); the
/// source is dropped at that point, which cancels the underlying read.
pub async fn capture_body<S, W>(
    mut source: S,
    mut sink: Option<W>,
    limits: CaptureLimits,
    cancel: &CancellationToken,
) -> CaptureResult<Capture<W>>
where
    S: Stream<Item = Result<Bytes, ThrownError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut snippet_buf: Vec<u8> = Vec::with_capacity(limits.snippet_bytes.min(8 * 1024));
    let mut bytes_written: u64 = 0;
    let mut truncated = false;
    let mut sink_failed = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            item = source.next() => item,
        };

        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => return Err(CaptureError::Source(err)),
        };
        if chunk.is_empty() {
            continue;
        }

        let snippet_room = limits.snippet_bytes.saturating_sub(snippet_buf.len());
        let snippet_take = snippet_room.min(chunk.len());
        snippet_buf.extend_from_slice(&chunk[..snippet_take]);
        let snippet_dropped = snippet_take < chunk.len();

        let dropped = match sink.as_mut() {
            Some(writer) => {
                let room = limits.max_body_bytes.saturating_sub(bytes_written);
                let take = usize::try_from(room).unwrap_or(usize::MAX).min(chunk.len());
                if take > 0 {
                    let write = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
                        result = writer.write_all(&chunk[..take]) => result,
                    };
                    match write {
                        Ok(()) => bytes_written += take as u64,
                        Err(err) => {
                            tracing::warn!(error = %err, "body sink write failed, continuing with snippet only");
                            sink_failed = true;
                        }
                    }
                }
                take < chunk.len()
            }
            None => snippet_dropped,
        };

        if sink_failed && sink.is_some() {
            sink = None;
        }

        if dropped {
            truncated = true;
            break;
        }
    }

    // Releasing the stream cancels whatever the producer still has in flight.
    drop(source);

    if let Some(writer) = sink.as_mut() {
        if let Err(err) = writer.flush().await {
            tracing::warn!(error = %err, "body sink flush failed");
            sink_failed = true;
            sink = None;
        }
    }

    Ok(Capture {
        snippet: bounded_snippet(&snippet_buf, limits.snippet_bytes),
        bytes_written,
        truncated,
        sink,
        sink_failed,
    })
}

/// Decode a byte prefix into a string of at most `cap` bytes.
///
/// A multi-byte sequence split by the cap is dropped rather than replaced.
pub fn bounded_snippet(bytes: &[u8], cap: usize) -> String {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(err) if err.error_len().is_none() => {
            String::from_utf8_lossy(&bytes[..err.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    };
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Write a metadata sidecar as pretty JSON
pub async fn write_capture_meta(path: &Path, meta: &CaptureMeta) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    tokio::fs::write(path, json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ThrownError>> + Unpin {
        let items: Vec<Result<Bytes, ThrownError>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    fn limits(snippet_bytes: usize, max_body_bytes: u64) -> CaptureLimits {
        CaptureLimits {
            snippet_bytes,
            max_body_bytes,
        }
    }

    #[tokio::test]
    async fn test_small_body_fits() {
        let token = CancellationToken::new();
        let capture = capture_body(chunks(&["{\"a\":", "1}"]), Some(Vec::new()), limits(64, 64), &token)
            .await
            .unwrap();
        assert_eq!(capture.snippet, "{\"a\":1}");
        assert_eq!(capture.bytes_written, 7);
        assert!(!capture.truncated);
        assert_eq!(capture.sink.unwrap(), b"{\"a\":1}".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_body_is_truncated_and_source_dropped() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let source = stream::iter((0..100).map(|_| Ok(Bytes::from_static(b"0123456789"))))
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let token = CancellationToken::new();

        let capture = capture_body(Box::pin(source), Some(Vec::new()), limits(4, 25), &token)
            .await
            .unwrap();

        assert!(capture.truncated);
        assert_eq!(capture.bytes_written, 25);
        assert_eq!(capture.snippet, "0123");
        assert_eq!(capture.sink.unwrap().len(), 25);
        assert_eq!(polled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exact_cap_is_not_truncated() {
        let token = CancellationToken::new();
        let capture = capture_body(chunks(&["12345", "67890"]), Some(Vec::new()), limits(4, 10), &token)
            .await
            .unwrap();
        assert!(!capture.truncated);
        assert_eq!(capture.bytes_written, 10);
        assert_eq!(capture.snippet.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let token = CancellationToken::new();
        let capture = capture_body(chunks(&[]), None::<Vec<u8>>, limits(16, 16), &token)
            .await
            .unwrap();
        assert_eq!(capture.snippet, "");
        assert_eq!(capture.bytes_written, 0);
        assert!(!capture.truncated);
    }

    #[tokio::test]
    async fn test_snippet_only_path_truncates_on_snippet_cap() {
        let token = CancellationToken::new();
        let capture = capture_body(chunks(&["abcdef", "ghij"]), None::<Vec<u8>>, limits(8, 1024), &token)
            .await
            .unwrap();
        assert!(capture.truncated);
        assert_eq!(capture.snippet, "abcdefgh");
        assert_eq!(capture.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_caps_hold_for_many_sizes() {
        let token = CancellationToken::new();
        for total in [0usize, 1, 7, 8, 9, 63, 64, 65, 500] {
            let body = "x".repeat(total);
            let parts: Vec<&str> = body.as_bytes().chunks(5).map(|c| std::str::from_utf8(c).unwrap()).collect();
            let capture = capture_body(chunks(&parts), Some(Vec::new()), limits(8, 64), &token)
                .await
                .unwrap();
            assert!(capture.bytes_written <= 64);
            assert!(capture.snippet.len() <= 8);
            assert_eq!(capture.truncated, total > 64, "total={}", total);
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_read() {
        let token = CancellationToken::new();
        let source = chunks(&["partial"]).chain(stream::pending());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = capture_body(source, Some(Vec::new()), limits(16, 16), &token).await;
        assert!(matches!(result, Err(CaptureError::Cancelled)));
    }

    #[tokio::test]
    async fn test_source_error_is_reported() {
        let token = CancellationToken::new();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(ThrownError::new("BodyError", "connection reset by peer")),
        ]);
        let result = capture_body(source, None::<Vec<u8>>, limits(16, 16), &token).await;
        match result {
            Err(CaptureError::Source(err)) => assert!(err.message.contains("reset")),
            other => panic!("unexpected result: {:?}", other.map(|c| c.bytes_written)),
        }
    }

    #[tokio::test]
    async fn test_slow_sink_applies_backpressure() {
        // The duplex pipe holds 8 bytes; every write waits for the reader.
        let (writer, mut reader) = tokio::io::duplex(8);
        let drain = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 4];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            received
        });

        let token = CancellationToken::new();
        let body = "abcdefghij".repeat(10);
        let parts: Vec<&str> = body.as_bytes().chunks(32).map(|c| std::str::from_utf8(c).unwrap()).collect();
        let capture = capture_body(chunks(&parts), Some(writer), limits(4, 64), &token)
            .await
            .unwrap();
        assert!(capture.truncated);
        assert_eq!(capture.bytes_written, 64);
        drop(capture.sink);

        let received = drain.await.unwrap();
        assert_eq!(received, body.as_bytes()[..64].to_vec());
    }

    #[test]
    fn test_bounded_snippet_respects_char_boundaries() {
        let text = "héllo";
        // 'é' is two bytes; a cap of 2 must not split it
        assert_eq!(bounded_snippet(text.as_bytes(), 2), "h");
        assert_eq!(bounded_snippet(text.as_bytes(), 3), "hé");
        // incomplete trailing sequence is dropped
        assert_eq!(bounded_snippet(&text.as_bytes()[..2], 8), "h");
        assert_eq!(bounded_snippet(b"plain", 10), "plain");
    }
}
