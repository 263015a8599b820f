//! Upload receiver.
//!
//! Validates the declared content type of an inbound upload and caps the
//! number of bytes that may flow from the transport into staging.

use crate::config::UploadConfig;
use crate::error::{PipelineError, Result};
use anyhow::Context;
use bytes::Bytes;
use futures::{ready, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tracing::debug;
use uuid::Uuid;

/// An inbound upload as handed over by the transport layer
pub struct UploadRequest<S> {
    /// Authenticated caller
    pub user_id: Uuid,
    /// Target video record
    pub video_id: Uuid,
    /// Raw `Content-Type` value declared for the video part
    pub content_type: String,
    /// Raw byte stream
    pub body: S,
}

/// An upload that passed envelope validation
pub struct AcceptedUpload<S> {
    /// Media type without parameters, e.g. `video/mp4`
    pub media_type: String,
    pub body: BoundedBody<S>,
}

/// Validates uploads against the single supported container type and size ceiling
#[derive(Debug, Clone)]
pub struct UploadReceiver {
    supported: mime::Mime,
    max_bytes: u64,
}

impl UploadReceiver {
    pub fn new(supported: mime::Mime, max_bytes: u64) -> Self {
        Self {
            supported,
            max_bytes,
        }
    }

    pub fn from_config(config: &UploadConfig) -> anyhow::Result<Self> {
        let supported = config
            .content_type
            .parse::<mime::Mime>()
            .with_context(|| format!("Invalid upload content type: {}", config.content_type))?;

        Ok(Self::new(supported, config.max_upload_bytes))
    }

    /// Check the declared content type and wrap the body in a size-capped stream.
    ///
    /// Nothing is read from `body` here.
    pub fn accept<S>(&self, content_type: &str, body: S) -> Result<AcceptedUpload<S>> {
        let media_type = self.validate_content_type(content_type)?;

        debug!(media_type = %media_type, max_bytes = self.max_bytes, "Upload accepted");

        Ok(AcceptedUpload {
            media_type,
            body: BoundedBody::new(body, self.max_bytes),
        })
    }

    /// Parse a `Content-Type` header value and compare its essence to the supported type
    pub fn validate_content_type(&self, content_type: &str) -> Result<String> {
        let parsed = content_type
            .trim()
            .parse::<mime::Mime>()
            .map_err(|e| PipelineError::Validation(format!("Invalid media type: {e}")))?;

        if parsed.essence_str() != self.supported.essence_str() {
            return Err(PipelineError::Validation(format!(
                "Unsupported media type {}, expected {}",
                parsed.essence_str(),
                self.supported.essence_str()
            )));
        }

        Ok(parsed.essence_str().to_string())
    }
}

/// Byte stream that fails once more than `limit` bytes have been offered.
///
/// The chunk that would cross the limit is dropped, never yielded.
pub struct BoundedBody<S> {
    inner: S,
    limit: u64,
    received: u64,
    exhausted: bool,
}

impl<S> BoundedBody<S> {
    pub fn new(inner: S, limit: u64) -> Self {
        Self {
            inner,
            limit,
            received: 0,
            exhausted: false,
        }
    }

    /// Bytes yielded so far
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl<S> Stream for BoundedBody<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.exhausted {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            None => {
                self.exhausted = true;
                Poll::Ready(None)
            }
            Some(Err(e)) => {
                self.exhausted = true;
                Poll::Ready(Some(Err(PipelineError::storage(
                    "Failed to read upload stream",
                    e,
                ))))
            }
            Some(Ok(chunk)) => {
                let total = self.received + chunk.len() as u64;
                if total > self.limit {
                    self.exhausted = true;
                    return Poll::Ready(Some(Err(PipelineError::Validation(format!(
                        "Upload exceeds the {} byte limit",
                        self.limit
                    )))));
                }
                self.received = total;
                Poll::Ready(Some(Ok(chunk)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    fn receiver(max_bytes: u64) -> UploadReceiver {
        UploadReceiver::new("video/mp4".parse().unwrap(), max_bytes)
    }

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_accepts_mp4_with_parameters() {
        let receiver = receiver(1024);
        let accepted = receiver
            .accept("video/mp4; codecs=\"avc1.42E01E\"", body(&[]))
            .unwrap();
        assert_eq!(accepted.media_type, "video/mp4");
    }

    #[test]
    fn test_rejects_other_content_types() {
        let receiver = receiver(1024);
        for content_type in [
            "video/quicktime",
            "video/webm",
            "image/png",
            "application/octet-stream",
            "text/plain",
        ] {
            let err = receiver.accept(content_type, body(&[])).err().unwrap();
            assert_eq!(err.category(), "validation", "{content_type}");
        }
    }

    #[test]
    fn test_rejects_unparseable_content_type() {
        let err = receiver(1024).validate_content_type("not a mime").unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        tokio_test::assert_err!(receiver(1024).validate_content_type(""));
    }

    #[tokio::test]
    async fn test_body_within_limit_passes_through() {
        let mut bounded = BoundedBody::new(body(&[b"abcd", b"efgh"]), 8);
        let mut collected = Vec::new();
        while let Some(chunk) = bounded.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"abcdefgh");
        assert_eq!(bounded.received(), 8);
    }

    #[tokio::test]
    async fn test_body_over_limit_drops_crossing_chunk() {
        let mut bounded = BoundedBody::new(body(&[b"abcd", b"efgh", b"ij"]), 6);

        assert_eq!(bounded.next().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        let err = bounded.next().await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(bounded.next().await.is_none());
        assert_eq!(bounded.received(), 4);
    }

    #[tokio::test]
    async fn test_transport_error_is_storage_error() {
        let chunks: Vec<io::Result<Bytes>> =
            vec![Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))];
        let inner = stream::iter(chunks);
        let mut bounded = BoundedBody::new(inner, 10);
        let err = bounded.next().await.unwrap().unwrap_err();
        assert_eq!(err.category(), "storage");
    }
}
