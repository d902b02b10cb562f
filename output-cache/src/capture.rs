//! The response-capture shim: a write-through wrapper around the downstream body that
//! buffers bytes up to a configured maximum and fires a "response started" callback on
//! the first frame, grounded in the teacher's `StreamingBody` (`http-cache/src/body.rs`)
//! pattern of a `pin_project`-based `http_body::Body` wrapper.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pin_project! {
    /// Wraps a downstream response body, duplicating every data frame into a bounded
    /// buffer while still forwarding it to the client unchanged.
    ///
    /// Bytes are never withheld from the client: once `maximum_body_size` would be
    /// exceeded, buffering disables permanently for this response, but the pass-through
    /// to the underlying sink continues untouched.
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        segments: Vec<Bytes>,
        buffered_len: usize,
        max_body_size: usize,
        buffering_enabled: bool,
        on_response_started: Option<Box<dyn FnOnce() + Send>>,
    }
}

impl<B> CaptureBody<B> {
    /// Wrap `inner`, capturing up to `max_body_size` bytes. `on_response_started` fires
    /// exactly once, on the first frame yielded by `inner`.
    pub fn new(
        inner: B,
        max_body_size: usize,
        on_response_started: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            inner,
            segments: Vec::new(),
            buffered_len: 0,
            max_body_size,
            buffering_enabled: true,
            on_response_started: Some(on_response_started),
        }
    }

    /// Whether the buffer is still intact. `false` once a write would have exceeded
    /// `max_body_size`; the response continues streaming to the client regardless.
    pub fn buffering_enabled(&self) -> bool {
        self.buffering_enabled
    }

    /// The captured body so far, concatenated from its segments. Empty once buffering
    /// has been disabled by an oversized write.
    pub fn buffered_body(&self) -> Bytes {
        if self.segments.len() == 1 {
            return self.segments[0].clone();
        }
        let mut out = Vec::with_capacity(self.buffered_len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        Bytes::from(out)
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(cb) = this.on_response_started.take() {
                    cb();
                }

                if let Some(data) = frame.data_ref() {
                    if *this.buffering_enabled {
                        if *this.buffered_len + data.len() > *this.max_body_size {
                            *this.buffering_enabled = false;
                            this.segments.clear();
                            *this.buffered_len = 0;
                        } else {
                            *this.buffered_len += data.len();
                            this.segments.push(data.clone());
                        }
                    }
                }

                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn captures_full_body_under_the_limit() {
        let started = Arc::new(AtomicBool::new(false));
        let started_clone = started.clone();
        let body = Full::new(Bytes::from("hello"));
        let mut captured = CaptureBody::new(
            body,
            1024,
            Box::new(move || started_clone.store(true, Ordering::SeqCst)),
        );

        let collected = (&mut captured).collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello"));
        assert!(started.load(Ordering::SeqCst));
        assert!(captured.buffering_enabled());
        assert_eq!(captured.buffered_body(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn disables_buffering_once_over_the_limit_but_still_forwards() {
        let body = Full::new(Bytes::from("hello world"));
        let mut captured = CaptureBody::new(body, 4, Box::new(|| {}));

        let collected = (&mut captured).collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello world"));
        assert!(!captured.buffering_enabled());
        assert_eq!(captured.buffered_body(), Bytes::new());
    }

    #[tokio::test]
    async fn response_started_fires_exactly_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        let body = Full::new(Bytes::from("ab"));
        let mut captured = CaptureBody::new(
            body,
            1024,
            Box::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let _ = (&mut captured).collect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
