//! The response body types this crate hands back to Tower: a buffered replay for cache
//! hits and short-circuits, and a write-through capture-then-commit body for responses
//! freshly produced by the wrapped service.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::Full;
use pin_project_lite::pin_project;

use output_cache::CaptureBody;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fired once, when the wrapped body has finished streaming to the client, with the
/// bytes [`CaptureBody`] buffered and whether buffering stayed enabled for the whole
/// response. Runs the storage write; never delays the response itself.
pub(crate) type CommitFn = Box<dyn FnOnce(Bytes, bool) + Send>;

/// Fired at most once, if this body is dropped before `poll_frame` ever returns
/// `Poll::Ready(None)` — the client disconnected mid-response (§7 `ClientAbort`). No
/// bytes are withheld from whatever the client did receive; this only skips the commit.
pub(crate) type AbortFn = Box<dyn FnOnce() + Send>;

pin_project! {
    /// Wraps a [`CaptureBody`], running `on_complete` exactly once when the inner stream
    /// is exhausted — the Rust analogue of the spec's deferred-release block firing the
    /// storage commit after the downstream response has fully passed through.
    ///
    /// If the body is instead dropped before exhaustion (the client aborted mid-copy),
    /// `on_abort` runs in its place and `on_complete` never does: the partially captured
    /// buffer is discarded and nothing is committed.
    pub struct CommitOnCompleteBody<B> {
        #[pin]
        inner: CaptureBody<B>,
        on_complete: Option<CommitFn>,
        on_abort: Option<AbortFn>,
    }

    impl<B> PinnedDrop for CommitOnCompleteBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if this.on_complete.is_some() {
                if let Some(on_abort) = this.on_abort.take() {
                    on_abort();
                }
            }
        }
    }
}

impl<B> CommitOnCompleteBody<B> {
    pub(crate) fn new(inner: CaptureBody<B>, on_complete: CommitFn, on_abort: AbortFn) -> Self {
        Self { inner, on_complete: Some(on_complete), on_abort: Some(on_abort) }
    }
}

impl<B> HttpBody for CommitOnCompleteBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll_frame(cx);

        if let Poll::Ready(None) = poll {
            this.on_abort.take();
            if let Some(on_complete) = this.on_complete.take() {
                let buffered = this.inner.as_ref().get_ref().buffered_body();
                let buffering_enabled = this.inner.as_ref().get_ref().buffering_enabled();
                on_complete(buffered, buffering_enabled);
            }
        }

        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    #[project = OutputCacheBodyProj]
    /// The response body returned by [`crate::OutputCacheService`]: a cached replay, an
    /// uncacheable pass-through, or a live capture-and-commit stream.
    #[allow(missing_docs)]
    pub enum OutputCacheBody<B = Full<Bytes>> {
        /// A cache hit, a `304`, or a `504` — buffered bytes with no downstream call.
        Replay { #[pin] inner: Full<Bytes> },
        /// The response was fetched fresh but the request disallowed storage; forwarded
        /// without capture.
        PassThrough { #[pin] inner: UnsyncBoxBody<Bytes, BoxError> },
        /// The response was fetched fresh and is eligible for storage; captured while
        /// streaming to the client.
        Live { #[pin] inner: CommitOnCompleteBody<B> },
    }
}

impl<B> OutputCacheBody<B> {
    pub(crate) fn replay(inner: Full<Bytes>) -> Self {
        Self::Replay { inner }
    }

    pub(crate) fn pass_through(inner: UnsyncBoxBody<Bytes, BoxError>) -> Self {
        Self::PassThrough { inner }
    }

    pub(crate) fn live(inner: CommitOnCompleteBody<B>) -> Self {
        Self::Live { inner }
    }
}

impl<B> HttpBody for OutputCacheBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.project() {
            OutputCacheBodyProj::Replay { inner } => {
                inner.poll_frame(cx).map_err(|e| match e {})
            }
            OutputCacheBodyProj::PassThrough { inner } => inner.poll_frame(cx),
            OutputCacheBodyProj::Live { inner } => inner.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Replay { inner } => inner.is_end_stream(),
            Self::PassThrough { inner } => inner.is_end_stream(),
            Self::Live { inner } => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Replay { inner } => inner.size_hint(),
            Self::PassThrough { inner } => inner.size_hint(),
            Self::Live { inner } => inner.size_hint(),
        }
    }
}
