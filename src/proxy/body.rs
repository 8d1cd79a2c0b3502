//! Body plumbing shared by the pipeline: boxing, size recording, and the
//! buffer-until-threshold collector.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::body::{Body as _, Frame, Incoming, SizeHint};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty_body() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn incoming_body(body: Incoming) -> Body {
    body.map_err(BoxError::from).boxed_unsync()
}

type OnEnd = Box<dyn FnOnce(usize, bool) + Send>;

/// Passes frames through untouched and reports the number of bytes relayed,
/// once. `on_end` receives `true` when the stream was read to its end and
/// `false` when it was dropped early or failed.
pub struct RecordingBody {
    inner: Body,
    total: usize,
    on_end: Option<OnEnd>,
}

impl RecordingBody {
    pub fn new(inner: Body, on_end: impl FnOnce(usize, bool) + Send + 'static) -> Self {
        Self {
            inner,
            total: 0,
            on_end: Some(Box::new(on_end)),
        }
    }

    pub fn boxed(self) -> Body {
        BodyExt::boxed_unsync(self)
    }

    fn finish(&mut self, complete: bool) {
        if let Some(on_end) = self.on_end.take() {
            on_end(self.total, complete);
        }
    }
}

impl hyper::body::Body for RecordingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.total += data.len();
                }
                // hyper stops polling once the body says it has ended.
                if this.inner.is_end_stream() {
                    this.finish(true);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(false);
                Poll::Ready(Some(Err(e)))
            }
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

impl Drop for RecordingBody {
    fn drop(&mut self) {
        let complete = self.inner.is_end_stream();
        self.finish(complete);
    }
}

pub enum Collected {
    Complete(Bytes),
    /// The threshold was reached; the body is still fully readable from here,
    /// starting with the chunks already read.
    Overflow(Body),
}

/// Buffers `body` until it ends or reaches `threshold` bytes.
pub async fn collect_up_to(mut body: Body, threshold: usize) -> Result<Collected, BoxError> {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut size = 0;

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        size += data.len();
        chunks.push(data);
        if size >= threshold {
            return Ok(Collected::Overflow(replay(chunks, body)));
        }
    }

    let mut buffer = BytesMut::with_capacity(size);
    for chunk in chunks {
        buffer.extend_from_slice(&chunk);
    }
    Ok(Collected::Complete(buffer.freeze()))
}

fn replay(chunks: Vec<Bytes>, rest: Body) -> Body {
    let buffered = stream::iter(chunks.into_iter().map(|chunk| Ok(Frame::data(chunk))));
    StreamBody::new(buffered.chain(BodyStream::new(rest))).boxed_unsync()
}
