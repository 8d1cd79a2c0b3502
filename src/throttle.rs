//! Bandwidth limiting shared by every throttled stream of a proxy instance.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::Instant,
};

use crate::proxy::Body;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Throttle rate must be at least 1 kb/s")]
    InvalidRate,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket refilled at `rate` bytes per second with a one second burst.
pub struct ThrottleGroup {
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl ThrottleGroup {
    pub fn from_kbps(kbps: u64) -> Result<Self, ThrottleError> {
        if kbps == 0 {
            return Err(ThrottleError::InvalidRate);
        }
        let rate = kbps * 1024;
        Ok(Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Waits until `bytes` may be sent. Callers are served in arrival order.
    pub async fn acquire(&self, bytes: usize) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens -= bytes as f64;

        if bucket.tokens < 0.0 {
            let wait = Duration::from_secs_f64(-bucket.tokens / self.rate as f64);
            tokio::time::sleep(wait).await;
            self.refill(&mut bucket);
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        bucket.refilled_at = now;
    }
}

/// Wraps a body so that each data frame is released at the group's pace.
pub fn throttle_body(body: Body, group: Arc<ThrottleGroup>) -> Body {
    let frames = BodyStream::new(body).then(move |frame| {
        let group = group.clone();
        async move {
            if let Ok(ref frame) = frame {
                if let Some(data) = frame.data_ref() {
                    group.acquire(data.len()).await;
                }
            }
            frame
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

/// Copies `reader` into `writer` until EOF, pacing writes through `group`.
pub async fn copy_throttled<R, W>(reader: &mut R, writer: &mut W, group: &ThrottleGroup) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        group.acquire(n).await;
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
