//! Per-folder byte-rate limiting.
//!
//! Each folder owns up to two token buckets, one per transfer direction.
//! Streams are throttled by wrapping their reader in [`ThrottledReader`],
//! which draws from the shared bucket and sleeps when it runs dry. Buckets
//! are reconfigured in place, so streams opened before a policy change pick
//! up the new rate on their next read.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

const REFILL_WINDOW: Duration = Duration::from_secs(1);

/// A shared token bucket granting `rate` bytes per one-second window.
/// A rate of zero means uncapped.
#[derive(Debug, Clone)]
pub struct Bucket {
    inner: Arc<Mutex<BucketState>>,
}

#[derive(Debug)]
struct BucketState {
    rate: u64,
    available: u64,
    last_refill: Instant,
}

/// Outcome of a [`Bucket::take`] call.
#[derive(Debug)]
pub enum Grant {
    /// This many bytes may be read now.
    Tokens(usize),
    /// The bucket is dry; retry at this instant.
    Wait(Instant),
}

impl Bucket {
    pub fn new(rate: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState {
                rate,
                available: rate,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn rate(&self) -> u64 {
        self.inner.lock().unwrap().rate
    }

    /// Change the rate in place. Existing streams keep their bucket handle,
    /// so they observe the new rate immediately; zero lifts the cap.
    pub fn set_rate(&self, rate: u64) {
        let mut state = self.inner.lock().unwrap();
        state.rate = rate;
        state.available = state.available.min(rate);
    }

    /// Take up to `want` tokens from the bucket.
    pub fn take(&self, want: usize) -> Grant {
        let mut state = self.inner.lock().unwrap();
        if state.rate == 0 {
            return Grant::Tokens(want);
        }

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let earned = (state.rate as u128 * elapsed.as_nanos() / REFILL_WINDOW.as_nanos()) as u64;
        if earned > 0 {
            state.available = (state.available + earned).min(state.rate);
            state.last_refill = now;
        }

        if state.available == 0 {
            let per_token = REFILL_WINDOW.as_nanos() as u64 / state.rate.max(1);
            return Grant::Wait(now + Duration::from_nanos(per_token.max(1)));
        }

        let granted = want.min(state.available as usize);
        state.available -= granted as u64;
        Grant::Tokens(granted)
    }

    /// Return tokens that were granted but not consumed.
    pub fn refund(&self, tokens: usize) {
        if tokens == 0 {
            return;
        }
        let mut state = self.inner.lock().unwrap();
        if state.rate > 0 {
            state.available = (state.available + tokens as u64).min(state.rate);
        }
    }
}

/// An [`AsyncRead`] adapter that paces its inner reader through a bucket.
/// Without a bucket it is transparent.
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    bucket: Option<Bucket>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, bucket: Option<Bucket>) -> Self {
        Self {
            inner,
            bucket,
            delay: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(bucket) = this.bucket.clone() else {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };

        loop {
            if let Some(delay) = this.delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => this.delay = None,
                }
            }

            match bucket.take(buf.remaining()) {
                Grant::Wait(at) => {
                    this.delay = Some(Box::pin(sleep_until(at)));
                }
                Grant::Tokens(n) if n >= buf.remaining() => {
                    let before = buf.filled().len();
                    return match Pin::new(&mut this.inner).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) => {
                            bucket.refund(n - (buf.filled().len() - before));
                            Poll::Ready(Ok(()))
                        }
                        other => {
                            bucket.refund(n);
                            other
                        }
                    };
                }
                Grant::Tokens(n) => {
                    let mut limited = buf.take(n);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
                        Poll::Pending => {
                            bucket.refund(n);
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(e)) => {
                            bucket.refund(n);
                            return Poll::Ready(Err(e));
                        }
                        Poll::Ready(Ok(())) => {
                            let read = limited.filled().len();
                            bucket.refund(n - read);
                            // SAFETY: `limited` wraps the unfilled region of
                            // `buf`; the inner reader initialized `read`
                            // bytes of it.
                            unsafe { buf.assume_init(read) };
                            buf.advance(read);
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
            }
        }
    }
}

/// The two per-folder bucket maps owned by the serializer: `read` paces
/// download streams, `write` paces upload streams.
#[derive(Debug, Default)]
pub struct RateLimiters {
    read: HashMap<String, Bucket>,
    write: HashMap<String, Bucket>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_rate(&mut self, folder: &str, rate: u64) {
        Self::set(&mut self.read, folder, rate);
    }

    pub fn set_write_rate(&mut self, folder: &str, rate: u64) {
        Self::set(&mut self.write, folder, rate);
    }

    /// Zero releases the bucket (in-flight streams go uncapped), an equal
    /// rate is a no-op, any other value reconfigures in place.
    fn set(map: &mut HashMap<String, Bucket>, folder: &str, rate: u64) {
        if rate == 0 {
            if let Some(bucket) = map.remove(folder) {
                bucket.set_rate(0);
            }
            return;
        }
        match map.get(folder) {
            Some(bucket) => {
                if bucket.rate() != rate {
                    bucket.set_rate(rate);
                }
            }
            None => {
                map.insert(folder.to_string(), Bucket::new(rate));
            }
        }
    }

    /// Drop both buckets of a folder, lifting the cap for open streams.
    pub fn remove(&mut self, folder: &str) {
        Self::set(&mut self.read, folder, 0);
        Self::set(&mut self.write, folder, 0);
    }

    pub fn read_bucket(&self, folder: &str) -> Option<Bucket> {
        self.read.get(folder).cloned()
    }

    pub fn write_bucket(&self, folder: &str) -> Option<Bucket> {
        self.write.get(folder).cloned()
    }
}
