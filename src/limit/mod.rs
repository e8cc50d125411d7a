//! Disk read throttling.
//!
//! A `DiskLimiter` is built once by whoever drives a backup and handed to
//! the page reader and the packer. Clones share the same bucket.

use std::{
    io::{self, Read},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug)]
struct Bucket {
    rate: u64,
    available: f64,
    last_refill: Instant,
}

/// Optional bytes-per-second token bucket.
#[derive(Debug, Clone, Default)]
pub struct DiskLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
}

impl DiskLimiter {
    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Limit to `bytes_per_sec`; `0` means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        Self {
            bucket: Some(Arc::new(Mutex::new(Bucket {
                rate: bytes_per_sec,
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }))),
        }
    }

    pub fn from_config(rate: Option<u64>) -> Self {
        rate.map(Self::new).unwrap_or_default()
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Block until `bytes` worth of tokens are available, then consume them.
    pub fn wait(&self, bytes: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let sleep_for = {
            let mut b = bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(b.last_refill).as_secs_f64();
            b.available = (b.available + elapsed * b.rate as f64).min(b.rate as f64);
            b.last_refill = now;
            b.available -= bytes as f64;
            if b.available >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-b.available / b.rate as f64))
            }
        };
        if let Some(d) = sleep_for {
            thread::sleep(d);
        }
    }

    /// Wrap `inner` so that every read is charged against this limiter.
    pub fn reader<R: Read>(&self, inner: R) -> LimitedReader<R> {
        LimitedReader {
            inner,
            limiter: self.clone(),
        }
    }
}

/// Reader charging its byte count against a [`DiskLimiter`].
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: R,
    limiter: DiskLimiter,
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.limiter.wait(n);
        Ok(n)
    }
}
