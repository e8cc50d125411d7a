//! Bounded pool of writable archive parts with size-based rotation.
//!
//! `parallelism` parts live in the pool. Writers check a part out with
//! [`TarBallQueue::deque`] and return it with
//! [`TarBallQueue::check_size_and_enqueue_back`]; a part over the size
//! threshold is closed, its upload started, and a fresh part takes its
//! place. At most `max_upload_queue` uploads stay in flight; rotating past
//! that blocks until the oldest upload completes.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{Error, Result};

use super::tar_ball::{TarBall, TarBallMaker, TarUpload};

#[derive(Default)]
struct Pool {
    parts: Vec<Box<dyn TarBall>>,
    started: bool,
}

pub struct TarBallQueue {
    maker: Arc<dyn TarBallMaker>,
    tar_size_threshold: u64,
    parallelism: usize,
    max_upload_queue: usize,
    pool: Mutex<Pool>,
    available: Condvar,
    uploads: Mutex<VecDeque<TarUpload>>,
    uploaded: Mutex<Vec<String>>,
    closed_size: AtomicU64,
}

impl std::fmt::Debug for TarBallQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarBallQueue")
            .field("tar_size_threshold", &self.tar_size_threshold)
            .field("parallelism", &self.parallelism)
            .field("max_upload_queue", &self.max_upload_queue)
            .finish()
    }
}

impl TarBallQueue {
    pub fn new(
        maker: Arc<dyn TarBallMaker>,
        tar_size_threshold: u64,
        parallelism: usize,
        max_upload_queue: usize,
    ) -> Self {
        Self {
            maker,
            tar_size_threshold,
            parallelism: parallelism.max(1),
            max_upload_queue: max_upload_queue.max(1),
            pool: Mutex::new(Pool::default()),
            available: Condvar::new(),
            uploads: Mutex::new(VecDeque::new()),
            uploaded: Mutex::new(Vec::new()),
            closed_size: AtomicU64::new(0),
        }
    }

    pub fn tar_size_threshold(&self) -> u64 {
        self.tar_size_threshold
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Fill the pool. Starting an already started queue is an error.
    pub fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock();
        if pool.started {
            return Err(Error::QueueAlreadyStarted.into());
        }
        pool.parts = (0..self.parallelism).map(|_| self.maker.make()).collect();
        pool.started = true;
        debug!(parallelism = self.parallelism, "started tar ball queue");
        Ok(())
    }

    /// Check out a part, blocking while every part is in use.
    pub fn deque(&self) -> Result<Box<dyn TarBall>> {
        let mut pool = self.pool.lock();
        loop {
            if !pool.started {
                return Err(Error::QueueNotStarted.into());
            }
            if let Some(part) = pool.parts.pop() {
                return Ok(part);
            }
            self.available.wait(&mut pool);
        }
    }

    /// Return a part without checking its size.
    pub fn enqueue_back(&self, part: Box<dyn TarBall>) {
        self.pool.lock().parts.push(part);
        self.available.notify_one();
    }

    pub fn check_size_and_enqueue_back(&self, part: Box<dyn TarBall>) -> Result<()> {
        if part.size() > self.tar_size_threshold {
            return self.finish_tar_ball(part);
        }
        self.enqueue_back(part);
        Ok(())
    }

    fn close_tar_ball(&self, part: Box<dyn TarBall>) -> Result<Option<TarUpload>> {
        let name = part.name().to_string();
        self.closed_size.fetch_add(part.size(), Ordering::Relaxed);
        part.close().with_context(|| format!("closing tar part {name}"))
    }

    fn await_upload(&self, upload: TarUpload) -> Result<()> {
        let stored = upload.wait()?;
        self.uploaded.lock().push(stored);
        Ok(())
    }

    /// Close `part`, queue its upload and put a fresh part in the pool.
    pub fn finish_tar_ball(&self, part: Box<dyn TarBall>) -> Result<()> {
        let upload = self.close_tar_ball(part);
        // The pool keeps its size even when closing failed.
        self.enqueue_back(self.maker.make());
        if let Some(upload) = upload? {
            self.uploads.lock().push_back(upload);
        }
        loop {
            let oldest = {
                let mut uploads = self.uploads.lock();
                if uploads.len() <= self.max_upload_queue {
                    break;
                }
                uploads.pop_front()
            };
            if let Some(upload) = oldest {
                self.await_upload(upload)?;
            }
        }
        Ok(())
    }

    /// Drain the pool, close every started part and wait for all uploads.
    /// Returns the stored names of every uploaded part. Every upload is
    /// awaited even after a failure; the first failure is returned.
    pub fn finish_queue(&self) -> Result<Vec<String>> {
        let mut first_error = None;
        for _ in 0..self.parallelism {
            let part = self.deque()?;
            if !part.is_started() {
                continue;
            }
            match self.close_tar_ball(part) {
                Ok(Some(upload)) => self.uploads.lock().push_back(upload),
                Ok(None) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        self.pool.lock().started = false;
        self.available.notify_all();

        loop {
            let next = self.uploads.lock().pop_front();
            let Some(upload) = next else {
                break;
            };
            if let Err(err) = self.await_upload(upload) {
                warn!(error = %format!("{err:#}"), "tar part upload failed");
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let uploaded = self.uploaded.lock().clone();
        info!(
            parts = uploaded.len(),
            bytes = self.closed_size.load(Ordering::Relaxed),
            "finished tar ball queue"
        );
        Ok(uploaded)
    }

    /// Names of parts uploaded so far.
    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().clone()
    }

    /// Total content bytes of every closed part.
    pub fn closed_size(&self) -> u64 {
        self.closed_size.load(Ordering::Relaxed)
    }
}
