//! Shared encryption and decryption workers
//!
//! Every peer hands its seal and open jobs to one pool of workers. Each job
//! carries a one-shot slot for its result, so a peer's sequential tasks can
//! await results in enqueue order no matter which worker finishes first.
//!
//! The pool stays alive while its open count is non-zero. The device holds
//! one count and every running peer holds another; when the last one is
//! released the job channel closes, the workers drain it and exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CryptoError, QueueError};
use crate::protocol::Keypair;

/// Result slot of one crypto job
pub type CryptResult = Result<Vec<u8>, CryptoError>;

pub enum CryptJob {
    Seal {
        keypair: Arc<Keypair>,
        counter: u64,
        plaintext: Vec<u8>,
        done: oneshot::Sender<CryptResult>,
    },
    Open {
        keypair: Arc<Keypair>,
        counter: u64,
        sealed: Vec<u8>,
        done: oneshot::Sender<CryptResult>,
    },
}

impl CryptJob {
    fn run(self) {
        // A dropped receiver means the peer stopped while the job was queued
        match self {
            Self::Seal {
                keypair,
                counter,
                plaintext,
                done,
            } => {
                let _ = done.send(keypair.seal(counter, &plaintext));
            }
            Self::Open {
                keypair,
                counter,
                sealed,
                done,
            } => {
                let _ = done.send(keypair.open(counter, &sealed));
            }
        }
    }
}

pub struct CryptPipeline {
    sender: Mutex<Option<mpsc::Sender<CryptJob>>>,
    open_count: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CryptPipeline {
    /// Spawn `workers` tasks sharing a job queue of `capacity`
    ///
    /// The pipeline starts with an open count of one, owned by the caller.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<CryptJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.run(),
                            None => break,
                        }
                    }
                    tracing::trace!("Crypt worker {} exiting", id);
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            open_count: AtomicUsize::new(1),
            workers: Mutex::new(handles),
        }
    }

    /// Take one open count; fails once the pipeline has fully closed
    pub fn open(&self) -> bool {
        let sender = self.sender.lock();
        if sender.is_none() {
            return false;
        }
        self.open_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Release one open count; the last release closes the job queue
    pub fn close(&self) {
        let mut sender = self.sender.lock();
        let previous = self
            .open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            sender.take();
            tracing::debug!("Crypt pipeline closed");
        }
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Queue a job, waiting for space when the pipeline is saturated
    pub async fn submit(&self, job: CryptJob) -> Result<(), QueueError> {
        let sender = self.sender.lock().clone().ok_or(QueueError::Closed)?;
        sender.send(job).await.map_err(|_| QueueError::Closed)
    }

    /// Wait for every worker to exit after the final close
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
