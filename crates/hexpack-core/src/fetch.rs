//! Bounded, deduplicating fetch coordinator.
//!
//! Jobs are keyed by a [`Fingerprint`]. While a job is in flight, further
//! submissions with the same fingerprint attach as waiters of the single
//! network call; its result (or error) is delivered to every waiter. Results
//! arrive in completion order; the pool promises nothing about submission
//! order across fingerprints.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, warn};

use crate::client::ProgressFn;
use crate::error::{Error, Result};

/// Job identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint for a registry fetch.
    pub fn registry(repo: &str, name: &str, etag: Option<&str>) -> Self {
        Self(format!("registry:{}:{}:{}", repo, name, etag.unwrap_or("")))
    }

    /// Fingerprint for a tarball fetch.
    pub fn tarball(repo: &str, name: &str, version: &impl fmt::Display) -> Self {
        Self(format!("tarball:{}:{}:{}", repo, name, version))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Context handed to a running job.
///
/// Jobs check for cancellation at each I/O boundary and report byte progress
/// through the (non-blocking) callback.
#[derive(Clone)]
pub struct JobContext {
    cancel: watch::Receiver<bool>,
    progress: Option<ProgressFn>,
}

impl JobContext {
    /// Whether the pool has been shut down.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Error out if the pool has been shut down.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The job's progress callback, if a waiter registered one.
    pub fn progress(&self) -> Option<ProgressFn> {
        self.progress.clone()
    }
}

type SharedResult<T> = std::result::Result<T, Arc<Error>>;

/// Bounded worker pool with per-fingerprint deduplication.
pub struct FetchPool<T> {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<Fingerprint, broadcast::Sender<SharedResult<T>>>>>,
    cancel: watch::Sender<bool>,
}

impl<T: Clone + Send + 'static> FetchPool<T> {
    /// A pool bounded at `max_in_flight` concurrent jobs.
    pub fn new(max_in_flight: usize) -> Self {
        Self::with_semaphore(Arc::new(Semaphore::new(max_in_flight.max(1))))
    }

    /// A pool sharing an existing concurrency bound.
    ///
    /// Several typed pools can draw permits from one semaphore so the bound
    /// covers all of them together.
    pub fn with_semaphore(semaphore: Arc<Semaphore>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            semaphore,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        }
    }

    /// Run `job` under the pool's bound, deduplicated by `fingerprint`.
    ///
    /// If a job with the same fingerprint is already in flight, this call
    /// attaches as a waiter and `job` is never invoked; the in-flight job's
    /// result is shared. The first waiter's progress callback is the one a
    /// deduplicated job reports to.
    pub async fn run<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        progress: Option<ProgressFn>,
        job: F,
    ) -> Result<T>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if *self.cancel.borrow() {
            return Err(Error::Cancelled);
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock().expect("fetch pool lock poisoned");
            if let Some(rx) = in_flight.get(&fingerprint).map(|tx| tx.subscribe()) {
                debug!(fingerprint = %fingerprint, "attaching to in-flight job");
                drop(in_flight);
                rx
            } else {
                let (tx, rx) = broadcast::channel(1);
                in_flight.insert(fingerprint.clone(), tx.clone());
                drop(in_flight);

                let context = JobContext {
                    cancel: self.cancel.subscribe(),
                    progress,
                };
                let future = job(context);

                let semaphore = self.semaphore.clone();
                let in_flight = self.in_flight.clone();
                let cancel = self.cancel.subscribe();
                tokio::spawn(async move {
                    let result = async {
                        let _permit = semaphore
                            .acquire()
                            .await
                            .map_err(|_| Error::Cancelled)?;
                        if *cancel.borrow() {
                            return Err(Error::Cancelled);
                        }
                        future.await
                    }
                    .await;

                    in_flight
                        .lock()
                        .expect("fetch pool lock poisoned")
                        .remove(&fingerprint);

                    if let Err(e) = &result {
                        warn!(fingerprint = %fingerprint, error = %e, "fetch job failed");
                    }
                    // Every waiter holds a receiver, so delivery only fails
                    // when all of them already went away.
                    let _ = tx.send(result.map_err(Arc::new));
                });

                rx
            }
        };

        match rx.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(shared)) => Err(Arc::try_unwrap(shared).unwrap_or_else(|shared| Error::Fetch {
                message: shared.to_string(),
            })),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Cooperatively cancel outstanding jobs.
    ///
    /// Queued jobs fail with [`Error::Cancelled`]; running jobs observe the
    /// flag at their next I/O boundary. Calling this more than once is a
    /// no-op.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
        self.semaphore.close();
    }
}
