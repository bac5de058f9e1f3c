//! Async injection pipeline
//!
//! Message delivery into a session means POSTing a prompt to the backend,
//! which can block for seconds. Deliveries are queued onto a channel and
//! drained by a small worker pool so the router never waits on the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::metrics::{self, Metrics};

/// Base backoff between injection attempts; scaled by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One queued delivery.
#[derive(Debug)]
pub struct InjectionJob {
    /// Target session id
    pub session_id: String,
    /// Full formatted prompt text
    pub text: String,
}

/// Cheaply cloneable handle for queueing injections.
#[derive(Clone)]
pub struct Injector {
    tx: mpsc::UnboundedSender<InjectionJob>,
    depth: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl Injector {
    /// Queue a prompt for delivery. Never blocks; silently drops the job
    /// when the worker pool has shut down.
    pub fn enqueue(&self, session_id: impl Into<String>, text: impl Into<String>) {
        let job = InjectionJob {
            session_id: session_id.into(),
            text: text.into(),
        };
        if self.tx.send(job).is_ok() {
            let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics
                .set_gauge(metrics::INJECTION_QUEUE_SIZE, depth as f64);
        }
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Spawn `workers` injection workers draining a shared queue and return the
/// enqueue handle. Workers run until `cancel` fires.
pub fn spawn_workers<B: Backend>(
    backend: Arc<B>,
    workers: usize,
    retries: u32,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Injector {
    let (tx, rx) = mpsc::unbounded_channel::<InjectionJob>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let depth = Arc::new(AtomicUsize::new(0));

    for worker_id in 0..workers {
        let backend = Arc::clone(&backend);
        let rx = Arc::clone(&rx);
        let depth = Arc::clone(&depth);
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            log::debug!("Injection worker {worker_id} started");
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = rx.recv() => match job {
                            Some(job) => job,
                            None => break,
                        },
                    }
                };
                let remaining = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                metrics.set_gauge(metrics::INJECTION_QUEUE_SIZE, remaining as f64);

                inject_with_retries(backend.as_ref(), &job, retries, &metrics, &cancel).await;
            }
            log::debug!("Injection worker {worker_id} stopped");
        });
    }

    Injector { tx, depth, metrics }
}

/// Deliver one job, retrying with linear backoff. Counts a success, each
/// retry, and the final failure.
async fn inject_with_retries<B: Backend>(
    backend: &B,
    job: &InjectionJob,
    retries: u32,
    metrics: &Metrics,
    cancel: &CancellationToken,
) {
    let short_id: String = job.session_id.chars().take(8).collect();

    for attempt in 1..=retries {
        match backend.send_prompt(&job.session_id, &job.text).await {
            Ok(()) => {
                log::info!("Injected message into session {short_id}...");
                metrics.inc(metrics::INJECTIONS_TOTAL);
                return;
            }
            Err(e) => log::warn!("Injection attempt {attempt} failed: {e}"),
        }

        if attempt < retries {
            metrics.inc(metrics::INJECTIONS_RETRIED);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RETRY_BACKOFF * attempt) => {}
            }
        }
    }

    log::error!("Injection failed after {retries} attempts for session {short_id}");
    metrics.inc(metrics::INJECTIONS_FAILED);
}
