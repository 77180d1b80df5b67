//! Strictly serial FIFO scan queue.
//!
//! Jobs are persisted before they are queued. A single drain worker is
//! spawned when the queue goes from idle to busy and exits once the FIFO is
//! empty, so at most one scan runs at any time.

use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{ScanExecutor, ScanOutcome};
use super::model::{ScanJob, ScanKind, ScanRequest};
use crate::config::ScanQueueConfig;
use crate::error::ScanError;
use crate::store::ScanStore;

/// Error recorded on work a previous process left unfinished.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    /// A drain worker is alive.
    busy: bool,
}

pub struct ScanQueue {
    store: Arc<dyn ScanStore>,
    executor: Arc<dyn ScanExecutor>,
    config: ScanQueueConfig,
    state: Mutex<QueueState>,
    idle: Notify,
}

impl ScanQueue {
    pub fn new(
        store: Arc<dyn ScanStore>,
        executor: Arc<dyn ScanExecutor>,
        config: ScanQueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            config,
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
        })
    }

    /// Persist a queued job and schedule it, starting the worker if idle.
    pub async fn enqueue(self: &Arc<Self>, request: ScanRequest) -> Result<ScanJob, ScanError> {
        let job = ScanJob::from_request(request)?;
        self.store.create(&job).await?;

        let start_worker = {
            let mut state = self.state.lock().await;
            state.pending.push_back(job.id);
            !std::mem::replace(&mut state.busy, true)
        };

        info!(
            scan_id = %job.id,
            kind = %job.kind,
            target = %job.target,
            "Scan job queued"
        );

        if start_worker {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
        Ok(job)
    }

    /// Fail every job a previous process left `queued` or `running`.
    ///
    /// Those jobs lived only in that process's FIFO. Call once at startup,
    /// before anything is enqueued.
    pub async fn recover(&self) -> Result<usize, ScanError> {
        if self.is_busy().await {
            warn!("Scan queue already running, skipping recovery");
            return Ok(0);
        }

        let stale = self.store.list_unfinished().await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!(count = stale.len(), "Failing scan jobs interrupted by restart");
        for job in &stale {
            self.store.mark_failed(job.id, INTERRUPTED_BY_RESTART).await?;
            debug!(
                scan_id = %job.id,
                kind = %job.kind,
                target = %job.target,
                was = job.status.as_str(),
                "Scan job marked failed"
            );
        }
        Ok(stale.len())
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                if !state.busy && state.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Jobs waiting behind the running one.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// A job is running or about to.
    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.busy
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.pending.pop_front() {
                    Some(id) => id,
                    None => {
                        state.busy = false;
                        self.idle.notify_waiters();
                        debug!("Scan queue drained");
                        return;
                    }
                }
            };
            self.run_job(next).await;
        }
    }

    async fn run_job(&self, id: Uuid) {
        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(scan_id = %id, "Queued scan job vanished from store");
                return;
            }
            Err(e) => {
                warn!(scan_id = %id, error = %e, "Failed to load queued scan job");
                return;
            }
        };

        if let Err(e) = self.store.mark_running(id).await {
            warn!(scan_id = %id, error = %e, "Failed to mark scan running");
        }

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.executor.execute(&job))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ScanError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(outcome) => {
                info!(
                    scan_id = %id,
                    kind = %job.kind,
                    target = %job.target,
                    risk = outcome.risk_score,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Scan completed"
                );
                if let Err(e) = self
                    .store
                    .mark_completed(id, &outcome.raw_output, &outcome.summary, outcome.risk_score)
                    .await
                {
                    warn!(scan_id = %id, error = %e, "Failed to record scan result");
                }
                if self.config.follow_up_enabled {
                    self.follow_up(&job, &outcome).await;
                }
            }
            Err(e) => {
                warn!(
                    scan_id = %id,
                    kind = %job.kind,
                    target = %job.target,
                    error = %e,
                    "Scan failed"
                );
                if let Err(db) = self.store.mark_failed(id, &e.to_string()).await {
                    warn!(scan_id = %id, error = %db, "Failed to record scan failure");
                }
            }
        }
    }

    /// Queue a service probe on the ports a discovery scan found open.
    async fn follow_up(&self, job: &ScanJob, outcome: &ScanOutcome) {
        if !job.kind.is_discovery() || outcome.summary.open_ports.is_empty() {
            return;
        }

        let since = chrono::Duration::from_std(self.config.follow_up_window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match self
            .store
            .latest_of_kind(&job.target, ScanKind::ServiceProbe, since)
            .await
        {
            Ok(Some(previous)) => {
                debug!(
                    target = %job.target,
                    previous = %previous.id,
                    "Recent service probe exists, skipping follow-up"
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target = %job.target, error = %e, "Follow-up lookup failed");
                return;
            }
        }

        let ports: BTreeSet<u16> = outcome.summary.open_ports.iter().map(|p| p.port).collect();
        let mut request = ScanRequest::new(ScanKind::ServiceProbe, job.target.clone(), job.owner.clone())
            .with_ports(ports.into_iter().collect());
        request.parent_id = Some(job.id);

        match self.push(request).await {
            Ok(probe) => info!(
                scan_id = %probe.id,
                parent = %job.id,
                target = %job.target,
                "Follow-up service probe queued"
            ),
            Err(e) => warn!(target = %job.target, error = %e, "Failed to queue follow-up"),
        }
    }

    /// Persist and append without waking a worker. Only called from the
    /// running worker.
    async fn push(&self, request: ScanRequest) -> Result<ScanJob, ScanError> {
        let job = ScanJob::from_request(request)?;
        self.store.create(&job).await?;
        self.state.lock().await.pending.push_back(job.id);
        Ok(job)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
