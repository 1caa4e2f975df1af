//! Background expiry sweep.
//!
//! The reaper cycles `Idle -> Scanning -> Deleting(n) -> Idle` on a fixed
//! interval. Each expired image goes through `ShareService::delete_image`,
//! the same path interactive deletes use. A failing item is logged and the
//! sweep moves on; a failing scan is logged and the reaper waits for the
//! next cycle. Only the shutdown token ends the loop.

use crate::services::share_service::{DeleteOutcome, ShareError, ShareService};
use chrono::Duration as ChronoDuration;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Passes over still-failing items within a single sweep.
const MAX_PASSES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaperState {
    Idle,
    Scanning,
    /// Working through this many expired images.
    Deleting(usize),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
    pub already_absent: usize,
    /// Items still failing after every pass.
    pub failed: usize,
    /// Items that failed once and succeeded on a later pass.
    pub recovered: usize,
    /// Shutdown was requested before every item was attempted.
    pub interrupted: bool,
}

pub struct ExpiryReaper {
    service: ShareService,
    interval: Duration,
    orphan_grace: Option<ChronoDuration>,
    state: watch::Sender<ReaperState>,
    trigger: Arc<Notify>,
}

impl ExpiryReaper {
    pub fn new(service: ShareService, interval: Duration) -> Self {
        let (state, _) = watch::channel(ReaperState::Idle);
        Self {
            service,
            interval,
            orphan_grace: None,
            state,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Also run a reconciliation pass after every sweep.
    pub fn with_reconciliation(mut self, grace: ChronoDuration) -> Self {
        self.orphan_grace = Some(grace);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ReaperState> {
        self.state.subscribe()
    }

    /// Handle that wakes the reaper for an immediate cycle.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// One expiry sweep. Errors only when the scan itself fails.
    ///
    /// `shutdown` is checked between items: the item in flight finishes,
    /// the rest are left for the next run.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> Result<SweepReport, ShareError> {
        self.state.send_replace(ReaperState::Scanning);
        let now = self.service.now();
        let expired = match self.service.metadata.list_expired(now).await {
            Ok(expired) => expired,
            Err(err) => {
                self.state.send_replace(ReaperState::Idle);
                return Err(err.into());
            }
        };

        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };
        self.state.send_replace(ReaperState::Deleting(expired.len()));

        let mut pending: VecDeque<_> = expired.iter().map(|r| r.unique_link_id).collect();
        'passes: for pass in 1..=MAX_PASSES {
            let mut failed = VecDeque::new();
            while let Some(id) = pending.pop_front() {
                if shutdown.is_cancelled() {
                    info!(remaining = pending.len() + 1, "shutdown requested, stopping sweep");
                    report.interrupted = true;
                    break 'passes;
                }
                match self.service.delete_image(id).await {
                    Ok(outcome) => {
                        match outcome {
                            DeleteOutcome::Deleted => report.deleted += 1,
                            DeleteOutcome::AlreadyAbsent => report.already_absent += 1,
                        }
                        if pass > 1 {
                            report.recovered += 1;
                        }
                    }
                    Err(err) => {
                        if pass < MAX_PASSES {
                            warn!(unique_link_id = %id, error = %err, pass, "failed to delete expired image, will retry");
                        } else {
                            error!(unique_link_id = %id, error = %err, "failed to delete expired image");
                        }
                        failed.push_back(id);
                    }
                }
            }
            pending = failed;
            if pending.is_empty() {
                break;
            }
        }
        if !report.interrupted {
            report.failed = pending.len();
        }

        self.state.send_replace(ReaperState::Idle);
        Ok(report)
    }

    async fn cycle(&self, shutdown: &CancellationToken) {
        debug!("expiry reaper running");
        match self.sweep(shutdown).await {
            Ok(report) if report.expired == 0 => debug!("no expired images found"),
            Ok(report) => info!(
                expired = report.expired,
                deleted = report.deleted,
                already_absent = report.already_absent,
                recovered = report.recovered,
                failed = report.failed,
                interrupted = report.interrupted,
                "expiry sweep finished"
            ),
            Err(err) => error!(error = %err, "expiry sweep failed"),
        }

        if let Some(grace) = self.orphan_grace {
            if shutdown.is_cancelled() {
                return;
            }
            match self.service.reconcile(grace).await {
                Ok(report) if report == Default::default() => {}
                Ok(report) => info!(
                    orphaned_blobs = report.orphaned_blobs_removed,
                    orphaned_rows = report.orphaned_rows_removed,
                    failures = report.failures,
                    "reconciliation finished"
                ),
                Err(err) => error!(error = %err, "reconciliation failed"),
            }
        }
    }

    /// Run until `shutdown` is cancelled. The first sweep starts immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "expiry reaper starting");
        while !shutdown.is_cancelled() {
            self.cycle(&shutdown).await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => debug!("manual sweep requested"),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        self.state.send_replace(ReaperState::Idle);
        info!("expiry reaper stopped");
    }
}
