use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use batchgen_contracts::batches::{BatchId, BatchStatus, Tier};
use serde_json::json;
use tracing::{info, warn};

use crate::map_object;
use crate::runner::{BatchRunner, RunError, RunOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub tier: Tier,
    pub runs: Vec<(BatchId, RunOutcome)>,
    /// Batches removed, or already running this tier, when their turn came.
    pub skipped: Vec<BatchId>,
    /// True when an emergency stop ended the sequence early.
    pub halted: bool,
}

impl FleetReport {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            runs: Vec::new(),
            skipped: Vec::new(),
            halted: false,
        }
    }

    pub fn completed(&self) -> usize {
        self.runs
            .iter()
            .filter(|(_, outcome)| matches!(outcome, RunOutcome::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.runs
            .iter()
            .filter(|(_, outcome)| matches!(outcome, RunOutcome::Failed { .. }))
            .count()
    }
}

/// Sequential run-all over the store plus the global emergency stop.
#[derive(Clone)]
pub struct FleetController {
    runner: BatchRunner,
    /// Token of the run-all loop that owns the fleet, 0 when idle.
    active_run: Arc<AtomicU64>,
    next_run: Arc<AtomicU64>,
}

impl FleetController {
    pub fn new(runner: BatchRunner) -> Self {
        Self {
            runner,
            active_run: Arc::new(AtomicU64::new(0)),
            next_run: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn runner(&self) -> &BatchRunner {
        &self.runner
    }

    pub fn is_running(&self) -> bool {
        self.active_run.load(Ordering::SeqCst) != 0
    }

    fn owns_fleet(&self, token: u64) -> bool {
        self.active_run.load(Ordering::SeqCst) == token
    }

    /// Runs every batch in store order, one at a time, for `tier`.
    ///
    /// The batch list is captured when the call starts. A failing batch does
    /// not end the sequence; only an emergency stop does. The global stop flag
    /// is not cleared here. A loop whose fleet was released by an emergency
    /// stop never starts another batch, even after `resume`.
    pub fn run_all(&self, tier: Tier) -> Result<FleetReport, RunError> {
        let token = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .active_run
            .compare_exchange(0, token, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::FleetBusy);
        }
        let _guard = RunningGuard {
            active_run: &self.active_run,
            token,
        };

        let ctx = self.runner.context();
        let ids = ctx.store.ids();
        info!(%tier, batches = ids.len(), "fleet run started");
        ctx.emit(
            "fleet_started",
            map_object(json!({
                "tier": tier.as_str(),
                "batches": ids.len(),
                "outputs": ctx.control.outputs_per_batch(),
            })),
        );

        let mut report = FleetReport::new(tier);
        for id in ids {
            if ctx.control.stop_requested() || !self.owns_fleet(token) {
                report.halted = true;
                break;
            }
            match ctx.store.get(&id) {
                Some(batch) if batch.is_tier_running(tier) => {
                    report.skipped.push(id);
                    continue;
                }
                None => {
                    report.skipped.push(id);
                    continue;
                }
                Some(_) => {}
            }
            match self.runner.run(&id, tier) {
                Ok(outcome) => report.runs.push((id, outcome)),
                Err(RunError::Store(err)) => {
                    warn!(batch = %id, error = %err, "fleet skipped batch");
                    report.skipped.push(id);
                }
                Err(RunError::AlreadyProcessing { batch, .. }) => report.skipped.push(batch),
                Err(RunError::FleetBusy) => return Err(RunError::FleetBusy),
            }
        }
        if !report.halted && (ctx.control.stop_requested() || !self.owns_fleet(token)) {
            report.halted = true;
        }

        let event = if report.halted {
            "fleet_halted"
        } else {
            "fleet_finished"
        };
        info!(
            %tier,
            runs = report.runs.len(),
            skipped = report.skipped.len(),
            halted = report.halted,
            "fleet run ended"
        );
        ctx.emit(
            event,
            map_object(json!({
                "tier": tier.as_str(),
                "runs": report.runs.len(),
                "completed": report.completed(),
                "failed": report.failed(),
                "skipped": report.skipped.len(),
            })),
        );
        Ok(report)
    }

    /// Sets the global stop flag, marks the fleet not running and flips every
    /// processing batch to stopping.
    ///
    /// Returns the ids that were flipped.
    pub fn emergency_stop(&self) -> Vec<BatchId> {
        let ctx = self.runner.context();
        ctx.control.request_stop();
        self.active_run.store(0, Ordering::SeqCst);
        let mut flipped = Vec::new();
        for batch in ctx.store.batches().iter() {
            if batch.status != BatchStatus::Processing {
                continue;
            }
            match self.runner.request_stop(&batch.id) {
                Ok(true) => flipped.push(batch.id.clone()),
                Ok(false) => {}
                // Removed between the snapshot and the flip.
                Err(_) => {}
            }
        }
        warn!(stopped = flipped.len(), "emergency stop requested");
        ctx.emit(
            "emergency_stop",
            map_object(json!({
                "stopped": flipped.iter().map(BatchId::as_str).collect::<Vec<_>>(),
            })),
        );
        flipped
    }

    /// Clears the global stop flag so new runs may start.
    pub fn resume(&self) {
        let ctx = self.runner.context();
        ctx.control.clear_stop();
        info!("global stop cleared");
        ctx.emit("fleet_resumed", Default::default());
    }
}

/// Releases the fleet on exit unless an emergency stop already handed it on.
struct RunningGuard<'a> {
    active_run: &'a AtomicU64,
    token: u64,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .active_run
            .compare_exchange(self.token, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}
