use batchgen_contracts::batches::{BatchFailure, BatchId, BatchStatus, EncodedImage, StoreError, Tier};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::generation::{GenerationError, GenerationRequest};
use crate::map_object;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("batch {batch} is already processing the {tier} tier")]
    AlreadyProcessing { batch: BatchId, tier: Tier },
    #[error("a run-all sequence is already in progress")]
    FleetBusy,
}

/// How one run ended. `Stopped` leaves the batch `completed` with partial results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { produced: usize },
    Stopped { produced: usize },
    Failed { failure: BatchFailure },
    Removed { produced: usize },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Stopped { .. } => "stopped",
            Self::Failed { .. } => "failed",
            Self::Removed { .. } => "removed",
        }
    }

    pub fn produced(&self) -> usize {
        match self {
            Self::Completed { produced } | Self::Stopped { produced } | Self::Removed { produced } => {
                *produced
            }
            Self::Failed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Batch,
    Global,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch_stop",
            Self::Global => "global_stop",
        }
    }
}

/// Drives the generation loop for one `(batch, tier)` pair.
#[derive(Clone)]
pub struct BatchRunner {
    ctx: EngineContext,
}

impl BatchRunner {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Runs up to `outputs_per_batch` sequential generation calls.
    ///
    /// The batch's live status and the global stop flag are checked before
    /// every call; an in-flight call is never interrupted. A generation
    /// failure restores the tier's pre-run results and marks the batch
    /// `error`. A request for a tier the batch is already running is
    /// rejected; the other tier may run alongside. Only the per-tier run flag
    /// guards that, since `status` and `processing_mode` are shared and the
    /// last writer wins.
    pub fn run(&self, batch_id: &BatchId, tier: Tier) -> Result<RunOutcome, RunError> {
        let outputs = self.ctx.control.outputs_per_batch();
        let mut previous: Vec<EncodedImage> = Vec::new();
        let started = self.ctx.store.update(batch_id, |batch| {
            if batch.is_tier_running(tier) {
                return Err(RunError::AlreadyProcessing {
                    batch: batch.id.clone(),
                    tier,
                });
            }
            previous = std::mem::take(batch.results_mut(tier));
            batch.set_tier_running(tier, true);
            batch.status = BatchStatus::Processing;
            batch.processing_mode = Some(tier);
            batch.error = None;
            Ok(())
        })?;

        info!(batch = %batch_id, name = %started.name, %tier, outputs, "batch run started");
        self.ctx.emit(
            "batch_run_started",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "name": started.name,
                "tier": tier.as_str(),
                "outputs": outputs,
                "images": started.images.len(),
            })),
        );

        let references = started.encoded_images();
        let prompt = started.custom_prompt.clone();
        let mut produced = 0usize;

        for iteration in 0..outputs {
            let Some(live) = self.ctx.store.get(batch_id) else {
                return Ok(self.finish_removed(batch_id, tier, produced));
            };
            if live.status == BatchStatus::Stopping {
                return self.finish_stopped(batch_id, tier, produced, StopReason::Batch);
            }
            if self.ctx.control.stop_requested() {
                return self.finish_stopped(batch_id, tier, produced, StopReason::Global);
            }

            debug!(batch = %batch_id, %tier, iteration, "requesting generation");
            let request = GenerationRequest::fresh(references.clone(), prompt.clone(), tier);
            let image = match self.ctx.generator.generate(&request) {
                Ok(image) => image,
                Err(err) => return self.finish_failed(batch_id, tier, previous, err),
            };

            let updated = match self.ctx.store.update(batch_id, |batch| {
                batch.results_mut(tier).push(image);
                Ok::<(), StoreError>(())
            }) {
                Ok(updated) => updated,
                Err(StoreError::NotFound(_)) => {
                    return Ok(self.finish_removed(batch_id, tier, produced));
                }
                Err(err) => {
                    self.release(batch_id, tier);
                    return Err(err.into());
                }
            };
            produced += 1;
            self.ctx.emit(
                "batch_result_added",
                map_object(json!({
                    "batch_id": batch_id.as_str(),
                    "tier": tier.as_str(),
                    "index": updated.results(tier).len().saturating_sub(1),
                    "produced": produced,
                })),
            );
        }

        self.finish_completed(batch_id, tier, produced)
    }

    /// Flips `processing` to `stopping`; any other state is left alone.
    pub fn request_stop(&self, batch_id: &BatchId) -> Result<bool, StoreError> {
        let Some(batch) = self.ctx.store.get(batch_id) else {
            return Err(StoreError::NotFound(batch_id.clone()));
        };
        if batch.status != BatchStatus::Processing {
            return Ok(false);
        }
        let mut flipped = false;
        self.ctx.store.update(batch_id, |batch| {
            if batch.status == BatchStatus::Processing {
                batch.status = BatchStatus::Stopping;
                flipped = true;
            }
            Ok::<(), StoreError>(())
        })?;
        if flipped {
            info!(batch = %batch_id, "batch stop requested");
        }
        Ok(flipped)
    }

    fn finish_completed(
        &self,
        batch_id: &BatchId,
        tier: Tier,
        produced: usize,
    ) -> Result<RunOutcome, RunError> {
        match self.mark_completed(batch_id, tier) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(self.finish_removed(batch_id, tier, produced)),
            Err(err) => return Err(err.into()),
        }
        info!(batch = %batch_id, %tier, produced, "batch run completed");
        self.ctx.emit(
            "batch_run_completed",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "tier": tier.as_str(),
                "produced": produced,
            })),
        );
        Ok(RunOutcome::Completed { produced })
    }

    fn finish_stopped(
        &self,
        batch_id: &BatchId,
        tier: Tier,
        produced: usize,
        reason: StopReason,
    ) -> Result<RunOutcome, RunError> {
        match self.mark_completed(batch_id, tier) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(self.finish_removed(batch_id, tier, produced)),
            Err(err) => return Err(err.into()),
        }
        info!(batch = %batch_id, %tier, produced, reason = reason.as_str(), "batch run stopped");
        self.ctx.emit(
            "batch_run_stopped",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "tier": tier.as_str(),
                "produced": produced,
                "reason": reason.as_str(),
            })),
        );
        Ok(RunOutcome::Stopped { produced })
    }

    fn finish_failed(
        &self,
        batch_id: &BatchId,
        tier: Tier,
        previous: Vec<EncodedImage>,
        err: GenerationError,
    ) -> Result<RunOutcome, RunError> {
        let failure = err.to_failure();
        let rollback = self.ctx.store.update(batch_id, |batch| {
            *batch.results_mut(tier) = previous;
            batch.set_tier_running(tier, false);
            batch.status = BatchStatus::Error;
            batch.processing_mode = None;
            batch.error = Some(failure.clone());
            Ok::<(), StoreError>(())
        });
        match rollback {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => return Ok(self.finish_removed(batch_id, tier, 0)),
            Err(err) => return Err(err.into()),
        }

        warn!(batch = %batch_id, %tier, kind = failure.kind.as_str(), error = %failure.message, "batch run failed");
        self.ctx.emit(
            "batch_run_failed",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "tier": tier.as_str(),
                "kind": failure.kind.as_str(),
                "error": failure.message,
            })),
        );
        if failure.needs_entitlement() {
            self.ctx.request_entitlement("batch_run");
        }
        Ok(RunOutcome::Failed { failure })
    }

    fn finish_removed(&self, batch_id: &BatchId, tier: Tier, produced: usize) -> RunOutcome {
        info!(batch = %batch_id, %tier, "batch removed during run");
        self.ctx.emit(
            "batch_run_stopped",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "tier": tier.as_str(),
                "produced": produced,
                "reason": "removed",
            })),
        );
        RunOutcome::Removed { produced }
    }

    fn mark_completed(&self, batch_id: &BatchId, tier: Tier) -> Result<(), StoreError> {
        self.ctx.store.update(batch_id, |batch| {
            batch.set_tier_running(tier, false);
            batch.status = BatchStatus::Completed;
            batch.processing_mode = None;
            Ok::<(), StoreError>(())
        })?;
        Ok(())
    }

    fn release(&self, batch_id: &BatchId, tier: Tier) {
        let released = self.ctx.store.update(batch_id, |batch| {
            batch.set_tier_running(tier, false);
            Ok::<(), StoreError>(())
        });
        if let Err(err) = released {
            debug!(batch = %batch_id, %tier, error = %err, "could not release tier run flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use batchgen_contracts::batches::{BatchStatus, FailureKind, StoreError, Tier};
    use batchgen_contracts::events::{read_event_types, EventWriter};

    use super::{BatchRunner, RunError, RunOutcome};
    use crate::generation::GenerationError;
    use crate::testing::{batch_with_images, png, test_context, RecordingEntitlement, ScriptedGenerator};

    #[test]
    fn run_fills_only_the_requested_tier() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 3);
        let mut batch = batch_with_images("Cats", 2);
        batch.results_pro = vec![png("old-pro")];
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;

        assert_eq!(outcome, RunOutcome::Completed { produced: 3 });
        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.processing_mode, None);
        assert_eq!(batch.results_normal.len(), 3);
        assert_eq!(batch.results_pro, vec![png("old-pro")]);
        assert_eq!(generator.calls(), 3);
        assert!(generator
            .requests()
            .iter()
            .all(|request| request.tier == Tier::Normal && request.reference_images.len() == 2));
        Ok(())
    }

    #[test]
    fn failure_rolls_back_tier_results() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_ok(png("new-1"));
        generator.push_err(GenerationError::GenerationFailed("quota exceeded".to_string()));
        let ctx = test_context(generator.clone(), 4);
        let mut batch = batch_with_images("Cats", 1);
        batch.results_normal = vec![png("old-1"), png("old-2")];
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;

        let RunOutcome::Failed { failure } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.kind, FailureKind::GenerationFailed);
        assert_eq!(failure.message, "quota exceeded");
        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.results_normal, vec![png("old-1"), png("old-2")]);
        assert!(!batch.is_tier_running(Tier::Normal));
        assert_eq!(batch.error.map(|e| e.message).as_deref(), Some("quota exceeded"));
        assert_eq!(generator.calls(), 2);
        Ok(())
    }

    #[test]
    fn batch_stop_yields_partial_completed_run() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 4);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        let runner = BatchRunner::new(ctx.clone());

        let stopper = runner.clone();
        let target = id.clone();
        generator.set_hook(move |call| {
            if call == 1 {
                assert_eq!(stopper.request_stop(&target), Ok(true));
            }
        });

        let outcome = runner.run(&id, Tier::Pro)?;

        assert_eq!(outcome, RunOutcome::Stopped { produced: 2 });
        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.results_pro.len(), 2);
        assert!(!batch.is_tier_running(Tier::Pro));
        assert!(batch.error.is_none());
        assert_eq!(generator.calls(), 2);
        Ok(())
    }

    #[test]
    fn global_stop_before_first_call_yields_empty_completed_run() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 2);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        ctx.control.request_stop();

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;

        assert_eq!(outcome, RunOutcome::Stopped { produced: 0 });
        assert_eq!(generator.calls(), 0);
        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.status, BatchStatus::Completed);
        Ok(())
    }

    #[test]
    fn pro_key_failure_requests_entitlement() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_err(GenerationError::from_upstream(
            "Gemini request failed (404): Requested entity was not found.",
        ));
        let entitlement = Arc::new(RecordingEntitlement::new(false));
        let ctx = test_context(generator, 2)
            .with_events(EventWriter::new(&events_path, "test-session"))
            .with_entitlement(entitlement.clone());
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Pro)?;

        let RunOutcome::Failed { failure } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.needs_entitlement());
        assert_eq!(entitlement.requests(), 1);
        let batch = ctx.store.get(&id).ok_or_else(|| anyhow::anyhow!("batch missing"))?;
        assert_eq!(batch.error.map(|e| e.kind), Some(FailureKind::ProKeyRequired));
        let types = read_event_types(&events_path)?;
        assert_eq!(
            types,
            vec!["batch_run_started", "batch_run_failed", "entitlement_requested"]
        );
        Ok(())
    }

    #[test]
    fn same_tier_rerun_is_rejected_while_processing() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 2);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        let runner = BatchRunner::new(ctx.clone());

        let nested = runner.clone();
        let target = id.clone();
        let seen: Arc<Mutex<Option<Result<RunOutcome, RunError>>>> = Arc::new(Mutex::new(None));
        let seen_in_hook = seen.clone();
        generator.set_hook(move |call| {
            if call == 0 {
                let result = nested.run(&target, Tier::Normal);
                if let Ok(mut slot) = seen_in_hook.lock() {
                    *slot = Some(result);
                }
            }
        });

        let outcome = runner.run(&id, Tier::Normal)?;

        assert_eq!(outcome, RunOutcome::Completed { produced: 2 });
        let nested_result = seen.lock().ok().and_then(|mut slot| slot.take());
        assert!(matches!(
            nested_result,
            Some(Err(RunError::AlreadyProcessing { tier: Tier::Normal, .. }))
        ));
        Ok(())
    }

    // Both tiers may run on one batch at once: results never mix, but status
    // and processing_mode are last-write-wins.
    #[test]
    fn concurrent_tiers_write_disjoint_sequences() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 2);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        let runner = BatchRunner::new(ctx.clone());

        let nested = runner.clone();
        let target = id.clone();
        let watcher = ctx.store.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_in_hook = observed.clone();
        generator.set_hook(move |call| {
            if call == 0 {
                let result = nested.run(&target, Tier::Normal);
                let status = watcher.get(&target).map(|batch| (batch.status, batch.processing_mode));
                if let Ok(mut rows) = observed_in_hook.lock() {
                    rows.push((result, status));
                }
            }
        });

        let outcome = runner.run(&id, Tier::Pro)?;

        assert_eq!(outcome, RunOutcome::Completed { produced: 2 });
        let rows = observed.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, Ok(RunOutcome::Completed { produced: 2 }));
        // The nested normal run finished while pro was still in flight and
        // overwrote the shared status.
        assert_eq!(rows[0].1, Some((BatchStatus::Completed, None)));

        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.results_normal.len(), 2);
        assert_eq!(batch.results_pro.len(), 2);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.running_tiers, [false, false]);
        assert_eq!(generator.calls(), 4);
        Ok(())
    }

    // The other tier finishing clears the shared processing_mode; the tier
    // still in flight must keep rejecting reruns.
    #[test]
    fn same_tier_stays_guarded_after_other_tier_finishes() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 2);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        let runner = BatchRunner::new(ctx.clone());

        let nested = runner.clone();
        let target = id.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_hook = seen.clone();
        generator.set_hook(move |call| {
            if call == 0 {
                let pro = nested.run(&target, Tier::Pro);
                let normal = nested.run(&target, Tier::Normal);
                if let Ok(mut rows) = seen_in_hook.lock() {
                    rows.push(pro);
                    rows.push(normal);
                }
            }
        });

        let outcome = runner.run(&id, Tier::Normal)?;

        assert_eq!(outcome, RunOutcome::Completed { produced: 2 });
        let rows = seen.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Ok(RunOutcome::Completed { produced: 2 }));
        assert!(matches!(
            rows[1],
            Err(RunError::AlreadyProcessing { tier: Tier::Normal, .. })
        ));

        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.results_normal.len(), 2);
        assert_eq!(batch.results_pro.len(), 2);
        assert_eq!(batch.running_tiers, [false, false]);
        assert_eq!(generator.calls(), 4);
        Ok(())
    }

    #[test]
    fn edits_made_mid_run_are_preserved() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 3);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let store = ctx.store.clone();
        let target = id.clone();
        generator.set_hook(move |call| {
            if call == 1 {
                let _ = store.update(&target, |batch| {
                    batch.results_normal[0] = png("user-edit");
                    Ok::<(), StoreError>(())
                });
            }
        });

        BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;

        let batch = ctx.store.get(&id).ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(batch.results_normal.len(), 3);
        assert_eq!(batch.results_normal[0], png("user-edit"));
        Ok(())
    }

    #[test]
    fn removal_mid_run_ends_quietly() -> Result<(), RunError> {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = test_context(generator.clone(), 3);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let store = ctx.store.clone();
        let target = id.clone();
        generator.set_hook(move |call| {
            if call == 0 {
                let _ = store.remove(&target);
            }
        });

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;
        assert_eq!(outcome, RunOutcome::Removed { produced: 0 });
        assert!(ctx.store.is_empty());
        assert_eq!(generator.calls(), 1);
        Ok(())
    }

    #[test]
    fn request_stop_only_applies_while_processing() {
        let ctx = test_context(Arc::new(ScriptedGenerator::new()), 1);
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);
        let runner = BatchRunner::new(ctx.clone());

        assert_eq!(runner.request_stop(&id), Ok(false));
        assert_eq!(ctx.store.get(&id).map(|b| b.status), Some(BatchStatus::Idle));
        assert!(matches!(
            runner.request_stop(&"missing".into()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn run_events_follow_lifecycle_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let ctx = test_context(Arc::new(ScriptedGenerator::new()), 2)
            .with_events(EventWriter::new(&events_path, "test-session"));
        let batch = batch_with_images("Cats", 1);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        BatchRunner::new(ctx).run(&id, Tier::Normal)?;

        assert_eq!(
            read_event_types(&events_path)?,
            vec![
                "batch_run_started",
                "batch_result_added",
                "batch_result_added",
                "batch_run_completed"
            ]
        );
        Ok(())
    }

    #[test]
    fn batch_without_images_fails_validation() -> Result<(), RunError> {
        let ctx = test_context(Arc::new(ScriptedGenerator::validating()), 2);
        let batch = batch_with_images("Empty", 0);
        let id = batch.id.clone();
        ctx.store.append(vec![batch]);

        let outcome = BatchRunner::new(ctx.clone()).run(&id, Tier::Normal)?;
        assert_eq!(outcome.label(), "failed");
        assert_eq!(ctx.store.get(&id).map(|b| b.status), Some(BatchStatus::Error));
        Ok(())
    }
}
