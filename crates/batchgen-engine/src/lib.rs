//! Batch image-generation core: runs, fleet control, result editing, import and export.

pub mod config;
pub mod context;
pub mod editing;
pub mod entitlement;
pub mod export;
pub mod fleet;
pub mod generation;
pub mod import;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use batchgen_contracts::batches::{Batch, BatchId, BatchStore, StoreError, Tier};
use batchgen_contracts::events::EventWriter;
use batchgen_contracts::runs::summary::{now_utc_iso, write_summary, SessionSummary};
use serde_json::{json, Map, Value};
use tracing::info;

pub use config::EngineConfig;
pub use context::{EngineContext, RunControl};
pub use editing::{EditError, EditSession};
pub use entitlement::{Entitlement, EnvEntitlement};
pub use export::{ExportReport, ExportedFile};
pub use fleet::{FleetController, FleetReport};
pub use generation::{
    default_generator_registry, GenerationError, GenerationRequest, GeneratorRegistry,
    ImageGenerator,
};
pub use runner::{BatchRunner, RunError, RunOutcome};

/// One working session over the batch store.
///
/// Clones share the store, stop flag, event log and fleet state, so a clone
/// can be handed to a worker thread while the original keeps taking commands.
#[derive(Clone)]
pub struct BatchEngine {
    session_dir: PathBuf,
    session_id: String,
    started_at: String,
    summary_path: PathBuf,
    ctx: EngineContext,
    runner: BatchRunner,
    fleet: FleetController,
}

impl BatchEngine {
    pub fn new(session_dir: impl Into<PathBuf>, ctx: EngineContext) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        let session_id = ctx.events.session_id().to_string();
        let summary_path = session_dir.join("summary.json");
        let runner = BatchRunner::new(ctx.clone());
        let fleet = FleetController::new(runner.clone());

        ctx.events.emit(
            "session_started",
            map_object(json!({
                "out_dir": session_dir.to_string_lossy().to_string(),
                "generator": ctx.generator.name(),
                "outputs_per_batch": ctx.control.outputs_per_batch(),
            })),
        )?;
        info!(session = %session_id, generator = ctx.generator.name(), "session started");

        Ok(Self {
            session_dir,
            session_id,
            started_at: now_utc_iso(),
            summary_path,
            ctx,
            runner,
            fleet,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn store(&self) -> &BatchStore {
        &self.ctx.store
    }

    pub fn control(&self) -> &RunControl {
        &self.ctx.control
    }

    pub fn event_writer(&self) -> EventWriter {
        self.ctx.events.clone()
    }

    pub fn fleet(&self) -> &FleetController {
        &self.fleet
    }

    /// Resolves a 1-based position, a batch id, or a case-insensitive name.
    pub fn find_batch(&self, key: &str) -> Option<BatchId> {
        let key = key.trim();
        let batches = self.ctx.store.batches();
        if let Ok(position) = key.parse::<usize>() {
            if position >= 1 {
                if let Some(batch) = batches.get(position - 1) {
                    return Some(batch.id.clone());
                }
            }
        }
        batches
            .iter()
            .find(|batch| batch.id.as_str() == key)
            .or_else(|| {
                batches
                    .iter()
                    .find(|batch| batch.name.eq_ignore_ascii_case(key))
            })
            .map(|batch| batch.id.clone())
    }

    pub fn import_folder(&self, root: &Path) -> Result<Vec<BatchId>> {
        let batches = import::load_folder(root)?;
        Ok(self.add_batches(batches))
    }

    pub fn add_batches(&self, batches: Vec<Batch>) -> Vec<BatchId> {
        let ids: Vec<BatchId> = batches.iter().map(|batch| batch.id.clone()).collect();
        let names: Vec<String> = batches.iter().map(|batch| batch.name.clone()).collect();
        let images: usize = batches.iter().map(|batch| batch.images.len()).sum();
        self.ctx.store.append(batches);
        info!(batches = ids.len(), images, "batches imported");
        self.ctx.emit(
            "batches_imported",
            map_object(json!({
                "batch_ids": ids.iter().map(BatchId::as_str).collect::<Vec<_>>(),
                "names": names,
                "images": images,
            })),
        );
        ids
    }

    pub fn remove_batch(&self, batch_id: &BatchId) -> Result<Batch, StoreError> {
        let removed = self.ctx.store.remove(batch_id)?;
        self.ctx.emit(
            "batch_removed",
            map_object(json!({
                "batch_id": batch_id.as_str(),
                "name": removed.name,
            })),
        );
        Ok(removed)
    }

    /// A blank prompt restores the built-in default.
    pub fn set_custom_prompt(
        &self,
        batch_id: &BatchId,
        prompt: Option<&str>,
    ) -> Result<Batch, StoreError> {
        let prompt = prompt
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        self.ctx.store.update(batch_id, |batch| {
            batch.custom_prompt = prompt;
            Ok::<(), StoreError>(())
        })
    }

    pub fn add_image(&self, batch_id: &BatchId, path: &Path) -> Result<Batch> {
        let image = import::reference_image_from_path(path)?;
        let batch = self
            .ctx
            .store
            .update(batch_id, |batch| batch.add_image(image))?;
        Ok(batch)
    }

    pub fn replace_image(&self, batch_id: &BatchId, index: usize, path: &Path) -> Result<Batch> {
        let image = import::reference_image_from_path(path)?;
        let batch = self
            .ctx
            .store
            .update(batch_id, |batch| batch.replace_image(index, image))?;
        Ok(batch)
    }

    pub fn remove_image(&self, batch_id: &BatchId, index: usize) -> Result<Batch, StoreError> {
        self.ctx
            .store
            .update(batch_id, |batch| batch.remove_image(index).map(|_| ()))
    }

    pub fn set_outputs_per_batch(&self, outputs: usize) -> usize {
        self.ctx.control.set_outputs_per_batch(outputs)
    }

    pub fn run_batch(&self, batch_id: &BatchId, tier: Tier) -> Result<RunOutcome, RunError> {
        self.runner.run(batch_id, tier)
    }

    pub fn stop_batch(&self, batch_id: &BatchId) -> Result<bool, StoreError> {
        self.runner.request_stop(batch_id)
    }

    pub fn run_all(&self, tier: Tier) -> Result<FleetReport, RunError> {
        self.fleet.run_all(tier)
    }

    pub fn emergency_stop(&self) -> Vec<BatchId> {
        self.fleet.emergency_stop()
    }

    pub fn resume(&self) {
        self.fleet.resume();
    }

    pub fn open_editor(
        &self,
        batch_id: &BatchId,
        tier: Tier,
        index: usize,
    ) -> Result<EditSession, EditError> {
        EditSession::open(self.ctx.clone(), batch_id.clone(), tier, index)
    }

    pub fn save_result(
        &self,
        batch_id: &BatchId,
        tier: Tier,
        index: usize,
        dir: &Path,
    ) -> Result<PathBuf> {
        let batch = self
            .ctx
            .store
            .get(batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.clone()))?;
        export::save_result(&batch, tier, index, dir)
    }

    pub fn export(&self, dir: &Path) -> Result<ExportReport> {
        let batches = self.ctx.store.batches();
        let report = export::write_export(&batches, dir)?;
        self.ctx.emit(
            "export_written",
            map_object(json!({
                "dir": dir.to_string_lossy().to_string(),
                "batches": report.batches,
                "files": report.files.len(),
                "skipped": report.skipped.len(),
            })),
        );
        Ok(report)
    }

    /// Writes `summary.json` for the current store contents.
    pub fn finish(&self) -> Result<PathBuf> {
        let batches = self.ctx.store.batches();
        let summary =
            SessionSummary::from_batches(self.session_id.clone(), self.started_at.clone(), &batches);
        let extra = map_object(json!({
            "generator": self.ctx.generator.name(),
            "outputs_per_batch": self.ctx.control.outputs_per_batch(),
        }));
        write_summary(&self.summary_path, &summary, Some(&extra))?;
        self.ctx.events.emit(
            "session_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(self.summary_path.clone())
    }
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
