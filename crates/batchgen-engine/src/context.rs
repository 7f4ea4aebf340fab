use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use batchgen_contracts::batches::BatchStore;
use batchgen_contracts::events::{EventPayload, EventWriter};
use tracing::warn;

use crate::entitlement::Entitlement;
use crate::generation::ImageGenerator;

pub const MIN_OUTPUTS_PER_BATCH: usize = 1;
pub const MAX_OUTPUTS_PER_BATCH: usize = 10;

pub fn clamp_outputs_per_batch(outputs: usize) -> usize {
    outputs.clamp(MIN_OUTPUTS_PER_BATCH, MAX_OUTPUTS_PER_BATCH)
}

/// Fleet-wide controls shared by every runner: the global stop flag and the
/// configured number of outputs per batch.
#[derive(Debug, Clone)]
pub struct RunControl {
    stop: Arc<AtomicBool>,
    outputs_per_batch: Arc<AtomicUsize>,
}

impl RunControl {
    pub fn new(outputs_per_batch: usize) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            outputs_per_batch: Arc::new(AtomicUsize::new(clamp_outputs_per_batch(
                outputs_per_batch,
            ))),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn outputs_per_batch(&self) -> usize {
        self.outputs_per_batch.load(Ordering::SeqCst)
    }

    /// Returns the value actually stored after clamping to 1..=10.
    pub fn set_outputs_per_batch(&self, outputs: usize) -> usize {
        let clamped = clamp_outputs_per_batch(outputs);
        self.outputs_per_batch.store(clamped, Ordering::SeqCst);
        clamped
    }
}

/// Handles threaded through the runner, fleet controller and editing sessions.
#[derive(Clone)]
pub struct EngineContext {
    pub store: BatchStore,
    pub generator: Arc<dyn ImageGenerator>,
    pub control: RunControl,
    pub events: EventWriter,
    pub entitlement: Option<Arc<dyn Entitlement>>,
}

impl EngineContext {
    pub fn new(
        store: BatchStore,
        generator: Arc<dyn ImageGenerator>,
        control: RunControl,
        events: EventWriter,
    ) -> Self {
        Self {
            store,
            generator,
            control,
            events,
            entitlement: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn with_entitlement(mut self, entitlement: Arc<dyn Entitlement>) -> Self {
        self.entitlement = Some(entitlement);
        self
    }

    /// Event log failures are reported but never interrupt a run.
    pub(crate) fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event = event_type, error = %err, "failed to write event");
        }
    }

    /// Asks the entitlement collaborator to connect a pro-capable key.
    pub(crate) fn request_entitlement(&self, source: &str) -> Option<bool> {
        let entitlement = self.entitlement.as_ref()?;
        let granted = entitlement.request_entitlement();
        self.emit(
            "entitlement_requested",
            crate::map_object(serde_json::json!({
                "source": source,
                "granted": granted,
            })),
        );
        Some(granted)
    }
}
