use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use batchgen_contracts::batches::{Batch, BatchStore, EncodedImage, ReferenceImage};
use batchgen_contracts::events::EventWriter;

use crate::context::{EngineContext, RunControl};
use crate::entitlement::Entitlement;
use crate::generation::{GenerationError, GenerationRequest, ImageGenerator};

type Hook = Arc<dyn Fn(usize) + Send + Sync>;

pub(crate) fn png(tag: &str) -> EncodedImage {
    EncodedImage::from_bytes("image/png", tag.as_bytes())
}

pub(crate) fn batch_with_images(name: &str, count: usize) -> Batch {
    let images = (0..count)
        .map(|idx| ReferenceImage::new(format!("{name}-{idx}.png"), None, png(&format!("{name}-{idx}"))))
        .collect();
    Batch::with_images(name, images)
}

pub(crate) fn test_context(generator: Arc<ScriptedGenerator>, outputs: usize) -> EngineContext {
    EngineContext::new(
        BatchStore::new(),
        generator,
        RunControl::new(outputs),
        EventWriter::disabled("test-session"),
    )
}

/// Generator that replays queued results, then falls back to numbered images.
///
/// The hook runs inside `generate` with the zero-based call index, before the
/// result is returned, so it stands in for whatever the user does while a
/// request is in flight.
pub(crate) struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<EncodedImage, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    hook: Mutex<Option<Hook>>,
    validate: bool,
}

impl ScriptedGenerator {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            hook: Mutex::new(None),
            validate: false,
        }
    }

    pub(crate) fn validating() -> Self {
        Self {
            validate: true,
            ..Self::new()
        }
    }

    pub(crate) fn push_ok(&self, image: EncodedImage) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(image));
        }
    }

    pub(crate) fn push_err(&self, err: GenerationError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(err));
        }
    }

    pub(crate) fn set_hook<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|rows| rows.clone()).unwrap_or_default()
    }
}

impl ImageGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<EncodedImage, GenerationError> {
        if self.validate {
            request.validate()?;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut rows) = self.requests.lock() {
            rows.push(request.clone());
        }
        let hook = self.hook.lock().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook(call);
        }
        let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
        scripted.unwrap_or_else(|| Ok(png(&format!("{}-{call}", request.tier))))
    }
}

pub(crate) struct RecordingEntitlement {
    grant: bool,
    requests: AtomicUsize,
}

impl RecordingEntitlement {
    pub(crate) fn new(grant: bool) -> Self {
        Self {
            grant,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Entitlement for RecordingEntitlement {
    fn has_entitlement(&self) -> bool {
        self.grant
    }

    fn request_entitlement(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }
}
