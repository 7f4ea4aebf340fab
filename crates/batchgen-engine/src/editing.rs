use std::collections::VecDeque;

use batchgen_contracts::batches::{BatchId, EncodedImage, StoreError, Tier};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::generation::{GenerationError, GenerationRequest};
use crate::map_object;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("a prompt is required to refine an image")]
    EmptyPrompt,
}

/// Editor state for one result image, addressed by `(batch, tier, index)`.
///
/// Undo and redo hold prior image values only; they are dropped with the
/// session. Every change to the current image is written back to the store
/// first, so a failed write leaves the session untouched.
pub struct EditSession {
    ctx: EngineContext,
    batch_id: BatchId,
    tier: Tier,
    index: usize,
    current: EncodedImage,
    undo: VecDeque<EncodedImage>,
    redo: VecDeque<EncodedImage>,
    history_limit: usize,
}

impl EditSession {
    pub fn open(
        ctx: EngineContext,
        batch_id: BatchId,
        tier: Tier,
        index: usize,
    ) -> Result<Self, EditError> {
        let batch = ctx
            .store
            .get(&batch_id)
            .ok_or_else(|| StoreError::NotFound(batch_id.clone()))?;
        let results = batch.results(tier);
        let current = results
            .get(index)
            .cloned()
            .ok_or(StoreError::IndexOutOfRange {
                index,
                len: results.len(),
            })?;
        debug!(batch = %batch_id, %tier, index, "edit session opened");
        Ok(Self {
            ctx,
            batch_id,
            tier,
            index,
            current,
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        trim_front(&mut self.undo, self.history_limit);
        trim_front(&mut self.redo, self.history_limit);
        self
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &EncodedImage {
        &self.current
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    /// Refines the current image with `prompt` and writes the result back.
    pub fn regenerate(&mut self, prompt: &str) -> Result<&EncodedImage, EditError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EditError::EmptyPrompt);
        }
        let request = GenerationRequest::refine(self.current.clone(), prompt, self.tier);
        let image = match self.ctx.generator.generate(&request) {
            Ok(image) => image,
            Err(err) => {
                warn!(batch = %self.batch_id, tier = %self.tier, index = self.index, error = %err, "refinement failed");
                self.emit(
                    "edit_failed",
                    json!({ "kind": err.kind().as_str(), "error": err.to_string() }),
                );
                if matches!(err, GenerationError::ProKeyRequired(_)) {
                    self.ctx.request_entitlement("edit_regenerate");
                }
                return Err(err.into());
            }
        };

        self.write_back(&image)?;
        let previous = std::mem::replace(&mut self.current, image);
        push_bounded(&mut self.undo, previous, self.history_limit);
        self.redo.clear();
        self.emit(
            "edit_regenerated",
            json!({ "prompt": prompt, "undo_depth": self.undo.len() }),
        );
        Ok(&self.current)
    }

    /// Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool, EditError> {
        let Some(previous) = self.undo.back().cloned() else {
            return Ok(false);
        };
        self.write_back(&previous)?;
        self.undo.pop_back();
        let replaced = std::mem::replace(&mut self.current, previous);
        push_bounded(&mut self.redo, replaced, self.history_limit);
        self.emit("edit_undo", json!({ "undo_depth": self.undo.len() }));
        Ok(true)
    }

    /// Returns false when there is nothing to redo.
    pub fn redo(&mut self) -> Result<bool, EditError> {
        let Some(next) = self.redo.back().cloned() else {
            return Ok(false);
        };
        self.write_back(&next)?;
        self.redo.pop_back();
        let replaced = std::mem::replace(&mut self.current, next);
        push_bounded(&mut self.undo, replaced, self.history_limit);
        self.emit("edit_redo", json!({ "redo_depth": self.redo.len() }));
        Ok(true)
    }

    /// Writes `image` to this session's index, or to every index of the tier
    /// when `apply_to_all` is set. Returns how many slots were written.
    pub fn commit(&mut self, image: EncodedImage, apply_to_all: bool) -> Result<usize, EditError> {
        let (tier, index) = (self.tier, self.index);
        let mut written = 0usize;
        self.ctx.store.update(&self.batch_id, |batch| {
            let results = batch.results_mut(tier);
            if apply_to_all {
                for slot in results.iter_mut() {
                    *slot = image.clone();
                }
                written = results.len();
            } else {
                let len = results.len();
                let slot = results
                    .get_mut(index)
                    .ok_or(StoreError::IndexOutOfRange { index, len })?;
                *slot = image.clone();
                written = 1;
            }
            Ok::<(), StoreError>(())
        })?;
        self.current = image;
        self.emit(
            "edit_committed",
            json!({ "apply_to_all": apply_to_all, "written": written }),
        );
        Ok(written)
    }

    /// Ends the session, handing back the last current image.
    pub fn close(self) -> EncodedImage {
        debug!(batch = %self.batch_id, tier = %self.tier, index = self.index, "edit session closed");
        self.current
    }

    fn write_back(&self, image: &EncodedImage) -> Result<(), StoreError> {
        let (tier, index) = (self.tier, self.index);
        self.ctx.store.update(&self.batch_id, |batch| {
            let results = batch.results_mut(tier);
            let len = results.len();
            let slot = results
                .get_mut(index)
                .ok_or(StoreError::IndexOutOfRange { index, len })?;
            *slot = image.clone();
            Ok::<(), StoreError>(())
        })?;
        Ok(())
    }

    fn emit(&self, event_type: &str, extra: serde_json::Value) {
        let mut payload = map_object(json!({
            "batch_id": self.batch_id.as_str(),
            "tier": self.tier.as_str(),
            "index": self.index,
        }));
        payload.extend(map_object(extra));
        self.ctx.emit(event_type, payload);
    }
}

fn push_bounded(stack: &mut VecDeque<EncodedImage>, image: EncodedImage, limit: usize) {
    stack.push_back(image);
    trim_front(stack, limit);
}

fn trim_front(stack: &mut VecDeque<EncodedImage>, limit: usize) {
    while stack.len() > limit {
        stack.pop_front();
    }
}
