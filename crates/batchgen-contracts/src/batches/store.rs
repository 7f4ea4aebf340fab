use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::{Batch, BatchId, MAX_REFERENCE_IMAGES};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    NotFound(BatchId),
    #[error("batch {batch} already holds the maximum of {limit} reference images")]
    TooManyImages { batch: BatchId, limit: usize },
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Immutable view of the store at one version.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub version: u64,
    pub batches: Arc<Vec<Batch>>,
}

impl StoreSnapshot {
    pub fn get(&self, id: &BatchId) -> Option<&Batch> {
        self.batches.iter().find(|batch| &batch.id == id)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    version: u64,
    batches: Arc<Vec<Batch>>,
}

/// Ordered, versioned collection of batches.
///
/// Every mutation builds a fresh vector and swaps it in under the lock, so a
/// reader holding a snapshot never observes a half-applied change. Clones
/// share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct BatchStore {
    inner: Arc<Mutex<StoreState>>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            version: state.version,
            batches: Arc::clone(&state.batches),
        }
    }

    pub fn batches(&self) -> Arc<Vec<Batch>> {
        Arc::clone(&self.lock().batches)
    }

    pub fn get(&self, id: &BatchId) -> Option<Batch> {
        self.lock()
            .batches
            .iter()
            .find(|batch| &batch.id == id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<BatchId> {
        self.lock()
            .batches
            .iter()
            .map(|batch| batch.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Appends batches in order; over-long image lists are truncated.
    pub fn append(&self, batches: Vec<Batch>) -> u64 {
        let mut state = self.lock();
        let mut next = state.batches.as_ref().clone();
        next.extend(batches.into_iter().map(|mut batch| {
            batch.images.truncate(MAX_REFERENCE_IMAGES);
            batch
        }));
        Self::commit(&mut state, next)
    }

    /// Replaces one batch with the result of `apply` run on a private copy.
    ///
    /// If `apply` fails, or the copy breaks the image limit, the store is left
    /// untouched.
    pub fn update<E, F>(&self, id: &BatchId, apply: F) -> Result<Batch, E>
    where
        F: FnOnce(&mut Batch) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut state = self.lock();
        let Some(position) = state.batches.iter().position(|batch| &batch.id == id) else {
            return Err(StoreError::NotFound(id.clone()).into());
        };
        let mut candidate = state.batches[position].clone();
        apply(&mut candidate)?;
        if candidate.images.len() > MAX_REFERENCE_IMAGES {
            return Err(StoreError::TooManyImages {
                batch: id.clone(),
                limit: MAX_REFERENCE_IMAGES,
            }
            .into());
        }
        candidate.id = id.clone();

        let mut next = Vec::with_capacity(state.batches.len());
        for (idx, batch) in state.batches.iter().enumerate() {
            if idx == position {
                next.push(candidate.clone());
            } else {
                next.push(batch.clone());
            }
        }
        Self::commit(&mut state, next);
        Ok(candidate)
    }

    pub fn remove(&self, id: &BatchId) -> Result<Batch, StoreError> {
        let mut state = self.lock();
        let Some(position) = state.batches.iter().position(|batch| &batch.id == id) else {
            return Err(StoreError::NotFound(id.clone()));
        };
        let mut next = state.batches.as_ref().clone();
        let removed = next.remove(position);
        Self::commit(&mut state, next);
        Ok(removed)
    }

    pub fn clear(&self) -> u64 {
        let mut state = self.lock();
        Self::commit(&mut state, Vec::new())
    }

    fn commit(state: &mut StoreState, next: Vec<Batch>) -> u64 {
        state.batches = Arc::new(next);
        state.version += 1;
        state.version
    }

    // The state is swapped whole, so a poisoned guard still holds a consistent value.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
