//! Test doubles shared by the unit tests in this crate.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use finrag_core::{HashEmbedder, HashEmbedderConfig};

use crate::embedding::{Embedder, EmbeddingError};

/// Hash-backed embedder that can be told to fail or misbehave on specific calls.
pub(crate) struct ScriptedEmbedder {
    inner: HashEmbedder,
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    calls: usize,
    batch_sizes: Vec<usize>,
    failures: HashMap<usize, EmbeddingError>,
    short: HashSet<usize>,
}

impl ScriptedEmbedder {
    pub(crate) fn new(dimensions: usize) -> Self {
        Self {
            inner: HashEmbedder::new(HashEmbedderConfig {
                dimensions,
                ..HashEmbedderConfig::default()
            }),
            state: Mutex::new(ScriptState::default()),
        }
    }

    pub(crate) fn quota_error() -> EmbeddingError {
        EmbeddingError::RateLimited {
            provider: "test",
            body: "RESOURCE_EXHAUSTED".into(),
        }
    }

    /// Makes the zero-based `call` fail with `err`.
    pub(crate) fn fail_call(&self, call: usize, err: EmbeddingError) {
        self.state.lock().failures.insert(call, err);
    }

    pub(crate) fn drop_vector_on_call(&self, call: usize) {
        self.state.lock().short.insert(call);
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub(crate) fn vector_for(&self, text: &str) -> Vec<f32> {
        self.inner.embed_text(text)
    }
}

impl Embedder for ScriptedEmbedder {
    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut state = self.state.lock();
        let call = state.calls;
        state.calls += 1;
        state.batch_sizes.push(inputs.len());
        if let Some(err) = state.failures.remove(&call) {
            return Err(err);
        }
        let mut vectors: Vec<Vec<f32>> = inputs.iter().map(|text| self.vector_for(text)).collect();
        if state.short.contains(&call) {
            vectors.pop();
        }
        Ok(vectors)
    }
}
