//! Publication sinks: where a run's results go

use std::sync::{Arc, Mutex, MutexGuard};

use crate::value::Value;

/// Receives every value a run publishes, and every error no handler caught
pub trait PublicationSink {
    fn on_publish(&mut self, value: Value);

    fn on_uncaught(&mut self, _error: &Value) {}
}

#[derive(Debug, Default)]
struct Collected {
    published: Vec<Value>,
    uncaught: Vec<Value>,
}

/// A sink that buffers everything it receives. Clones share the buffer, so
/// one clone can be handed to the engine and another kept for reading.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    inner: Arc<Mutex<Collected>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn published(&self) -> Vec<Value> {
        self.lock().published.clone()
    }

    pub fn uncaught(&self) -> Vec<Value> {
        self.lock().uncaught.clone()
    }

    /// Remove and return everything published so far
    pub fn take_published(&self) -> Vec<Value> {
        std::mem::take(&mut self.lock().published)
    }
}

impl PublicationSink for BufferSink {
    fn on_publish(&mut self, value: Value) {
        self.lock().published.push(value);
    }

    fn on_uncaught(&mut self, error: &Value) {
        self.lock().uncaught.push(error.clone());
    }
}

/// A sink backed by a closure; uncaught errors are ignored
pub struct FnSink<F>(pub F);

impl<F: FnMut(Value)> PublicationSink for FnSink<F> {
    fn on_publish(&mut self, value: Value) {
        (self.0)(value);
    }
}
