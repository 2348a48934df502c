//! Destination for record batches.

use std::future::Future;

use crate::batching::classify::BatchError;

/// A store that accepts batches of `R`.
///
/// A write either stores the whole batch or fails with the store's error;
/// partial writes are reported as failures.
pub trait BatchSink<R> {
    fn write(&mut self, records: &[R]) -> impl Future<Output = Result<(), BatchError>>;
}

/// Sink that keeps every written record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink<R> {
    pub stored: Vec<R>,
    pub writes: usize,
}

impl<R> MemorySink<R> {
    pub fn new() -> Self {
        Self {
            stored: Vec::new(),
            writes: 0,
        }
    }
}

impl<R: Clone> BatchSink<R> for MemorySink<R> {
    async fn write(&mut self, records: &[R]) -> Result<(), BatchError> {
        self.writes += 1;
        self.stored.extend_from_slice(records);
        Ok(())
    }
}
