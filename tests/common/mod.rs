//! Shared sinks and configs for integration tests.

use upload_resilience::batching::BatchError;
use upload_resilience::config::UploadConfig;
use upload_resilience::pipeline::BatchSink;

/// Sink whose outcome for each write is decided by a closure.
///
/// The closure gets the batch and the zero-based write index.
pub struct ScriptedSink<F> {
    script: F,
    pub write_sizes: Vec<usize>,
    pub stored: Vec<u64>,
}

impl<F> ScriptedSink<F>
where
    F: FnMut(&[u64], usize) -> Result<(), BatchError>,
{
    pub fn new(script: F) -> Self {
        Self {
            script,
            write_sizes: Vec::new(),
            stored: Vec::new(),
        }
    }
}

impl<F> BatchSink<u64> for ScriptedSink<F>
where
    F: FnMut(&[u64], usize) -> Result<(), BatchError>,
{
    async fn write(&mut self, records: &[u64]) -> Result<(), BatchError> {
        let index = self.write_sizes.len();
        self.write_sizes.push(records.len());
        (self.script)(records, index)?;
        self.stored.extend_from_slice(records);
        Ok(())
    }
}

pub fn records(n: u64) -> Vec<u64> {
    (0..n).collect()
}

#[allow(dead_code)]
pub fn config_with(initial_batch_size: usize, strategy: Option<&str>) -> UploadConfig {
    let mut config = UploadConfig::default();
    config.batching.initial_batch_size = initial_batch_size;
    config.batching.strategy = strategy.map(String::from);
    config
}
