use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::backend::{AudioOutput, OutputSink};
use crate::error::PlaybackError;

/// Output that keeps a wall-clock timeline but plays nothing
///
/// Used for headless runs (CI, server deployments without speakers).
pub struct NullOutput;

impl NullOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AudioOutput for NullOutput {
    async fn open(&mut self) -> Result<Box<dyn OutputSink>, PlaybackError> {
        info!("Null output opened: incoming speech will be discarded");
        Ok(Box::new(NullSink {
            opened_at: Instant::now(),
        }))
    }

    fn name(&self) -> &str {
        "null"
    }
}

struct NullSink {
    opened_at: Instant,
}

#[async_trait::async_trait]
impl OutputSink for NullSink {
    fn now(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, _id: u64, _samples: Arc<[f32]>, _start_at: f64) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn cancel(&mut self, _id: u64) {}

    async fn close(&mut self) {}
}
