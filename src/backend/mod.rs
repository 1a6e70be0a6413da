//! Pluggable model backends used by the model worker.

mod registry;
mod result;
mod stub;

pub use registry::BackendRegistry;
pub use result::{AnalysisMessage, Detection, FrameInference};
pub use stub::StubBackend;

use anyhow::Result;

/// A model that turns a batch of stored frames into detections.
///
/// Frame references are whatever the frame sink returned; for the disk sink
/// they are file paths.
pub trait ModelBackend: Send {
    /// Backend identifier, used to select it from configuration.
    fn name(&self) -> &'static str;

    /// One result per input frame, in input order.
    fn infer(&mut self, frame_refs: &[&str]) -> Result<Vec<FrameInference>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Decode one batch message and run the registry's default backend over it.
pub fn analyze_batch(registry: &BackendRegistry, payload: &[u8]) -> Result<AnalysisMessage> {
    let batch = crate::publish::BatchMessage::decode(payload)?;
    let results = registry.infer(&batch.frame_paths())?;
    Ok(AnalysisMessage {
        model: batch.model,
        batch_id: batch.batch_id,
        results,
    })
}
