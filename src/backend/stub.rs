use anyhow::{anyhow, Result};
use std::path::Path;

use super::{Detection, FrameInference, ModelBackend};

/// Placeholder model: checks each frame exists and reports one fixed box.
#[derive(Default)]
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModelBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame_refs: &[&str]) -> Result<Vec<FrameInference>> {
        frame_refs
            .iter()
            .map(|frame_ref| {
                let meta = std::fs::metadata(Path::new(frame_ref))
                    .map_err(|e| anyhow!("frame {} unreadable: {}", frame_ref, e))?;
                let detections = if meta.len() == 0 {
                    Vec::new()
                } else {
                    vec![Detection {
                        cls: 0,
                        conf: 0.99,
                        xyxy: [10.0, 10.0, 100.0, 100.0],
                    }]
                };
                Ok(FrameInference {
                    image_path: frame_ref.to_string(),
                    detections,
                })
            })
            .collect()
    }
}
