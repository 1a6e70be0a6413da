use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Class index.
    pub cls: u32,
    pub conf: f32,
    /// Pixel box as `[x1, y1, x2, y2]`.
    pub xyxy: [f32; 4],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameInference {
    pub image_path: String,
    pub detections: Vec<Detection>,
}

/// What the worker publishes to the analysis topic for one batch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisMessage {
    pub model: String,
    pub batch_id: String,
    pub results: Vec<FrameInference>,
}
