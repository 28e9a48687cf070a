//! Detection metadata records sent on the meta channel.

use serde::{Deserialize, Serialize};

/// One detected object, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
    pub label: String,
    /// Recognised plate or container number.
    pub number: String,
}

/// Message shape on `/ws/meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaMessage {
    Detections { detections: Vec<Detection> },
}

impl MetaMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Producer of detection batches, polled once per metadata cycle.
pub trait DetectionSource: Send {
    fn poll(&mut self) -> Vec<Detection>;
}

/// Returns the same fixed detections every cycle.
///
/// Stands in for the detector until a real one is wired up.
#[derive(Debug, Clone)]
pub struct StaticDetections {
    detections: Vec<Detection>,
}

impl StaticDetections {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

impl Default for StaticDetections {
    fn default() -> Self {
        Self::new(vec![Detection {
            x: 100,
            y: 100,
            width: 200,
            height: 100,
            confidence: 0.95,
            label: "truck".into(),
            number: "1234".into(),
        }])
    }
}

impl DetectionSource for StaticDetections {
    fn poll(&mut self) -> Vec<Detection> {
        self.detections.clone()
    }
}
