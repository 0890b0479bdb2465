//! Frames and detections handed to the recorder by the ingestion layer.
//!
//! Frames arrive already decoded; the recorder never touches the transport
//! that produced them.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Frame rate used when the stream metadata cannot be trusted.
pub const DEFAULT_FPS: u32 = 25;

/// A single object detection attached to a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detector class id. Negative ids mark unclassified objects.
    pub class_id: i32,
    /// Confidence score (0.0 - 1.0)
    #[serde(default)]
    pub score: f32,
    /// Bounding box [x, y, width, height] in pixels
    #[serde(default)]
    pub bbox: [f32; 4],
}

impl Detection {
    /// Create a detection with only a class id.
    pub fn new(class_id: i32) -> Self {
        Self {
            class_id,
            score: 1.0,
            bbox: [0.0; 4],
        }
    }

    /// Whether the class id is usable for triggering and labeling.
    pub fn is_valid(&self) -> bool {
        self.class_id >= 0
    }
}

/// Stream frame rate as a rational number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Whole frames per second, or `None` when the denominator is zero.
    pub fn fps(&self) -> Option<u32> {
        if self.den == 0 {
            return None;
        }
        Some((self.num / self.den).max(1))
    }
}

/// A decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixels
    pub image: RgbImage,
    /// Rate reported by the upstream decoder, if any
    pub frame_rate: Option<FrameRate>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            frame_rate: None,
        }
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frames per second derived from the stream metadata.
    pub fn fps(&self) -> u32 {
        self.frame_rate
            .and_then(|rate| rate.fps())
            .unwrap_or(DEFAULT_FPS)
    }
}

/// One unit of work for a channel: a frame and the detections found on it.
#[derive(Debug, Clone)]
pub struct FrameInput {
    /// Channel identifier
    pub channel: i32,
    pub frame: Frame,
    /// Detections in detector output order
    pub detections: Vec<Detection>,
}

impl FrameInput {
    pub fn new(channel: i32, frame: Frame, detections: Vec<Detection>) -> Self {
        Self {
            channel,
            frame,
            detections,
        }
    }
}
