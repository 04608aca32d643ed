//! Camera, face detection and face classification backends for doorface.
//!
//! The core crate only talks to the traits declared here; the concrete
//! backends (`Camera`, `YunetDetector`, `LbphClassifier`) are wired up by the
//! binary.

pub mod detector;
pub mod face;
pub mod lbph;
pub mod model;
pub mod video;

use anyhow::Result;
use image::{GrayImage, RgbImage};

// Re-export commonly used types
pub use detector::YunetDetector;
pub use face::{crop_template, FaceRegion};
pub use lbph::LbphClassifier;
pub use video::Camera;

/// Integer stand-in for one enrolled identity slot within a training pass.
pub type Label = u32;

/// Result of classifying one face template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    /// Lower is more similar.
    pub distance: f64,
}

/// Capabilities move between threads with the session that owns them.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RgbImage>;
}

pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceRegion>>;
}

pub trait FaceClassifier: Send {
    /// Replace the model with one trained on exactly `samples`.
    fn train(&mut self, samples: &[(GrayImage, Label)]) -> Result<()>;

    fn predict(&self, template: &GrayImage) -> Result<Prediction>;
}
