pub mod capture;
pub mod config;
pub mod door;
pub mod error;
pub mod password;
pub mod session;
pub mod store;
pub mod system;
pub mod trainer;

pub use error::{DoorError, Result};
pub use system::{Devices, DoorSystem};

// Re-export vision types for convenience
pub use doorface_vision::{
    Camera, FaceClassifier, FaceDetector, FaceRegion, FrameSource, Label, LbphClassifier,
    Prediction, YunetDetector,
};
