use thiserror::Error;

pub type Result<T> = std::result::Result<T, DoorError>;

#[derive(Debug, Error)]
pub enum DoorError {
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("face capture cancelled")]
    CaptureCancelled,
    #[error("more than one face visible ({0})")]
    AmbiguousCapture(usize),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no enrolled identities")]
    NoEnrolledIdentities,
    #[error("camera is in use by another session")]
    SessionBusy,
    #[error("frame source failed: {0:#}")]
    FrameSource(anyhow::Error),
    #[error("door actuator failed: {0}")]
    Actuator(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Vision(#[from] anyhow::Error),
}

impl DoorError {
    /// Errors that send enrollment back to the prompt instead of aborting it.
    pub fn is_retryable_capture(&self) -> bool {
        matches!(self, Self::AmbiguousCapture(_) | Self::NoFaceDetected)
    }
}
