//! Face enrollment: wait for the operator to trigger a capture, then take
//! exactly one face from the next frame.

use doorface_vision::{crop_template, FaceDetector, FaceRegion, FrameSource};
use image::{GrayImage, RgbImage};
use log::{debug, warn};

use crate::error::{DoorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    Capture,
    Cancel,
}

/// External "capture now" / "cancel" signal used during enrollment.
pub trait CaptureTrigger: Send {
    /// Block until the operator decides.
    fn next_command(&mut self) -> CaptureCommand;

    /// Told why the last capture was refused before being asked again.
    fn rejected(&mut self, _reason: &DoorError) {}
}

/// Pick the single face of a frame as a template.
pub fn template_from_frame(frame: &RgbImage, regions: &[FaceRegion]) -> Result<GrayImage> {
    match regions {
        [] => Err(DoorError::NoFaceDetected),
        [region] => crop_template(frame, region).ok_or(DoorError::NoFaceDetected),
        many => Err(DoorError::AmbiguousCapture(many.len())),
    }
}

/// Run captures until one frame yields exactly one face or the operator
/// cancels. Frame source failure aborts enrollment.
pub fn capture_template(
    camera: &mut dyn FrameSource,
    detector: &mut dyn FaceDetector,
    trigger: &mut dyn CaptureTrigger,
) -> Result<GrayImage> {
    loop {
        if trigger.next_command() == CaptureCommand::Cancel {
            return Err(DoorError::CaptureCancelled);
        }

        let frame = camera.read().map_err(DoorError::FrameSource)?;
        let outcome = match detector.detect(&frame) {
            Ok(regions) => template_from_frame(&frame, &regions),
            Err(e) => {
                warn!("face detection failed: {:#}", e);
                Err(DoorError::NoFaceDetected)
            }
        };

        match outcome {
            Ok(template) => {
                debug!("captured {}x{} template", template.width(), template.height());
                return Ok(template);
            }
            Err(e) if e.is_retryable_capture() => {
                warn!("capture refused: {}", e);
                trigger.rejected(&e);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    pub struct ScriptedTrigger {
        pub commands: VecDeque<CaptureCommand>,
        pub rejections: Vec<String>,
    }

    impl ScriptedTrigger {
        pub fn new(commands: &[CaptureCommand]) -> Self {
            Self {
                commands: commands.iter().copied().collect(),
                rejections: Vec::new(),
            }
        }
    }

    impl CaptureTrigger for ScriptedTrigger {
        fn next_command(&mut self) -> CaptureCommand {
            self.commands.pop_front().unwrap_or(CaptureCommand::Cancel)
        }

        fn rejected(&mut self, reason: &DoorError) {
            self.rejections.push(reason.to_string());
        }
    }

    struct Frames;

    impl FrameSource for Frames {
        fn read(&mut self) -> anyhow::Result<RgbImage> {
            Ok(RgbImage::from_pixel(64, 64, image::Rgb([90, 90, 90])))
        }
    }

    /// Reports the given face counts, one entry per frame.
    struct Counts(VecDeque<usize>);

    impl FaceDetector for Counts {
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<FaceRegion>> {
            let n = self.0.pop_front().unwrap_or(0);
            Ok((0..n)
                .map(|i| FaceRegion {
                    x: i as f32 * 20.0,
                    y: 0.0,
                    width: 16.0,
                    height: 16.0,
                    score: 0.9,
                })
                .collect())
        }
    }

    #[test]
    fn reprompts_until_single_face() {
        use CaptureCommand::Capture;
        let mut trigger = ScriptedTrigger::new(&[Capture, Capture, Capture]);
        let mut detector = Counts(VecDeque::from([0, 2, 1]));

        let template = capture_template(&mut Frames, &mut detector, &mut trigger).unwrap();
        assert_eq!(template.dimensions(), (16, 16));
        assert_eq!(trigger.rejections.len(), 2);
        assert_eq!(trigger.rejections[0], DoorError::NoFaceDetected.to_string());
        assert_eq!(
            trigger.rejections[1],
            DoorError::AmbiguousCapture(2).to_string()
        );
    }

    #[test]
    fn cancel_aborts() {
        use CaptureCommand::{Cancel, Capture};
        let mut trigger = ScriptedTrigger::new(&[Capture, Cancel]);
        let mut detector = Counts(VecDeque::from([3]));

        let err = capture_template(&mut Frames, &mut detector, &mut trigger).unwrap_err();
        assert!(matches!(err, DoorError::CaptureCancelled));
    }

    #[test]
    fn frame_failure_aborts() {
        struct Broken;
        impl FrameSource for Broken {
            fn read(&mut self) -> anyhow::Result<RgbImage> {
                anyhow::bail!("unplugged")
            }
        }

        let mut trigger = ScriptedTrigger::new(&[CaptureCommand::Capture]);
        let err = capture_template(&mut Broken, &mut Counts(VecDeque::new()), &mut trigger)
            .unwrap_err();
        assert!(matches!(err, DoorError::FrameSource(_)));
    }
}
