//! Fake devices for driving a `DoorSystem` without hardware.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use doorface::capture::{CaptureCommand, CaptureTrigger};
use doorface::door::{DoorController, Level, LockOutput};
use doorface::session::{CancelToken, Clock, SessionSettings};
use doorface::store::IdentityStore;
use doorface::{Devices, DoorSystem, FaceClassifier, FaceDetector, FaceRegion, FrameSource, Label, Prediction};
use image::{GrayImage, RgbImage};

/// Simulated time per camera read.
pub const FRAME_TIME: Duration = Duration::from_millis(250);

/// Shades stand in for faces: the scene shows a uniformly coloured face
/// and the classifier tells faces apart by brightness.
pub const ALICE: u8 = 40;
pub const BOB: u8 = 120;
pub const STRANGER: u8 = 250;
/// Nobody in front of the camera.
pub const EMPTY: u8 = 0;

#[derive(Clone, Default)]
pub struct SharedClock(Arc<Mutex<Duration>>);

impl SharedClock {
    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for SharedClock {
    fn now(&self) -> Duration {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Hold the camera on a given read until the test lets it go.
struct Pause {
    at: usize,
    reached: Sender<()>,
    resume: Receiver<()>,
}

#[derive(Default)]
struct SceneState {
    shade: u8,
    /// Cancel this token once `reads` reaches the given count.
    cancel_at: Option<(usize, CancelToken)>,
    /// Switch to this shade once `reads` reaches the given count.
    change_at: Option<(usize, u8)>,
    pause: Option<Pause>,
}

/// What the camera sees, changeable while the system owns the camera.
#[derive(Clone, Default)]
pub struct Scene {
    state: Arc<Mutex<SceneState>>,
    reads: Arc<AtomicUsize>,
}

impl Scene {
    pub fn show(&self, shade: u8) {
        self.state.lock().unwrap().shade = shade;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn change_at(&self, reads: usize, shade: u8) {
        self.state.lock().unwrap().change_at = Some((reads, shade));
    }

    pub fn cancel_at(&self, reads: usize, token: CancelToken) {
        self.state.lock().unwrap().cancel_at = Some((reads, token));
    }

    /// Block the camera on read number `reads`, after signalling `reached`,
    /// until something arrives on `resume`.
    pub fn pause_at(&self, reads: usize, reached: Sender<()>, resume: Receiver<()>) {
        self.state.lock().unwrap().pause = Some(Pause {
            at: reads,
            reached,
            resume,
        });
    }
}

struct FakeCamera {
    scene: Scene,
    clock: SharedClock,
}

impl FrameSource for FakeCamera {
    fn read(&mut self) -> anyhow::Result<RgbImage> {
        self.clock.advance(FRAME_TIME);
        let reads = self.scene.reads.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.scene.state.lock().unwrap();
        if let Some((at, shade)) = state.change_at {
            if reads >= at {
                state.shade = shade;
            }
        }
        if let Some((at, token)) = &state.cancel_at {
            if reads >= *at {
                token.cancel();
            }
        }
        let pause = if state.pause.as_ref().is_some_and(|p| p.at == reads) {
            state.pause.take()
        } else {
            None
        };
        let s = state.shade;
        drop(state);

        if let Some(pause) = pause {
            pause.reached.send(()).unwrap();
            pause.resume.recv().unwrap();
        }
        Ok(RgbImage::from_pixel(24, 24, image::Rgb([s, s, s])))
    }
}

struct FakeDetector;

impl FaceDetector for FakeDetector {
    fn detect(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<FaceRegion>> {
        if frame.get_pixel(0, 0)[0] == EMPTY {
            return Ok(vec![]);
        }
        Ok(vec![FaceRegion {
            x: 4.0,
            y: 4.0,
            width: 16.0,
            height: 16.0,
            score: 0.95,
        }])
    }
}

#[derive(Default)]
struct MeanShade(Vec<(f64, Label)>);

fn mean(img: &GrayImage) -> f64 {
    img.pixels().map(|p| p[0] as f64).sum::<f64>() / img.pixels().len().max(1) as f64
}

impl FaceClassifier for MeanShade {
    fn train(&mut self, samples: &[(GrayImage, Label)]) -> anyhow::Result<()> {
        self.0 = samples.iter().map(|(t, l)| (mean(t), *l)).collect();
        Ok(())
    }

    fn predict(&self, template: &GrayImage) -> anyhow::Result<Prediction> {
        let m = mean(template);
        self.0
            .iter()
            .map(|(s, l)| Prediction {
                label: *l,
                distance: (s - m).abs(),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .ok_or_else(|| anyhow::anyhow!("untrained"))
    }
}

/// Captures immediately unless a command has been queued.
#[derive(Clone, Default)]
pub struct Operator(Arc<Mutex<VecDeque<CaptureCommand>>>);

impl Operator {
    pub fn queue(&self, commands: &[CaptureCommand]) {
        self.0.lock().unwrap().extend(commands.iter().copied());
    }
}

impl CaptureTrigger for Operator {
    fn next_command(&mut self) -> CaptureCommand {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CaptureCommand::Capture)
    }
}

#[derive(Clone, Default)]
pub struct CountingOutput(Arc<Mutex<Vec<Level>>>);

impl CountingOutput {
    pub fn writes(&self) -> Vec<Level> {
        self.0.lock().unwrap().clone()
    }
}

impl LockOutput for CountingOutput {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        self.0.lock().unwrap().push(level);
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub system: DoorSystem,
    pub scene: Scene,
    pub clock: SharedClock,
    pub operator: Operator,
    pub output: CountingOutput,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(IdentityStore::open(dir.path().join("faces")).unwrap());
    let output = CountingOutput::default();
    let door = DoorController::new(Box::new(output.clone())).unwrap();

    let scene = Scene::default();
    let clock = SharedClock::default();
    let operator = Operator::default();
    let devices = Devices {
        camera: Box::new(FakeCamera {
            scene: scene.clone(),
            clock: clock.clone(),
        }),
        detector: Box::new(FakeDetector),
        classifier: Box::new(MeanShade::default()),
        trigger: Box::new(operator.clone()),
    };

    let system = DoorSystem::new(store, door, devices, SessionSettings::default())
        .with_clock(Box::new(clock.clone()));

    Harness {
        dir,
        system,
        scene,
        clock,
        operator,
        output,
    }
}
