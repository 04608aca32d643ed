//! Face verification session.
//!
//! A session samples frames until a face belonging to the target account is
//! recognised or the decision deadline passes, then keeps sampling for a
//! grace period so the outcome can be shown before the session closes:
//!
//! ```text
//! Sampling --match--> Granted --grace--> Closed(true)
//!    |  \--deadline--> Denied --grace--> Closed(false)
//!    \--cancel / frame failure / nothing enrolled--> Closed(false)
//! ```
//!
//! Cancellation is checked once per iteration and wins over a pending grant.
//! A frame failure after the decision only cuts the grace period short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use doorface_vision::{
    crop_template, FaceClassifier, FaceDetector, FrameSource, Label, Prediction,
};
use image::RgbImage;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::door::DoorController;
use crate::error::{DoorError, Result};
use crate::trainer::{ClassifierTrainer, LabelMap, Training};

/// Monotonic time source, shared by every session of a `DoorSystem`.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

pub trait CancelSignal {
    fn is_cancelled(&self) -> bool;
}

/// Shared "quit" flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CancelSignal for CancelToken {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Sampling,
    /// Access granted, holding for the grace period.
    Granted,
    /// Decision deadline passed, holding for the grace period.
    Denied,
    Closed(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Granted,
    Timeout,
    Cancelled,
    NoEnrolledIdentities,
    FrameSourceFailed,
    ActuatorFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub granted: bool,
    pub reason: CloseReason,
}

impl SessionOutcome {
    /// Whether access was granted, or `NoEnrolledIdentities` when the target
    /// had no face to compare against.
    pub fn into_result(self) -> Result<bool> {
        match self.reason {
            CloseReason::NoEnrolledIdentities => Err(DoorError::NoEnrolledIdentities),
            _ => Ok(self.granted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Classifier distance strictly below which a face matches.
    pub match_threshold: f64,
    pub decision_timeout: Duration,
    pub grace_period: Duration,
    /// Pause between iterations.
    pub frame_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            match_threshold: 70.0,
            decision_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            frame_interval: Duration::ZERO,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            match_threshold: cfg.match_threshold,
            decision_timeout: cfg.decision_timeout(),
            grace_period: cfg.grace_period(),
            frame_interval: cfg.frame_interval(),
        }
    }
}

/// Presentation hook; every method defaults to doing nothing.
pub trait SessionObserver {
    fn on_state(&mut self, _state: SessionState) {}

    fn on_frame(&mut self, _frame: &RgbImage, _state: SessionState) {}
}

pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Everything a session borrows for its lifetime.
pub struct SessionContext<'a> {
    pub camera: &'a mut dyn FrameSource,
    pub detector: &'a mut dyn FaceDetector,
    pub classifier: &'a mut dyn FaceClassifier,
    pub door: &'a DoorController,
    pub clock: &'a dyn Clock,
    pub cancel: &'a dyn CancelSignal,
    pub observer: &'a mut dyn SessionObserver,
}

pub struct VerificationSession<'a> {
    target: String,
    settings: SessionSettings,
    ctx: SessionContext<'a>,
    labels: Option<LabelMap>,
    target_labels: Vec<Label>,
    state: SessionState,
    started: Duration,
    decided_at: Option<Duration>,
    reason: Option<CloseReason>,
}

impl<'a> VerificationSession<'a> {
    /// Train a fresh classifier and enter `Sampling`, or close straight away
    /// when the target has no enrolled face.
    pub fn start(
        target: &str,
        trainer: &ClassifierTrainer,
        settings: SessionSettings,
        mut ctx: SessionContext<'a>,
    ) -> Result<Self> {
        let training = trainer.rebuild(&mut *ctx.classifier)?;
        let started = ctx.clock.now();

        let mut session = Self {
            target: target.to_string(),
            settings,
            ctx,
            labels: None,
            target_labels: Vec::new(),
            state: SessionState::Sampling,
            started,
            decided_at: None,
            reason: None,
        };

        match training {
            Training::Trained(map) => {
                session.target_labels = map.labels_for(target);
                session.labels = Some(map);
            }
            Training::Empty => {}
        }

        if session.target_labels.is_empty() {
            info!("no enrolled faces for {}", target);
            session.close(CloseReason::NoEnrolledIdentities, false);
        } else {
            info!(
                "verifying {} against {} enrolled face(s)",
                target,
                session.target_labels.len()
            );
            session.ctx.observer.on_state(SessionState::Sampling);
        }
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match (self.state, self.reason) {
            (SessionState::Closed(granted), Some(reason)) => Some(SessionOutcome { granted, reason }),
            _ => None,
        }
    }

    /// Drive the session until it closes.
    pub fn run(mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            self.step();
        }
    }

    /// One loop iteration: check for cancel, read a frame, advance the state.
    pub fn step(&mut self) -> SessionState {
        if let SessionState::Closed(_) = self.state {
            return self.state;
        }

        if self.ctx.cancel.is_cancelled() {
            info!("verification of {} cancelled", self.target);
            return self.close(CloseReason::Cancelled, false);
        }

        let frame = match self.ctx.camera.read() {
            Ok(frame) => frame,
            Err(e) => {
                error!("frame source failed: {:#}", e);
                if self.decided_at.is_some() {
                    return self.finish();
                }
                return self.close(CloseReason::FrameSourceFailed, false);
            }
        };

        if self.state == SessionState::Sampling {
            let matched = self.frame_matches(&frame);
            let now = self.ctx.clock.now();
            if matched {
                if let Err(e) = self.ctx.door.unlock() {
                    error!("{}", e);
                    return self.close(CloseReason::ActuatorFault, false);
                }
                self.decide(SessionState::Granted, now);
            } else if now.saturating_sub(self.started) >= self.settings.decision_timeout {
                info!("no matching face for {} before the deadline", self.target);
                self.decide(SessionState::Denied, now);
            }
        }

        self.ctx.observer.on_frame(&frame, self.state);

        if let Some(decided_at) = self.decided_at {
            let now = self.ctx.clock.now();
            if now.saturating_sub(decided_at) >= self.settings.grace_period {
                return self.finish();
            }
        }

        self.ctx.clock.sleep(self.settings.frame_interval);
        self.state
    }

    fn frame_matches(&mut self, frame: &RgbImage) -> bool {
        let regions = match self.ctx.detector.detect(frame) {
            Ok(regions) => regions,
            Err(e) => {
                warn!("face detection failed: {:#}", e);
                return false;
            }
        };

        for region in &regions {
            let Some(template) = crop_template(frame, region) else {
                continue;
            };
            let prediction = match self.ctx.classifier.predict(&template) {
                Ok(p) => p,
                Err(e) => {
                    warn!("face classification failed: {:#}", e);
                    continue;
                }
            };

            let owner = self.labels.as_ref().and_then(|m| m.owner(prediction.label));
            if is_match(&prediction, &self.target_labels, self.settings.match_threshold) {
                if let Some(owner) = owner {
                    let role = if owner.is_member() { "member" } else { "owner" };
                    info!(
                        "recognised {} {} (distance {:.1})",
                        role, owner, prediction.distance
                    );
                }
                return true;
            }
            debug!(
                "face closest to {:?} at distance {:.1}",
                owner.map(ToString::to_string),
                prediction.distance
            );
        }
        false
    }

    fn decide(&mut self, state: SessionState, now: Duration) {
        self.decided_at = Some(now);
        self.transition(state);
    }

    /// Close with the decision already taken.
    fn finish(&mut self) -> SessionState {
        match self.state {
            SessionState::Granted => self.close(CloseReason::Granted, true),
            _ => self.close(CloseReason::Timeout, false),
        }
    }

    fn close(&mut self, reason: CloseReason, granted: bool) -> SessionState {
        self.reason = Some(reason);
        self.labels = None;
        self.target_labels.clear();
        info!("session for {} closed: {:?}", self.target, reason);
        self.transition(SessionState::Closed(granted));
        self.state
    }

    fn transition(&mut self, state: SessionState) {
        debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
        self.ctx.observer.on_state(state);
    }
}

/// A face matches when it is classified as one of the target's labels
/// strictly closer than the threshold.
fn is_match(prediction: &Prediction, target_labels: &[Label], threshold: f64) -> bool {
    target_labels.contains(&prediction.label) && prediction.distance < threshold
}
