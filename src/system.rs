//! Application context: owns the store, the door and the shared camera
//! pipeline, and exposes the operations the user interface calls.
//!
//! The `try_*` methods return typed errors. The plain-named methods collapse
//! them to a `bool` for callers that only need "did it work".

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use doorface_vision::{FaceClassifier, FaceDetector, FrameSource};
use log::warn;

use crate::capture::{self, CaptureTrigger};
use crate::door::DoorController;
use crate::error::{DoorError, Result};
use crate::session::{
    CancelSignal, CancelToken, Clock, NoopObserver, SessionContext, SessionObserver,
    SessionOutcome, SessionSettings, SystemClock, VerificationSession,
};
use crate::store::{IdentityStore, OwnerRef};
use crate::trainer::ClassifierTrainer;

/// Single-user hardware shared by enrollment and verification.
pub struct Devices {
    pub camera: Box<dyn FrameSource>,
    pub detector: Box<dyn FaceDetector>,
    pub classifier: Box<dyn FaceClassifier>,
    pub trigger: Box<dyn CaptureTrigger>,
}

pub struct DoorSystem {
    store: Arc<IdentityStore>,
    trainer: ClassifierTrainer,
    door: DoorController,
    devices: Mutex<Devices>,
    settings: SessionSettings,
    clock: Box<dyn Clock>,
    cancel: CancelToken,
}

fn report(op: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{} failed: {}", op, e);
            false
        }
    }
}

impl DoorSystem {
    pub fn new(
        store: Arc<IdentityStore>,
        door: DoorController,
        devices: Devices,
        settings: SessionSettings,
    ) -> Self {
        Self {
            trainer: ClassifierTrainer::new(store.clone()),
            store,
            door,
            devices: Mutex::new(devices),
            settings,
            clock: Box::new(SystemClock::default()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn door(&self) -> &DoorController {
        &self.door
    }

    /// Token that cancels the verification run by [`DoorSystem::verify_face`].
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// At most one session uses the camera at a time; a second caller is
    /// turned away rather than queued.
    fn claim_devices(&self) -> Result<MutexGuard<'_, Devices>> {
        match self.devices.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(DoorError::SessionBusy),
        }
    }

    /// Capture a face and make it the slot's only template.
    pub fn try_enroll(&self, slot: &OwnerRef) -> Result<()> {
        if !self.store.slot_exists(slot) {
            return Err(DoorError::NotFound(slot.to_string()));
        }
        let mut guard = self.claim_devices()?;
        let devices = &mut *guard;
        let template = capture::capture_template(
            &mut *devices.camera,
            &mut *devices.detector,
            &mut *devices.trigger,
        )?;
        drop(guard);
        self.store.store_template(slot, &template)
    }

    /// Create the account, then enroll the owner's face. If enrollment does
    /// not complete the account still exists but cannot pass verification
    /// until [`DoorSystem::update_face`] succeeds.
    pub fn try_create_account(
        &self,
        username: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<()> {
        self.store
            .create_account(username, password, first_name, last_name)?;
        self.try_enroll(&OwnerRef::owner(username))
    }

    pub fn create_account(
        &self,
        username: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> bool {
        report(
            "create account",
            self.try_create_account(username, password, first_name, last_name),
        )
    }

    pub fn login(&self, username: &str, password: &str) -> bool {
        self.store.login(username, password)
    }

    pub fn get_full_name(&self, username: &str) -> String {
        self.store.full_name(username)
    }

    /// Add a member and enroll their face. A member whose enrollment does not
    /// complete is removed again so the name stays available.
    pub fn try_add_member(&self, username: &str, member: &str) -> Result<()> {
        self.store.add_member(username, member)?;
        let enrolled = self.try_enroll(&OwnerRef::member(username, member));
        if enrolled.is_err() {
            if let Err(e) = self.store.remove_member(username, member) {
                warn!("could not roll back member {}/{}: {}", username, member, e);
            }
        }
        enrolled
    }

    pub fn add_member(&self, username: &str, member: &str) -> bool {
        report("add member", self.try_add_member(username, member))
    }

    pub fn remove_member(&self, username: &str, member: &str) -> bool {
        report("remove member", self.store.remove_member(username, member))
    }

    pub fn update_face(&self, username: &str) -> bool {
        report("update face", self.try_enroll(&OwnerRef::owner(username)))
    }

    pub fn delete_account(&self, username: &str) -> bool {
        report("delete account", self.store.delete_account(username))
    }

    /// Run one verification session for `username`.
    pub fn try_verify_face_with(
        &self,
        username: &str,
        cancel: &dyn CancelSignal,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionOutcome> {
        let guard = self.claim_devices()?;
        self.run_session(guard, username, cancel, observer)
    }

    /// Verification cancelled through [`DoorSystem::cancel_token`].
    pub fn try_verify_face(&self, username: &str) -> Result<bool> {
        let guard = self.claim_devices()?;
        self.cancel.reset();
        self.run_session(guard, username, &self.cancel, &mut NoopObserver)?
            .into_result()
    }

    fn run_session(
        &self,
        mut guard: MutexGuard<'_, Devices>,
        username: &str,
        cancel: &dyn CancelSignal,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionOutcome> {
        let devices = &mut *guard;
        let ctx = SessionContext {
            camera: &mut *devices.camera,
            detector: &mut *devices.detector,
            classifier: &mut *devices.classifier,
            door: &self.door,
            clock: &*self.clock,
            cancel,
            observer,
        };
        let session = VerificationSession::start(username, &self.trainer, self.settings, ctx)?;
        Ok(session.run())
    }

    pub fn verify_face(&self, username: &str) -> bool {
        match self.try_verify_face(username) {
            Ok(granted) => granted,
            Err(e) => {
                warn!("verification failed: {}", e);
                false
            }
        }
    }

    /// Manual override, independent of verification.
    pub fn unlock_door(&self) -> bool {
        report("unlock door", self.door.unlock().map(drop))
    }

    pub fn lock_door(&self) -> bool {
        report("lock door", self.door.lock().map(drop))
    }
}
