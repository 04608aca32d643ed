//! Durable accounts, members and face templates.
//!
//! Layout under the store root, one directory per account:
//!
//! ```text
//! <username>/
//!   password.txt        hex digest of the account password
//!   info.txt            "<first> <last>"
//!   face.jpg            the account owner's template
//!   members/<name>/
//!     face.jpg          a member's template
//! ```
//!
//! Every mutation that can change the set of templates holds the write side
//! of `templates`; [`IdentityStore::templates`] holds the read side while it
//! enumerates, so a training pass never sees a half-written account.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use image::{GrayImage, ImageFormat};
use log::{debug, info, warn};

use crate::error::{DoorError, Result};
use crate::password;

const PASSWORD_FILE: &str = "password.txt";
const INFO_FILE: &str = "info.txt";
const FACE_FILE: &str = "face.jpg";
const MEMBERS_DIR: &str = "members";
const TOMBSTONE_PREFIX: &str = ".deleted-";

/// Identity slot a template belongs to: an account owner or one of its members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub account: String,
    pub member: Option<String>,
}

impl OwnerRef {
    pub fn owner(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            member: None,
        }
    }

    pub fn member(account: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            member: Some(member.into()),
        }
    }

    pub fn is_member(&self) -> bool {
        self.member.is_some()
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.member {
            Some(m) => write!(f, "{}/{}", self.account, m),
            None => f.write_str(&self.account),
        }
    }
}

pub struct IdentityStore {
    root: PathBuf,
    templates: RwLock<()>,
    revision: AtomicU64,
}

/// Reject names that are empty, hidden, or would escape their directory.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.trim() != name
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(DoorError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl IdentityStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        // Finish deletions interrupted by a crash.
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TOMBSTONE_PREFIX) {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!("could not remove {}: {}", entry.path().display(), e);
                }
            }
        }

        debug!("identity store at {}", root.display());
        Ok(Self {
            root,
            templates: RwLock::new(()),
            revision: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Counter bumped on every change to the set of templates.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.templates.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.templates.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    fn slot_dir(&self, slot: &OwnerRef) -> PathBuf {
        let dir = self.account_dir(&slot.account);
        match &slot.member {
            Some(m) => dir.join(MEMBERS_DIR).join(m),
            None => dir,
        }
    }

    fn validate_slot(slot: &OwnerRef) -> Result<()> {
        validate_name(&slot.account)?;
        if let Some(m) = &slot.member {
            validate_name(m)?;
        }
        Ok(())
    }

    pub fn account_exists(&self, username: &str) -> bool {
        validate_name(username).is_ok() && self.account_dir(username).is_dir()
    }

    pub fn slot_exists(&self, slot: &OwnerRef) -> bool {
        Self::validate_slot(slot).is_ok() && self.slot_dir(slot).is_dir()
    }

    pub fn has_template(&self, slot: &OwnerRef) -> bool {
        Self::validate_slot(slot).is_ok() && self.slot_dir(slot).join(FACE_FILE).is_file()
    }

    /// Persist the credential and display name of a new account. The account
    /// has no template yet and cannot pass face verification until one is
    /// stored.
    pub fn create_account(
        &self,
        username: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<()> {
        validate_name(username)?;
        let _guard = self.write_lock();

        let dir = self.account_dir(username);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DoorError::DuplicateIdentity(username.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let written = fs::write(dir.join(PASSWORD_FILE), password::hash_password(password))
            .and_then(|_| fs::write(dir.join(INFO_FILE), format!("{first_name} {last_name}")));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&dir);
            return Err(e.into());
        }

        info!("created account {}", username);
        Ok(())
    }

    /// Fails closed: unknown accounts, unreadable digests and bad input all
    /// yield `false`.
    pub fn login(&self, username: &str, password: &str) -> bool {
        if validate_name(username).is_err() {
            return false;
        }
        match fs::read_to_string(self.account_dir(username).join(PASSWORD_FILE)) {
            Ok(stored) => password::verify_password(password, &stored),
            Err(e) => {
                debug!("login for {}: {}", username, e);
                false
            }
        }
    }

    /// Display name on record, or the username itself.
    pub fn full_name(&self, username: &str) -> String {
        if validate_name(username).is_err() {
            return username.to_string();
        }
        match fs::read_to_string(self.account_dir(username).join(INFO_FILE)) {
            Ok(name) if !name.trim().is_empty() => name,
            _ => username.to_string(),
        }
    }

    pub fn add_member(&self, username: &str, member: &str) -> Result<()> {
        validate_name(username)?;
        validate_name(member)?;
        let _guard = self.write_lock();

        if !self.account_exists(username) {
            return Err(DoorError::NotFound(username.to_string()));
        }
        let members = self.account_dir(username).join(MEMBERS_DIR);
        fs::create_dir_all(&members)?;
        match fs::create_dir(members.join(member)) {
            Ok(()) => {
                info!("added member {} to {}", member, username);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(DoorError::DuplicateIdentity(
                OwnerRef::member(username, member).to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_member(&self, username: &str, member: &str) -> Result<()> {
        let slot = OwnerRef::member(username, member);
        Self::validate_slot(&slot)?;
        let _guard = self.write_lock();

        let dir = self.slot_dir(&slot);
        if !dir.is_dir() {
            return Err(DoorError::NotFound(slot.to_string()));
        }
        self.remove_tree(&dir, &slot.to_string())?;
        self.bump();
        info!("removed member {}", slot);
        Ok(())
    }

    /// Member names of an account, sorted.
    pub fn members(&self, username: &str) -> Result<Vec<String>> {
        validate_name(username)?;
        if !self.account_exists(username) {
            return Err(DoorError::NotFound(username.to_string()));
        }
        list_dirs(&self.account_dir(username).join(MEMBERS_DIR))
    }

    /// All account usernames, sorted.
    pub fn accounts(&self) -> Result<Vec<String>> {
        list_dirs(&self.root)
    }

    /// Replace the template of an existing slot.
    pub fn store_template(&self, slot: &OwnerRef, template: &GrayImage) -> Result<()> {
        Self::validate_slot(slot)?;
        let _guard = self.write_lock();

        let dir = self.slot_dir(slot);
        if !dir.is_dir() {
            return Err(DoorError::NotFound(slot.to_string()));
        }
        let tmp = dir.join(".face.jpg.tmp");
        template.save_with_format(&tmp, ImageFormat::Jpeg)?;
        fs::rename(&tmp, dir.join(FACE_FILE))?;
        self.bump();

        info!("stored face template for {}", slot);
        Ok(())
    }

    /// Remove the account, its members and every template. Callers observe
    /// either the whole account or none of it.
    pub fn delete_account(&self, username: &str) -> Result<()> {
        validate_name(username)?;
        let _guard = self.write_lock();

        let dir = self.account_dir(username);
        if !dir.is_dir() {
            return Err(DoorError::NotFound(username.to_string()));
        }
        self.remove_tree(&dir, username)?;
        self.bump();

        info!("deleted account {}", username);
        Ok(())
    }

    /// Move `dir` out of sight with one rename, then delete it.
    fn remove_tree(&self, dir: &Path, what: &str) -> Result<()> {
        let tombstone = self.root.join(format!(
            "{}{}-{}-{}",
            TOMBSTONE_PREFIX,
            what.replace('/', "_"),
            std::process::id(),
            self.revision()
        ));
        fs::rename(dir, &tombstone)?;
        if let Err(e) = fs::remove_dir_all(&tombstone) {
            warn!("leaving {} for cleanup: {}", tombstone.display(), e);
        }
        Ok(())
    }

    /// Load every live template. Holds the read lock for the whole pass.
    pub fn templates(&self) -> Result<Vec<(OwnerRef, GrayImage)>> {
        let _guard = self.read_lock();

        let mut slots = Vec::new();
        for account in self.accounts()? {
            slots.push(OwnerRef::owner(account.clone()));
            for member in list_dirs(&self.account_dir(&account).join(MEMBERS_DIR))? {
                slots.push(OwnerRef::member(account.clone(), member));
            }
        }

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let path = self.slot_dir(&slot).join(FACE_FILE);
            if !path.is_file() {
                continue;
            }
            match image::open(&path) {
                Ok(img) => out.push((slot, img.to_luma8())),
                Err(e) => warn!("skipping unreadable template {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
