//! Door lock actuator.
//!
//! The lock state lives only in memory. A new controller drives the output to
//! the locked level and starts out locked, so a restart always fails safe.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::info;

use crate::error::{DoorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Lock released.
    High,
    /// Lock engaged.
    Low,
}

/// Physical output driving the lock.
pub trait LockOutput: Send {
    fn set_level(&mut self, level: Level) -> io::Result<()>;
}

/// Sysfs GPIO line (`/sys/class/gpio/gpioN`).
pub struct SysfsGpio {
    value: PathBuf,
}

impl SysfsGpio {
    pub fn open(pin: u32) -> io::Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let line = base.join(format!("gpio{pin}"));
        if !line.exists() {
            fs::write(base.join("export"), pin.to_string())?;
            // udev needs a moment to fix up permissions on the new line
            thread::sleep(Duration::from_millis(100));
        }
        fs::write(line.join("direction"), "out")?;
        Ok(Self {
            value: line.join("value"),
        })
    }
}

impl LockOutput for SysfsGpio {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        let raw = match level {
            Level::High => "1",
            Level::Low => "0",
        };
        fs::write(&self.value, raw)
    }
}

/// Stand-in for machines without a lock wired up.
#[derive(Debug, Default)]
pub struct SimulatedLock;

impl LockOutput for SimulatedLock {
    fn set_level(&mut self, level: Level) -> io::Result<()> {
        match level {
            Level::High => info!("[lock] UNLOCKED"),
            Level::Low => info!("[lock] LOCKED"),
        }
        Ok(())
    }
}

struct DoorState {
    unlocked: bool,
    output: Box<dyn LockOutput>,
}

/// Serialises every lock/unlock against a single output.
pub struct DoorController {
    state: Mutex<DoorState>,
}

impl DoorController {
    pub fn new(mut output: Box<dyn LockOutput>) -> Result<Self> {
        output.set_level(Level::Low).map_err(DoorError::Actuator)?;
        Ok(Self {
            state: Mutex::new(DoorState {
                unlocked: false,
                output,
            }),
        })
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).unlocked
    }

    /// Returns whether the output was actually driven.
    pub fn unlock(&self) -> Result<bool> {
        self.transition(true)
    }

    /// Returns whether the output was actually driven.
    pub fn lock(&self) -> Result<bool> {
        self.transition(false)
    }

    fn transition(&self, unlock: bool) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.unlocked == unlock {
            return Ok(false);
        }
        let level = if unlock { Level::High } else { Level::Low };
        state.output.set_level(level).map_err(DoorError::Actuator)?;
        state.unlocked = unlock;
        info!("door {}", if unlock { "unlocked" } else { "locked" });
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every level written to it.
    #[derive(Clone, Default)]
    pub struct CountingOutput {
        pub writes: Arc<Mutex<Vec<Level>>>,
    }

    impl CountingOutput {
        pub fn writes(&self) -> Vec<Level> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl LockOutput for CountingOutput {
        fn set_level(&mut self, level: Level) -> io::Result<()> {
            self.writes.lock().unwrap().push(level);
            Ok(())
        }
    }

    struct Stuck;

    impl LockOutput for Stuck {
        fn set_level(&mut self, level: Level) -> io::Result<()> {
            match level {
                Level::Low => Ok(()),
                Level::High => Err(io::Error::new(io::ErrorKind::Other, "relay stuck")),
            }
        }
    }

    #[test]
    fn starts_locked_with_one_write() {
        let out = CountingOutput::default();
        let door = DoorController::new(Box::new(out.clone())).unwrap();
        assert!(!door.is_unlocked());
        assert_eq!(out.writes(), vec![Level::Low]);
    }

    #[test]
    fn transitions_are_idempotent() {
        let out = CountingOutput::default();
        let door = DoorController::new(Box::new(out.clone())).unwrap();

        assert!(!door.lock().unwrap());
        assert!(door.unlock().unwrap());
        assert!(!door.unlock().unwrap());
        assert!(door.is_unlocked());
        assert!(door.lock().unwrap());
        assert!(!door.lock().unwrap());

        assert_eq!(out.writes(), vec![Level::Low, Level::High, Level::Low]);
    }

    #[test]
    fn failed_write_keeps_state() {
        let door = DoorController::new(Box::new(Stuck)).unwrap();
        assert!(matches!(door.unlock(), Err(DoorError::Actuator(_))));
        assert!(!door.is_unlocked());
    }

    #[test]
    fn concurrent_unlocks_drive_output_once() {
        let out = CountingOutput::default();
        let door = Arc::new(DoorController::new(Box::new(out.clone())).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let door = door.clone();
                std::thread::spawn(move || door.unlock().unwrap())
            })
            .collect();
        let driven = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|d| *d)
            .count();

        assert_eq!(driven, 1);
        assert_eq!(out.writes(), vec![Level::Low, Level::High]);
    }
}
