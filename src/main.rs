use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doorface::capture::{CaptureCommand, CaptureTrigger};
use doorface::config::{self, Config, LockBackend};
use doorface::door::{DoorController, LockOutput, SimulatedLock, SysfsGpio};
use doorface::session::{CancelSignal, SessionObserver, SessionSettings, SessionState};
use doorface::store::{IdentityStore, OwnerRef};
use doorface::{Camera, Devices, DoorError, DoorSystem, LbphClassifier, YunetDetector};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "doorface")]
#[command(version, about = "Door access control with password login and face verification")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and enroll the owner's face
    CreateAccount {
        username: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    /// Check a password
    Login { username: String },
    /// Log in, then verify the face and unlock the door on a match
    Verify { username: String },
    /// Add a household member and enroll their face
    AddMember { username: String, member: String },
    /// Remove a household member
    RemoveMember { username: String, member: String },
    /// List the members of an account
    Members { username: String },
    /// Replace the account owner's face
    UpdateFace { username: String },
    /// Delete an account with all of its members and faces
    DeleteAccount { username: String },
    /// Print the display name of an account
    Name { username: String },
    /// Lock the door
    Lock,
    /// Unlock the door without verification
    Unlock,
    /// Interactive menu keeping the door state across operations
    Console,
    /// Open config file in editor
    Config,
}

impl Commands {
    /// Commands that capture or verify faces and so need the camera and models.
    fn needs_camera(&self) -> bool {
        matches!(
            self,
            Self::CreateAccount { .. }
                | Self::Verify { .. }
                | Self::AddMember { .. }
                | Self::UpdateFace { .. }
                | Self::Console
        )
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    if let Commands::Config = cli.command {
        return open_config(cli.config);
    }

    let cfg = config::load_config(cli.config.as_deref())?;
    if cli.command.needs_camera() {
        let system = build_system(&cfg)?;
        return run_with_camera(&system, cli.command);
    }

    match cli.command {
        Commands::Login { username } => {
            let store = open_store(&cfg)?;
            let password = read_password("Password: ")?;
            if !store.login(&username, &password) {
                anyhow::bail!("Invalid credentials");
            }
            info!("✓ Welcome {}", store.full_name(&username));
        }
        Commands::RemoveMember { username, member } => {
            open_store(&cfg)?.remove_member(&username, &member)?;
            info!("✓ Member {} removed from {}", member, username);
        }
        Commands::Members { username } => {
            for member in open_store(&cfg)?.members(&username)? {
                println!("{member}");
            }
        }
        Commands::DeleteAccount { username } => {
            open_store(&cfg)?.delete_account(&username)?;
            info!("✓ Account {} deleted", username);
        }
        Commands::Name { username } => println!("{}", open_store(&cfg)?.full_name(&username)),
        Commands::Lock => {
            open_door(&cfg)?.lock()?;
        }
        Commands::Unlock => {
            open_door(&cfg)?.unlock()?;
        }
        _ => unreachable!("config and camera commands are handled above"),
    }

    Ok(())
}

fn run_with_camera(system: &DoorSystem, command: Commands) -> Result<()> {
    match command {
        Commands::CreateAccount {
            username,
            first_name,
            last_name,
        } => {
            let password = read_password("Password: ")?;
            system.try_create_account(&username, &password, &first_name, &last_name)?;
            info!("✓ Account created for {}", username);
        }
        Commands::Verify { username } => {
            let password = read_password("Password: ")?;
            if !system.login(&username, &password) {
                anyhow::bail!("Invalid credentials");
            }
            if !verify(system, &username)? {
                anyhow::bail!("Face not recognized");
            }
        }
        Commands::AddMember { username, member } => {
            system.try_add_member(&username, &member)?;
            info!("✓ Member {} added to {}", member, username);
        }
        Commands::UpdateFace { username } => {
            system.try_enroll(&OwnerRef::owner(username.as_str()))?;
            info!("✓ Face updated for {}", username);
        }
        Commands::Console => console(system)?,
        _ => unreachable!("only camera commands are routed here"),
    }
    Ok(())
}

fn open_store(cfg: &Config) -> Result<Arc<IdentityStore>> {
    let store = IdentityStore::open(&cfg.store_dir)
        .with_context(|| format!("opening face store {}", cfg.store_dir.display()))?;
    Ok(Arc::new(store))
}

fn open_door(cfg: &Config) -> Result<DoorController> {
    let output: Box<dyn LockOutput> = match cfg.lock.backend {
        LockBackend::Gpio => Box::new(
            SysfsGpio::open(cfg.lock.pin)
                .with_context(|| format!("opening gpio pin {}", cfg.lock.pin))?,
        ),
        LockBackend::Simulated => Box::new(SimulatedLock),
    };
    Ok(DoorController::new(output)?)
}

fn open_devices(cfg: &Config) -> Result<Devices> {
    info!("Opening camera: {}", cfg.camera);
    let camera = Camera::open(&cfg.camera).context("Failed to open camera")?;
    let detector = YunetDetector::open(
        &cfg.detector_model,
        cfg.detector_score_threshold,
        cfg.nms_threshold,
    )
    .context("Failed to initialize face detector")?;

    Ok(Devices {
        camera: Box::new(camera),
        detector: Box::new(detector),
        classifier: Box::new(LbphClassifier::new()),
        trigger: Box::new(StdinTrigger),
    })
}

fn build_system(cfg: &Config) -> Result<DoorSystem> {
    let store = open_store(cfg)?;
    let door = open_door(cfg)?;
    let devices = open_devices(cfg)?;
    Ok(DoorSystem::new(store, door, devices, SessionSettings::from(cfg)))
}

/// Enter captures, `q` cancels.
struct StdinTrigger;

impl CaptureTrigger for StdinTrigger {
    fn next_command(&mut self) -> CaptureCommand {
        match prompt("Look at the camera and press ENTER to capture (q to cancel): ") {
            Ok(line) if line.eq_ignore_ascii_case("q") => CaptureCommand::Cancel,
            Ok(_) => CaptureCommand::Capture,
            Err(_) => CaptureCommand::Cancel,
        }
    }

    fn rejected(&mut self, reason: &DoorError) {
        match reason {
            DoorError::AmbiguousCapture(_) => eprintln!("Make sure only ONE face is visible"),
            _ => eprintln!("No face found, move closer to the camera"),
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Ctrl+C cancels the running verification instead of killing the process.
struct SigintCancel {
    previous: libc::sighandler_t,
}

impl SigintCancel {
    fn install() -> Self {
        INTERRUPTED.store(false, Ordering::SeqCst);
        let handler = on_sigint as extern "C" fn(libc::c_int);
        let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
        Self { previous }
    }
}

impl CancelSignal for SigintCancel {
    fn is_cancelled(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

impl Drop for SigintCancel {
    fn drop(&mut self) {
        unsafe {
            libc::signal(libc::SIGINT, self.previous);
        }
    }
}

struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_state(&mut self, state: SessionState) {
        match state {
            SessionState::Sampling => info!("Looking for an authorized face... (Ctrl+C to cancel)"),
            SessionState::Granted => info!("✓ Face recognized, door unlocked"),
            SessionState::Denied => warn!("Face not recognized"),
            SessionState::Closed(_) => {}
        }
    }
}

fn verify(system: &DoorSystem, username: &str) -> Result<bool> {
    let cancel = SigintCancel::install();
    let outcome = system.try_verify_face_with(username, &cancel, &mut ConsoleObserver)?;
    info!("Verification finished: {:?}", outcome.reason);
    Ok(outcome.into_result()?)
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt with terminal echo turned off when stdin is a tty.
fn read_password(label: &str) -> Result<String> {
    let fd = libc::STDIN_FILENO;
    let mut saved: libc::termios = unsafe { std::mem::zeroed() };
    let is_tty = unsafe { libc::isatty(fd) == 1 && libc::tcgetattr(fd, &mut saved) == 0 };

    if is_tty {
        let mut silent = saved;
        silent.c_lflag &= !libc::ECHO;
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &silent);
        }
    }
    let result = prompt(label);
    if is_tty {
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &saved);
        }
        println!();
    }
    result.context("reading password")
}

fn console(system: &DoorSystem) -> Result<()> {
    loop {
        println!("\n===== SMART DOOR =====");
        println!("1. Create account");
        println!("2. Login");
        println!("3. Exit");
        println!(
            "Door status: {}",
            if system.door().is_unlocked() { "UNLOCKED" } else { "LOCKED" }
        );

        match prompt("Choose option: ")?.trim() {
            "1" => {
                let first = prompt("First name: ")?;
                let last = prompt("Last name: ")?;
                let username = prompt("Username: ")?;
                let password = read_password("Password: ")?;
                if [&first, &last, &username, &password].iter().any(|f| f.is_empty()) {
                    eprintln!("All fields required");
                    continue;
                }
                match system.try_create_account(&username, &password, &first, &last) {
                    Ok(()) => println!("Account created!"),
                    Err(e) => eprintln!("Account not ready: {e}"),
                }
            }
            "2" => {
                let username = prompt("Username: ")?;
                let password = read_password("Password: ")?;
                if system.login(&username, &password) {
                    dashboard(system, &username)?;
                } else {
                    eprintln!("Invalid credentials");
                }
            }
            "3" => {
                println!("Exiting system...");
                system.lock_door();
                return Ok(());
            }
            _ => eprintln!("Invalid choice"),
        }
    }
}

fn dashboard(system: &DoorSystem, username: &str) -> Result<()> {
    loop {
        println!("\nWelcome {}", system.get_full_name(username));
        println!("1. Unlock door");
        println!("2. Update face");
        println!("3. Add member");
        println!("4. Delete account");
        println!("5. Log out");

        match prompt("Choose option: ")?.trim() {
            "1" => match verify(system, username) {
                Ok(true) => println!("Door unlocked!"),
                Ok(false) => eprintln!("Face not recognized"),
                Err(e) => eprintln!("Verification unavailable: {e:#}"),
            },
            "2" => {
                if system.update_face(username) {
                    println!("Face updated successfully!");
                }
            }
            "3" => {
                let member = prompt("Member name: ")?;
                if system.add_member(username, &member) {
                    println!("Member {member} added");
                } else {
                    eprintln!("Could not add member {member}");
                }
            }
            "4" => {
                let confirm = prompt("Are you sure you want to delete your account? [y/N] ")?;
                if confirm.eq_ignore_ascii_case("y") && system.delete_account(username) {
                    println!("Account deleted.");
                    system.lock_door();
                    return Ok(());
                }
            }
            "5" => {
                system.lock_door();
                return Ok(());
            }
            _ => eprintln!("Invalid choice"),
        }
    }
}

fn open_config(path: Option<PathBuf>) -> Result<()> {
    let config_path = path.unwrap_or_else(|| config::CONFIG_PATH.to_path_buf());
    if !config_path.exists() {
        config::save_config(&Config::default(), Some(&config_path))
            .context("Failed to write default config")?;
    }
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Commands {
        Cli::try_parse_from(std::iter::once("doorface").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn only_capture_commands_open_the_camera() {
        let store_or_door: [&[&str]; 7] = [
            &["name", "alice"],
            &["members", "alice"],
            &["remove-member", "alice", "bob"],
            &["delete-account", "alice"],
            &["login", "alice"],
            &["lock"],
            &["unlock"],
        ];
        for args in store_or_door {
            assert!(!command(args).needs_camera(), "{args:?}");
        }

        let capture: [&[&str]; 5] = [
            &["create-account", "alice", "--first-name", "Alice", "--last-name", "Smith"],
            &["verify", "alice"],
            &["add-member", "alice", "bob"],
            &["update-face", "alice"],
            &["console"],
        ];
        for args in capture {
            assert!(command(args).needs_camera(), "{args:?}");
        }
    }
}
