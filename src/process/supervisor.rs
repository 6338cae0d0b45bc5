//! Simulator launch, generation directories and teardown.
//!
//! `launch` is idempotent per channel: every call creates a fresh
//! `binary_<n>` generation directory (so successive image loads never
//! collide on disk), but the simulator is spawned and the channel bound
//! only once. A launch in progress on one thread is visible to a racing
//! thread through the supervisor's own lock; the second caller observes
//! the already-created channel and returns without double-launching.
//!
//! The child executable is resolved from a prioritized list of
//! installation environment variables. A missing executable is fatal
//! and never retried. In dont-run mode the spawn is skipped but the
//! channel is still created, so callers degrade gracefully when an
//! externally launched simulator is expected to connect.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::process::child::SimulatorProcess;
use crate::process::crash::{self, SessionRecord, SIM_OUTPUT_FILE};
use crate::transport::{Channel, Transport};

/// Environment variables naming the tools installation, highest
/// priority first.
const INSTALL_ENV_VARS: [&str; 4] =
    ["XILINX_VITIS", "XILINX_SCOUT", "XILINX_SDX", "XILINX_OPENCL"];

/// Channel id handed to the child so it can find our socket.
pub const SOCKET_ENV_VAR: &str = "EMULATION_SOCKETID";

struct LaunchState {
    transport: Option<Arc<Transport>>,
    child: SimulatorProcess,
}

/// Supervises the one simulator process of a device session.
pub struct Supervisor {
    device_index: u32,
    device_dir: PathBuf,
    record: Arc<SessionRecord>,
    config: Config,
    launch_lock: Mutex<LaunchState>,
}

impl Supervisor {
    pub fn new(device_index: u32, record: Arc<SessionRecord>, config: Config) -> Self {
        Self {
            device_index,
            device_dir: record.device_dir.clone(),
            record,
            config,
            launch_lock: Mutex::new(LaunchState {
                transport: None,
                child: SimulatorProcess::not_started(),
            }),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// The session's transport, if a launch already created it.
    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.launch_lock
            .lock()
            .expect("launch lock poisoned")
            .transport
            .clone()
    }

    /// Ensure the simulator is launched and return the channel plus a
    /// fresh generation directory for this image load.
    pub fn launch(&self, debuggable: bool) -> Result<(Arc<Transport>, PathBuf)> {
        self.launch_inner(debuggable, true)
    }

    /// Create directories and the channel without spawning a child.
    /// Used by the alternate load path, where the external launcher
    /// owns execution.
    pub fn launch_detached(&self) -> Result<(Arc<Transport>, PathBuf)> {
        self.launch_inner(false, false)
    }

    fn launch_inner(&self, debuggable: bool, spawn_child: bool) -> Result<(Arc<Transport>, PathBuf)> {
        let mut state = self.launch_lock.lock().expect("launch lock poisoned");

        create_world_writable_dir(&self.device_dir)?;
        let generation = self.record.generations.load(std::sync::atomic::Ordering::SeqCst);
        let binary_dir = self.device_dir.join(format!("binary_{generation}"));
        create_world_writable_dir(&binary_dir)?;
        self.record
            .generations
            .store(generation + 1, std::sync::atomic::Ordering::SeqCst);

        if let Some(transport) = &state.transport {
            // Live channel: nothing to relaunch.
            return Ok((transport.clone(), binary_dir));
        }

        crash::install_crash_handlers();

        let socket_path = self.device_dir.join(format!(
            "device{}_{}_{}.sock",
            self.device_index,
            generation,
            std::process::id()
        ));
        // Externally launched simulators locate the socket through the
        // environment, exactly like a spawned child does.
        std::env::set_var(SOCKET_ENV_VAR, &socket_path);

        if spawn_child && !self.config.dont_run() {
            let executable = self.resolve_simulator_executable()?;
            let output = fs::File::create(binary_dir.join(SIM_OUTPUT_FILE))
                .with_context(|| format!("creating {} in {}", SIM_OUTPUT_FILE, binary_dir.display()))?;

            let mut command = std::process::Command::new(&executable);
            command
                .current_dir(&binary_dir)
                .env(SOCKET_ENV_VAR, &socket_path)
                .stdout(output.try_clone().context("duplicating output file")?)
                .stderr(output);

            if debuggable {
                command.arg("-debug").arg("-ppid").arg(std::process::id().to_string());
                if let Some(port) = self.config.launch_port() {
                    command.arg("-port").arg(port.to_string());
                }
            }

            state.child = SimulatorProcess::spawn(&mut command)
                .with_context(|| format!("spawning simulator {}", executable.display()))?;
        } else {
            log::info!("skipping simulator spawn for device {}", self.device_index);
        }

        // The channel exists regardless of whether a child was spawned.
        let channel = Channel::bind(&socket_path)
            .with_context(|| format!("binding channel at {}", socket_path.display()))?;
        let transport = Arc::new(Transport::new(channel, self.config.packet_size()));
        self.record
            .has_channel
            .store(true, std::sync::atomic::Ordering::SeqCst);
        state.transport = Some(transport.clone());

        log::info!(
            "device {} launched (generation {}, socket {})",
            self.device_index,
            generation,
            socket_path.display()
        );
        Ok((transport, binary_dir))
    }

    /// Resolve the platform-specific simulator executable under the
    /// configured installation. Missing executables are fatal.
    fn resolve_simulator_executable(&self) -> Result<PathBuf> {
        let install = INSTALL_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .or_else(|| self.config.install_path.clone())
            .unwrap_or_else(|| ".".to_string());

        let executable = Path::new(&install).join(model_subpath());
        if !executable.exists() {
            bail!(
                "unable to launch device process: simulator model not found at {}; \
                 check that {} points at a valid installation",
                executable.display(),
                INSTALL_ENV_VARS[0]
            );
        }
        Ok(executable)
    }

    /// Shut the channel down, reap the child and drop the socket file.
    ///
    /// Blocks until the child has exited. Callers send the close call
    /// over the channel before tearing it down.
    pub fn teardown(&self) {
        let mut state = self.launch_lock.lock().expect("launch lock poisoned");
        if let Some(transport) = state.transport.take() {
            transport.channel().shutdown();
        }
        if let Err(e) = state.child.wait() {
            log::warn!("waiting for simulator process failed: {}", e);
        }
        self.record
            .has_channel
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Hand the session an already-connected transport. Test seam for
    /// driving a device against a stub simulator.
    #[cfg(test)]
    pub(crate) fn install_transport(&self, transport: Arc<Transport>) {
        let mut state = self.launch_lock.lock().expect("launch lock poisoned");
        state.transport = Some(transport);
        self.record
            .has_channel
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Remove the device run directory (honoring keep_run_dir is the
    /// caller's decision).
    pub fn remove_run_dir(&self) {
        if let Err(e) = fs::remove_dir_all(&self.device_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", self.device_dir.display(), e);
            }
        }
    }
}

fn model_subpath() -> &'static str {
    if cfg!(target_arch = "arm") {
        "data/emulation/unified/cpu_em/zynq/model/genericpciemodel"
    } else {
        "data/emulation/unified/cpu_em/zynqu/model/genericpciemodel"
    }
}

/// The child writes into its generation directory, so run directories
/// are world-writable.
fn create_world_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("setting permissions on {}", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dont_run_supervisor(index: u32, root: &Path) -> Supervisor {
        let record = SessionRecord::new(index, root.join(format!("device{index}")));
        let config = Config {
            dont_run: Some(true),
            ..Config::default()
        };
        Supervisor::new(index, record, config)
    }

    #[test]
    fn dont_run_creates_channel_without_spawning() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = dont_run_supervisor(7, root.path());

        assert!(supervisor.transport().is_none());
        let (transport, binary_dir) = supervisor.launch(false).unwrap();
        assert!(binary_dir.ends_with("binary_0"));
        assert!(binary_dir.is_dir());
        assert!(!transport.channel().is_connected());
        assert!(transport.channel().socket_path().is_some());

        supervisor.teardown();
    }

    #[test]
    fn launch_is_idempotent_per_channel() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = dont_run_supervisor(8, root.path());

        let (first, dir0) = supervisor.launch(false).unwrap();
        let (second, dir1) = supervisor.launch(true).unwrap();

        // Same channel object, fresh generation directory each call.
        assert!(Arc::ptr_eq(&first, &second));
        assert!(dir0.ends_with("binary_0"));
        assert!(dir1.ends_with("binary_1"));
        assert!(dir0.is_dir() && dir1.is_dir());

        supervisor.teardown();
    }

    #[test]
    fn missing_simulator_executable_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let record = SessionRecord::new(9, root.path().join("device9"));
        let config = Config {
            dont_run: Some(false),
            // Point installation resolution at an empty directory.
            install_path: Some(root.path().display().to_string()),
            ..Config::default()
        };
        let supervisor = Supervisor::new(9, record, config);

        // Only meaningful when no real installation is configured in
        // the environment.
        if INSTALL_ENV_VARS.iter().any(|v| std::env::var(v).is_ok()) {
            return;
        }
        let err = supervisor.launch(false).unwrap_err();
        assert!(err.to_string().contains("simulator model not found"));
    }

    #[test]
    fn run_dir_removal_is_silent_when_absent() {
        let root = tempfile::tempdir().unwrap();
        let supervisor = dont_run_supervisor(10, root.path());
        supervisor.remove_run_dir();
        let (_t, _d) = supervisor.launch(false).unwrap();
        supervisor.teardown();
        supervisor.remove_run_dir();
        assert!(!supervisor.device_dir().exists());
    }
}
