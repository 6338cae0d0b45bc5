//! Child-process handle for the external simulator.
//!
//! Wraps `std::process::Child` behind an explicit state machine so the
//! supervisor can reason about the process without touching raw pids:
//! not started, running, or exited with a code. `poll` is non-blocking,
//! `wait` blocks until exit.

use std::io;
use std::process::{Child, Command};

/// Observable lifecycle state of the simulator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    /// `code` is None when the process was terminated by a signal.
    Exited { code: Option<i32> },
}

/// Handle to the spawned simulator.
#[derive(Debug)]
pub struct SimulatorProcess {
    child: Option<Child>,
    state: ProcessState,
}

impl SimulatorProcess {
    /// A handle for a process that was never spawned (dont-run mode).
    pub fn not_started() -> Self {
        Self { child: None, state: ProcessState::NotStarted }
    }

    /// Spawn the simulator from a fully prepared command.
    pub fn spawn(command: &mut Command) -> io::Result<Self> {
        let child = command.spawn()?;
        let pid = child.id();
        log::info!("simulator process started, pid {}", pid);
        Ok(Self { child: Some(child), state: ProcessState::Running { pid } })
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Non-blocking state refresh.
    pub fn poll(&mut self) -> ProcessState {
        if let Some(child) = &mut self.child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.state = ProcessState::Exited { code: status.code() };
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => log::warn!("polling simulator process failed: {}", e),
            }
        }
        self.state
    }

    /// Block until the process exits. A no-op for a process that never
    /// started or already exited.
    pub fn wait(&mut self) -> io::Result<ProcessState> {
        if let Some(child) = &mut self.child {
            let status = child.wait()?;
            self.state = ProcessState::Exited { code: status.code() };
            self.child = None;
        }
        Ok(self.state)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.poll(), ProcessState::Running { .. })
    }
}
