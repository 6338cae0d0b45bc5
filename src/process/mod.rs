//! Simulator process supervision.
//!
//! Launching, tracking and failing over the external simulator process:
//! an explicit child-process handle, a per-session supervisor enforcing
//! single-launch-per-channel, and process-wide crash propagation that
//! saves every session's outputs before the process group is torn down.

pub mod child;
pub mod crash;
pub mod supervisor;

pub use child::{ProcessState, SimulatorProcess};
pub use crash::{SessionRecord, SIM_OUTPUT_FILE};
pub use supervisor::{Supervisor, SOCKET_ENV_VAR};
