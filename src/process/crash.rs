//! Crash propagation across device sessions.
//!
//! A process-wide registry maps device index to a small session record;
//! entries are inserted at session construction and erased at
//! destruction. Only the registry's own insert/erase and the crash
//! fan-out path touch it, never ordinary request handling.
//!
//! When an abnormal-termination signal is delivered (or a child
//! simulator dies abnormally), the fan-out saves every registered
//! session's recorded simulator outputs, terminates the whole process
//! group and exits non-zero. One crashed emulated device must not leave
//! siblings or the host process running in an inconsistent state.
//!
//! The handler runs a narrow sequence: copy already-written output
//! files and issue process-termination signals. The registry is taken
//! with `try_lock` so the handler never deadlocks on a lock held by
//! the interrupted thread; fan-out is best effort.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

/// File the simulator writes its console output to, one per generation
/// directory.
pub const SIM_OUTPUT_FILE: &str = "genericpcieoutput";

static SESSIONS: Mutex<BTreeMap<u32, Arc<SessionRecord>>> = Mutex::new(BTreeMap::new());
static HANDLERS: Once = Once::new();

/// Everything the crash path needs to know about one device session.
#[derive(Debug)]
pub struct SessionRecord {
    pub device_index: u32,
    pub device_dir: PathBuf,
    /// Image-load generations created so far (`binary_0..binary_<n-1>`).
    pub generations: AtomicU32,
    /// Set once the session's channel exists; sessions without a channel
    /// have no simulator outputs to save.
    pub has_channel: AtomicBool,
}

impl SessionRecord {
    pub fn new(device_index: u32, device_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            device_index,
            device_dir,
            generations: AtomicU32::new(0),
            has_channel: AtomicBool::new(false),
        })
    }

    /// Copy each generation's simulator output next to the caller.
    pub fn save_outputs_to(&self, dest_dir: &Path) {
        if !self.has_channel.load(Ordering::SeqCst) {
            return;
        }
        let generations = self.generations.load(Ordering::SeqCst);
        for generation in (0..generations).rev() {
            let src = self
                .device_dir
                .join(format!("binary_{generation}"))
                .join(SIM_OUTPUT_FILE);
            if !src.exists() {
                continue;
            }
            let dest = dest_dir.join(format!(
                "{SIM_OUTPUT_FILE}_device{}_{generation}",
                self.device_index
            ));
            if let Err(e) = std::fs::copy(&src, &dest) {
                log::warn!("failed to save {}: {}", src.display(), e);
            }
        }
    }
}

/// Insert a session into the crash registry.
pub fn register(record: Arc<SessionRecord>) {
    let mut sessions = SESSIONS.lock().expect("session registry poisoned");
    sessions.insert(record.device_index, record);
}

/// Erase a session from the crash registry.
pub fn unregister(device_index: u32) {
    let mut sessions = SESSIONS.lock().expect("session registry poisoned");
    sessions.remove(&device_index);
}

/// Save every registered session's outputs into `dest_dir`.
pub fn save_all_outputs_to(dest_dir: &Path) {
    // try_lock: this also runs from the signal path, where the lock may
    // be held by the interrupted thread.
    let Ok(sessions) = SESSIONS.try_lock() else {
        return;
    };
    for record in sessions.values() {
        record.save_outputs_to(dest_dir);
    }
}

/// Save every registered session's outputs into the current directory.
pub fn save_all_outputs() {
    if let Ok(cwd) = std::env::current_dir() {
        save_all_outputs_to(&cwd);
    }
}

/// Install process-wide handlers for abnormal-termination signals and
/// for abnormal child exit. Idempotent.
pub fn install_crash_handlers() {
    HANDLERS.call_once(|| unsafe {
        let handler = fatal_signal_handler
            as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;

        for signal in [
            libc::SIGSEGV,
            libc::SIGFPE,
            libc::SIGABRT,
            libc::SIGUSR1,
            libc::SIGCHLD,
        ] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                log::warn!("unable to install handler for signal {}", signal);
            }
        }
    });
}

extern "C" fn fatal_signal_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if signal == libc::SIGCHLD {
        // Only a killed or dumped child is fatal; normal exits are the
        // supervisor's business.
        let code = unsafe { info.as_ref().map(|i| i.si_code).unwrap_or(0) };
        if code != libc::CLD_KILLED && code != libc::CLD_DUMPED {
            return;
        }
    }

    save_all_outputs();

    if signal == libc::SIGUSR1 || signal == libc::SIGCHLD {
        let msg = b"software emulation of compute unit(s) exited unexpectedly\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        }
    }

    let resignal = match signal {
        libc::SIGSEGV => libc::SIGSEGV,
        libc::SIGABRT => libc::SIGABRT,
        _ => libc::SIGTERM,
    };
    unsafe {
        libc::kill(0, resignal);
        libc::_exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn session_with_outputs(index: u32, root: &Path, generations: u32) -> Arc<SessionRecord> {
        let device_dir = root.join(format!("device{index}"));
        for generation in 0..generations {
            let bin_dir = device_dir.join(format!("binary_{generation}"));
            fs::create_dir_all(&bin_dir).unwrap();
            fs::write(
                bin_dir.join(SIM_OUTPUT_FILE),
                format!("output of device {index} generation {generation}"),
            )
            .unwrap();
        }
        let record = SessionRecord::new(index, device_dir);
        record.generations.store(generations, Ordering::SeqCst);
        record.has_channel.store(true, Ordering::SeqCst);
        record
    }

    #[test]
    fn crash_fanout_saves_outputs_of_every_session() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let a = session_with_outputs(100, root.path(), 2);
        let b = session_with_outputs(101, root.path(), 1);
        register(a.clone());
        register(b.clone());

        save_all_outputs_to(dest.path());

        for name in [
            "genericpcieoutput_device100_0",
            "genericpcieoutput_device100_1",
            "genericpcieoutput_device101_0",
        ] {
            assert!(dest.path().join(name).exists(), "missing {name}");
        }
        let text = fs::read_to_string(dest.path().join("genericpcieoutput_device100_1")).unwrap();
        assert_eq!(text, "output of device 100 generation 1");

        unregister(100);
        unregister(101);
    }

    #[test]
    fn sessions_without_channel_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let record = session_with_outputs(102, root.path(), 1);
        record.has_channel.store(false, Ordering::SeqCst);
        register(record);

        save_all_outputs_to(dest.path());
        assert!(!dest.path().join("genericpcieoutput_device102_0").exists());

        unregister(102);
    }

    #[test]
    fn unregistered_sessions_are_not_saved() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let record = session_with_outputs(103, root.path(), 1);
        register(record);
        unregister(103);

        save_all_outputs_to(dest.path());
        assert!(!dest.path().join("genericpcieoutput_device103_0").exists());
    }
}
