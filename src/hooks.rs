//! Instrumentation callbacks injected by the host environment.
//!
//! Profiling and tracing layers live outside this crate; the shim only
//! offers a function-pointer callback table they can install on a
//! session. When present, the hooks are invoked at API entry and exit.
//! The shim never resolves instrumentation symbols itself.

/// Called with the API name at entry (`entering == true`) and exit.
pub type CallBoundaryHook = fn(api: &'static str, entering: bool);

/// Callback table for one device session.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiHooks {
    pub call_boundary: Option<CallBoundaryHook>,
}

impl ApiHooks {
    pub(crate) fn enter(&self, api: &'static str) {
        if let Some(hook) = self.call_boundary {
            hook(api, true);
        }
    }

    pub(crate) fn exit(&self, api: &'static str) {
        if let Some(hook) = self.call_boundary {
            hook(api, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_hook(_api: &'static str, _entering: bool) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn hooks_fire_only_when_installed() {
        let none = ApiHooks::default();
        none.enter("x");
        none.exit("x");
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);

        let hooks = ApiHooks { call_boundary: Some(counting_hook) };
        hooks.enter("x");
        hooks.exit("x");
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
