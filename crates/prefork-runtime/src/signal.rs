//! Stop signals and the shutdown flag
//!
//! SIGTERM and SIGINT are caught without `SA_RESTART`, so a blocked
//! `waitpid` or `poll` returns `EINTR` and the caller gets to
//! look at the flag. Forked workers inherit the handlers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Install the SIGTERM/SIGINT handlers. Idempotent.
pub fn install_stop_handlers() -> io::Result<()> {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only touches atomics.
        unsafe { sigaction(sig, &action) }.map_err(io::Error::from)?;
    }
    Ok(())
}

fn decode_signal(raw: i32) -> Option<Signal> {
    match raw {
        0 => None,
        sig => Signal::try_from(sig).ok(),
    }
}

/// Shutdown request, set by a stop signal or programmatically.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    watch_signals: bool,
}

impl Shutdown {
    /// Flag that only [`Shutdown::request`] can set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the stop handlers and follow them.
    pub fn from_signals() -> io::Result<Self> {
        install_stop_handlers()?;
        Ok(Self { requested: Arc::default(), watch_signals: true })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// The stop signal that requested shutdown, if one did.
    pub fn signal(&self) -> Option<Signal> {
        if !self.watch_signals {
            return None;
        }
        decode_signal(LAST_SIGNAL.load(Ordering::SeqCst))
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}
