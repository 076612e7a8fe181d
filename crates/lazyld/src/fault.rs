//! SIGSEGV interception.
//!
//! The handler is installed once per process. Every SIGSEGV is offered to the
//! published session (see [`crate::session`]); anything the session does not
//! resolve goes to the disposition that was active before [`install`].

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use libc::{c_int, siginfo_t};
use log::debug;

use crate::error::{LoaderError, Result};
use crate::page_state::PageIndex;
use crate::session;

/// Why a fault was handed back to the previous disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    /// The address is outside every registered segment.
    Unowned,
    /// The page is already materialized, so this is a real access violation.
    AlreadyMapped,
    /// Materializing the page failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was materialized; the faulting access can be retried.
    Resolved { segment: usize, page: PageIndex },
    Delegated(Delegation),
}

/// Serves one faulting address.
///
/// Called from signal context: implementations must not block and should
/// avoid allocating.
pub trait FaultResolver {
    fn resolve(&mut self, addr: usize) -> FaultOutcome;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultStats {
    pub resolved: u64,
    pub delegated: u64,
}

#[derive(Clone, Copy)]
struct PreviousAction(libc::sigaction);

static PREVIOUS: OnceLock<PreviousAction> = OnceLock::new();

type SigInfoHandler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);
type PlainHandler = extern "C" fn(c_int);

/// Install the SIGSEGV handler, remembering the previous disposition.
///
/// Later calls are no-ops. Must not race with itself.
pub fn install() -> Result<()> {
    if is_installed() {
        return Ok(());
    }

    let handler: SigInfoHandler = on_fault;
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        // stack overflows must still reach a handler on the alternate stack
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaddset(&mut action.sa_mask, libc::SIGSEGV);

        if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
            return Err(LoaderError::SignalSetup(io::Error::last_os_error()));
        }
    }
    // A fault landing before this store falls back to SIG_DFL.
    let _ = PREVIOUS.set(PreviousAction(previous));

    debug!("SIGSEGV handler installed");
    Ok(())
}

pub fn is_installed() -> bool {
    PREVIOUS.get().is_some()
}

extern "C" fn on_fault(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    if sig != libc::SIGSEGV || info.is_null() {
        unsafe { delegate(sig, info, ctx) };
        return;
    }

    let addr = unsafe { (*info).si_addr() } as usize;
    match session::with_active(|resolver| resolver.resolve(addr)) {
        Some(FaultOutcome::Resolved { .. }) => {}
        _ => unsafe { delegate(sig, info, ctx) },
    }
}

/// Hand the signal to the disposition that preceded ours.
///
/// A default or ignored disposition is re-armed and we return, so the
/// faulting access runs again under it.
unsafe fn delegate(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let Some(PreviousAction(previous)) = PREVIOUS.get() else {
        let mut dfl: libc::sigaction = mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &dfl, ptr::null_mut());
        return;
    };

    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        libc::sigaction(sig, previous, ptr::null_mut());
        return;
    }

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let f: SigInfoHandler = mem::transmute(handler);
        f(sig, info, ctx);
    } else {
        let f: PlainHandler = mem::transmute(handler);
        f(sig);
    }
}
