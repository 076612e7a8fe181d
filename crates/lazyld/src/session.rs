//! State live for exactly one execution, and its hand-off to the fault handler.

use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{LoaderError, Result};
use crate::fault::{Delegation, FaultOutcome, FaultResolver, FaultStats};
use crate::mapper::PageMapper;
use crate::materialize::materialize;
use crate::page_state::PageState;
use crate::registry::{ReleaseReport, SegmentRegistry};
use crate::source::PageSource;

static ACTIVE: AtomicPtr<Session> = AtomicPtr::new(ptr::null_mut());

/// Segments, backing file and mapper of one execution.
///
/// Dropping a session unmaps every page it materialized.
pub struct Session {
    registry: SegmentRegistry,
    mapper: Box<dyn PageMapper>,
    source: Option<Box<dyn PageSource>>,
    stats: FaultStats,
    last_failure: Option<LoaderError>,
}

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionSummary {
    pub faults: FaultStats,
    pub release: ReleaseReport,
    /// Most recent materialization error, if any fault failed.
    pub last_failure: Option<LoaderError>,
}

impl Session {
    pub fn new(
        registry: SegmentRegistry,
        mapper: Box<dyn PageMapper>,
        source: Box<dyn PageSource>,
    ) -> Self {
        Self {
            registry,
            mapper,
            source: Some(source),
            stats: FaultStats::default(),
            last_failure: None,
        }
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    pub fn last_failure(&self) -> Option<&LoaderError> {
        self.last_failure.as_ref()
    }

    /// Close the backing file, then release every mapped page.
    pub fn finish(mut self) -> SessionSummary {
        self.source = None;
        let release = self.registry.release_all(self.mapper.as_mut());
        SessionSummary {
            faults: self.stats,
            release,
            last_failure: self.last_failure.take(),
        }
    }

    fn classify(&mut self, addr: usize) -> FaultOutcome {
        let Some(source) = self.source.as_deref() else {
            return FaultOutcome::Delegated(Delegation::Unowned);
        };
        let Some((index, segment)) = self.registry.find(addr) else {
            return FaultOutcome::Delegated(Delegation::Unowned);
        };
        let Some(page) = segment.page_of(addr) else {
            return FaultOutcome::Delegated(Delegation::Unowned);
        };
        match segment.pages().state(page) {
            PageState::Unmapped => {}
            PageState::Mapped => return FaultOutcome::Delegated(Delegation::AlreadyMapped),
            // no second attempt at the same page
            PageState::Failed | PageState::Stranded => {
                return FaultOutcome::Delegated(Delegation::Failed)
            }
        }

        match materialize(segment, page, self.mapper.as_mut(), source) {
            Ok(()) => FaultOutcome::Resolved {
                segment: index,
                page,
            },
            Err(err) => {
                self.last_failure = Some(err);
                FaultOutcome::Delegated(Delegation::Failed)
            }
        }
    }
}

impl FaultResolver for Session {
    fn resolve(&mut self, addr: usize) -> FaultOutcome {
        let outcome = self.classify(addr);
        match outcome {
            FaultOutcome::Resolved { .. } => self.stats.resolved += 1,
            FaultOutcome::Delegated(_) => self.stats.delegated += 1,
        }
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.release_all(self.mapper.as_mut());
    }
}

/// A session visible to the fault handler.
///
/// Retiring it, or dropping it while unwinding, hides the session from the
/// handler again before it is touched by anyone else.
pub struct ActiveSession {
    session: NonNull<Session>,
}

impl ActiveSession {
    pub fn publish(session: Session) -> Result<Self> {
        let raw = Box::into_raw(Box::new(session));
        if ACTIVE
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            drop(unsafe { Box::from_raw(raw) });
            return Err(LoaderError::SessionBusy);
        }
        // SAFETY: Box::into_raw never yields null.
        let session = unsafe { NonNull::new_unchecked(raw) };
        Ok(Self { session })
    }

    pub fn retire(self) -> Session {
        let this = ManuallyDrop::new(self);
        unsafe { this.take() }
    }

    /// Must be called at most once.
    unsafe fn take(&self) -> Session {
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        *Box::from_raw(self.session.as_ptr())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        drop(unsafe { self.take() });
    }
}

/// Run `f` against the published session, if there is one.
pub(crate) fn with_active<R>(f: impl FnOnce(&mut dyn FaultResolver) -> R) -> Option<R> {
    let raw = ACTIVE.load(Ordering::Acquire);
    if raw.is_null() {
        return None;
    }
    // The published session is only reached from here, on the thread that
    // runs the loaded program, until it is retired.
    Some(f(unsafe { &mut *raw }))
}
