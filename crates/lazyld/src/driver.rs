//! Execution driver: handler installation, one session, cleanup.

use std::ffi::CString;
use std::fs::File;
use std::path::Path;

use log::{info, warn};

use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::fault::{self, FaultStats};
use crate::image::{ElfParser, ImageParser};
use crate::launch::{EntryLauncher, Launcher};
use crate::mapper::MmapMapper;
use crate::registry::{ReleaseReport, SegmentRegistry};
use crate::session::{ActiveSession, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Uninitialized,
    HandlerInstalled,
    SegmentsRegistered,
    Running,
    Cleaned,
}

/// What an execution that came back left behind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecReport {
    pub faults: FaultStats,
    pub release: ReleaseReport,
}

/// Drives a single execution.
///
/// `Uninitialized → HandlerInstalled → SegmentsRegistered → Running → Cleaned`.
/// A loader runs one program; build a new one for the next.
#[derive(Debug)]
pub struct Loader {
    config: LoaderConfig,
    state: LoaderState,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            state: LoaderState::Uninitialized,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Install the process-wide SIGSEGV handler.
    pub fn install_fault_handler(&mut self) -> Result<()> {
        self.expect(LoaderState::Uninitialized)?;
        fault::install()?;
        self.state = LoaderState::HandlerInstalled;
        Ok(())
    }

    /// Run the ELF executable at `path`. Does not return if the program starts.
    pub fn execute(&mut self, path: &Path, argv: &[CString]) -> Result<ExecReport> {
        let mut launcher = EntryLauncher::new(self.config.stack_size, self.config.page_size);
        self.execute_with(path, argv, &ElfParser, &mut launcher)
    }

    pub fn execute_with(
        &mut self,
        path: &Path,
        argv: &[CString],
        parser: &dyn ImageParser,
        launcher: &mut dyn Launcher,
    ) -> Result<ExecReport> {
        self.expect(LoaderState::HandlerInstalled)?;
        let page_size = self.config.page_size;

        let image = parser.parse(path, page_size)?;
        let file = File::open(path).map_err(|source| LoaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = SegmentRegistry::register(&image.segments, page_size).map_err(|err| {
            match err {
                LoaderError::Load { message, .. } => LoaderError::load(path, message),
                other => other,
            }
        })?;
        self.state = LoaderState::SegmentsRegistered;
        info!(
            "{:?}: {} segments registered, entry {:#x}",
            path,
            registry.segments().len(),
            image.entry
        );

        let session = Session::new(registry, Box::new(MmapMapper), Box::new(file));
        let active = match ActiveSession::publish(session) {
            Ok(active) => active,
            Err(err) => {
                // the rejected session took the registered segments with it
                self.state = LoaderState::HandlerInstalled;
                return Err(err);
            }
        };
        self.state = LoaderState::Running;

        let launched = launcher.launch(&image, argv);

        let summary = active.retire().finish();
        self.state = LoaderState::Cleaned;
        if let Some(err) = &summary.last_failure {
            warn!("last page fault could not be served: {err}");
        }
        info!(
            "{:?}: {} faults served, {} delegated, {} pages released",
            path, summary.faults.resolved, summary.faults.delegated, summary.release.released
        );

        launched?;
        Ok(ExecReport {
            faults: summary.faults,
            release: summary.release,
        })
    }

    fn expect(&self, expected: LoaderState) -> Result<()> {
        if self.state != expected {
            return Err(LoaderError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}
