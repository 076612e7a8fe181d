//! On-demand page loader.
//!
//! Segments of an executable are registered but never mapped up front. The
//! first touch of every page raises SIGSEGV; the fault handler resolves the
//! address to its segment, maps exactly that page, fills it from the file and
//! applies the segment's permissions, then lets the faulting instruction run
//! again. Faults that do not belong to a registered, still-unmapped page are
//! handed to whatever SIGSEGV disposition was active before.
//!
//! Linux only (x86_64 and aarch64).

pub mod config;
pub mod driver;
pub mod error;
pub mod fault;
pub mod image;
pub mod launch;
pub mod mapper;
pub mod materialize;
pub mod page_state;
pub mod perms;
pub mod registry;
pub mod segment;
pub mod session;
pub mod source;

pub use config::LoaderConfig;
pub use driver::{ExecReport, Loader, LoaderState};
pub use error::{LoaderError, Result};
pub use fault::{Delegation, FaultOutcome, FaultResolver, FaultStats};
pub use image::{ElfParser, ExecImage, ImageParser, ProgramHeaders};
pub use launch::{EntryLauncher, Launcher};
pub use mapper::{MmapMapper, PageMapper};
pub use page_state::{PageIndex, PageState, PageStateTable};
pub use perms::Perms;
pub use registry::{ReleaseReport, SegmentRegistry};
pub use segment::{Segment, SegmentDescriptor};
pub use source::PageSource;
