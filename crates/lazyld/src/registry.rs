//! Owns every segment of one execution session.

use log::{debug, warn};

use crate::error::{LoaderError, Result};
use crate::mapper::PageMapper;
use crate::segment::{Segment, SegmentDescriptor};

/// Outcome of [`SegmentRegistry::release_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct SegmentRegistry {
    segments: Vec<Segment>,
}

impl SegmentRegistry {
    /// Validate the descriptors and create a page-state table for each one.
    ///
    /// Any failure drops what was built so far and registers nothing.
    pub fn register(descriptors: &[SegmentDescriptor], page_size: usize) -> Result<Self> {
        let mut segments: Vec<Segment> = Vec::with_capacity(descriptors.len());
        for (i, desc) in descriptors.iter().enumerate() {
            desc.validate(page_size)
                .map_err(|message| LoaderError::load("<segment table>", message))?;
            if let Some(other) = segments.iter().find(|s| s.descriptor().overlaps(desc)) {
                return Err(LoaderError::load(
                    "<segment table>",
                    format!(
                        "segment {i} [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                        desc.vaddr,
                        desc.end(),
                        other.descriptor().vaddr,
                        other.descriptor().end()
                    ),
                ));
            }
            let segment = Segment::new(*desc, page_size)?;
            debug!(
                "segment {i}: [{:#x}, {:#x}) file {:#x}+{:#x} {:?}, {} pages",
                desc.vaddr,
                desc.end(),
                desc.file_offset,
                desc.file_size,
                desc.perms,
                segment.pages().len()
            );
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment containing `addr`, with its position in the registry.
    pub fn find(&mut self, addr: usize) -> Option<(usize, &mut Segment)> {
        self.segments
            .iter_mut()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr))
    }

    pub fn mapped_pages(&self) -> usize {
        self.segments.iter().map(|s| s.pages().mapped_count()).sum()
    }

    /// Unmap every reserved page and drop all page-state tables.
    ///
    /// A page that fails to unmap is reported and skipped; the rest are still
    /// released. The registry is empty afterwards, so calling this again
    /// releases nothing.
    pub fn release_all(&mut self, mapper: &mut dyn PageMapper) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for segment in self.segments.drain(..) {
            for page in segment.pages().reserved() {
                let addr = segment.page_addr(page);
                match mapper.unmap(addr, segment.page_size()) {
                    Ok(()) => report.released += 1,
                    Err(err) => {
                        warn!("{err}");
                        report.failed += 1;
                    }
                }
            }
        }
        debug!(
            "released {} pages, {} failures",
            report.released, report.failed
        );
        report
    }
}
