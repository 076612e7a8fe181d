use crate::error::Result;
use crate::page_state::{page_count, PageIndex, PageStateTable};
use crate::perms::Perms;

/// One loadable region as described by the executable's segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub vaddr: usize,
    pub file_size: usize,
    /// Bytes past `file_size` up to `mem_size` are zero-filled.
    pub mem_size: usize,
    pub file_offset: u64,
    pub perms: Perms,
}

impl SegmentDescriptor {
    /// Exclusive end address.
    pub fn end(&self) -> usize {
        self.vaddr + self.mem_size
    }

    /// Checks the invariants the fault path relies on.
    pub fn validate(&self, page_size: usize) -> std::result::Result<(), String> {
        if self.mem_size < self.file_size {
            return Err(format!(
                "segment at {:#x}: memory size {:#x} smaller than file size {:#x}",
                self.vaddr, self.mem_size, self.file_size
            ));
        }
        if self.vaddr % page_size != 0 {
            return Err(format!(
                "segment at {:#x} is not aligned to the {page_size:#x} byte page size",
                self.vaddr
            ));
        }
        if self.vaddr.checked_add(self.mem_size).is_none() {
            return Err(format!(
                "segment at {:#x} with size {:#x} wraps the address space",
                self.vaddr, self.mem_size
            ));
        }
        if self.file_offset.checked_add(self.file_size as u64).is_none() {
            return Err(format!(
                "segment at {:#x}: file range overflows",
                self.vaddr
            ));
        }
        Ok(())
    }

    pub fn overlaps(&self, other: &SegmentDescriptor) -> bool {
        self.mem_size != 0
            && other.mem_size != 0
            && self.vaddr < other.end()
            && other.vaddr < self.end()
    }
}

/// A registered segment: its descriptor plus the page-state table it owns.
#[derive(Debug)]
pub struct Segment {
    desc: SegmentDescriptor,
    page_size: usize,
    pages: PageStateTable,
}

impl Segment {
    /// `desc` must already have passed [`SegmentDescriptor::validate`].
    pub fn new(desc: SegmentDescriptor, page_size: usize) -> Result<Self> {
        let pages = PageStateTable::create(page_count(desc.mem_size, page_size))?;
        Ok(Self {
            desc,
            page_size,
            pages,
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.desc
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages(&self) -> &PageStateTable {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut PageStateTable {
        &mut self.pages
    }

    /// `addr` lies in `[vaddr, vaddr + mem_size)`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.desc.vaddr && addr - self.desc.vaddr < self.desc.mem_size
    }

    /// Page holding `addr`, if the address belongs to this segment.
    pub fn page_of(&self, addr: usize) -> Option<PageIndex> {
        if !self.contains(addr) {
            return None;
        }
        self.pages.index((addr - self.desc.vaddr) / self.page_size)
    }

    pub fn page_addr(&self, page: PageIndex) -> usize {
        self.desc.vaddr + page.get() * self.page_size
    }

    /// Bytes of `page` backed by file content; the rest of the page is zero.
    pub fn file_bytes_in_page(&self, page: PageIndex) -> usize {
        let start = page.get() * self.page_size;
        let end = self.desc.file_size.min(start + self.page_size);
        end.saturating_sub(start)
    }

    pub fn file_offset_of(&self, page: PageIndex) -> u64 {
        self.desc.file_offset + (page.get() * self.page_size) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn desc(vaddr: usize, file_size: usize, mem_size: usize) -> SegmentDescriptor {
        SegmentDescriptor {
            vaddr,
            file_size,
            mem_size,
            file_offset: 0x200,
            perms: Perms::READ,
        }
    }

    #[test]
    fn containment_is_half_open() {
        let seg = Segment::new(desc(0x10000, 0, 2 * PAGE), PAGE).unwrap();
        assert!(!seg.contains(0xffff));
        assert!(seg.contains(0x10000));
        assert!(seg.contains(0x10000 + 2 * PAGE - 1));
        assert!(!seg.contains(0x10000 + 2 * PAGE));
    }

    #[test]
    fn page_of_truncates_to_containing_page() {
        let seg = Segment::new(desc(0x10000, 0, 2 * PAGE + 10), PAGE).unwrap();
        assert_eq!(seg.page_of(0x10000).unwrap().get(), 0);
        assert_eq!(seg.page_of(0x10000 + PAGE - 1).unwrap().get(), 0);
        assert_eq!(seg.page_of(0x10000 + PAGE).unwrap().get(), 1);
        assert_eq!(seg.page_of(0x10000 + 2 * PAGE + 9).unwrap().get(), 2);
        assert!(seg.page_of(0x10000 + 2 * PAGE + 10).is_none());
        assert_eq!(seg.pages().len(), 3);
    }

    #[test]
    fn file_bytes_for_one_and_a_half_pages() {
        let seg = Segment::new(desc(0x10000, PAGE + PAGE / 2, 3 * PAGE), PAGE).unwrap();
        let page = |k| seg.pages().index(k).unwrap();
        assert_eq!(seg.file_bytes_in_page(page(0)), PAGE);
        assert_eq!(seg.file_bytes_in_page(page(1)), PAGE / 2);
        assert_eq!(seg.file_bytes_in_page(page(2)), 0);
        assert_eq!(seg.file_offset_of(page(1)), 0x200 + PAGE as u64);
        assert_eq!(seg.page_addr(page(2)), 0x10000 + 2 * PAGE);
    }

    #[test]
    fn validate_rejects_bad_descriptors() {
        assert!(desc(0x1000, 10, PAGE).validate(PAGE).is_ok());
        assert!(desc(0x1000, PAGE + 1, PAGE).validate(PAGE).is_err());
        assert!(desc(0x1010, 0, PAGE).validate(PAGE).is_err());
        assert!(desc(usize::MAX & !(PAGE - 1), 0, 2 * PAGE).validate(PAGE).is_err());
    }

    #[test]
    fn overlap() {
        let a = desc(0x1000, 0, PAGE);
        assert!(!a.overlaps(&desc(0x2000, 0, PAGE)));
        assert!(a.overlaps(&desc(0x0000, 0, 2 * PAGE)));
        assert!(!a.overlaps(&desc(0x1000, 0, 0)));
    }
}
