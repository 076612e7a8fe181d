//! Turning "page k of segment S is needed" into a usable page.

use std::slice;

use crate::error::{LoaderError, Result};
use crate::mapper::PageMapper;
use crate::page_state::PageIndex;
use crate::segment::Segment;
use crate::source::PageSource;

/// Map, fill and protect one page, then mark it mapped.
///
/// Content is staged while the page is still writable; the segment's final
/// permissions are applied only afterwards. On failure the page is unmapped
/// again and marked failed, so it is never attempted a second time. A page
/// that cannot be unmapped is marked stranded and left for
/// [`SegmentRegistry::release_all`](crate::registry::SegmentRegistry::release_all).
pub fn materialize(
    segment: &mut Segment,
    page: PageIndex,
    mapper: &mut dyn PageMapper,
    source: &dyn PageSource,
) -> Result<()> {
    let page_size = segment.page_size();
    let addr = segment.page_addr(page);

    // 1. zeroed, writable page at its final address
    let base = match mapper.map_zeroed(addr, page_size) {
        Ok(base) => base,
        Err(err) => {
            segment.pages_mut().mark_failed(page, false);
            return Err(err);
        }
    };

    if let Err(err) = fill_and_protect(segment, page, base.as_ptr(), mapper, source) {
        let stranded = mapper.unmap(addr, page_size).is_err();
        segment.pages_mut().mark_failed(page, stranded);
        return Err(err);
    }

    // 5.
    segment.pages_mut().mark_mapped(page);
    Ok(())
}

fn fill_and_protect(
    segment: &Segment,
    page: PageIndex,
    base: *mut u8,
    mapper: &mut dyn PageMapper,
    source: &dyn PageSource,
) -> Result<()> {
    let page_size = segment.page_size();

    // 2. + 3. file-backed prefix; the tail keeps the zeroes from the mapping
    let len = segment.file_bytes_in_page(page);
    if len > 0 {
        let offset = segment.file_offset_of(page);
        let dst = unsafe { slice::from_raw_parts_mut(base, len) };
        source
            .read_exact_at(offset, dst)
            .map_err(|source| LoaderError::Io {
                offset,
                len,
                source,
            })?;
    }

    // 4.
    mapper.protect(segment.page_addr(page), page_size, segment.descriptor().perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::testing::MemoryMapper;
    use crate::page_state::PageState;
    use crate::perms::Perms;
    use crate::segment::SegmentDescriptor;

    const PAGE: usize = 4096;

    fn file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn segment(file_size: usize, mem_size: usize, file_offset: u64, perms: Perms) -> Segment {
        let desc = SegmentDescriptor {
            vaddr: 0x1000,
            file_size,
            mem_size,
            file_offset,
            perms,
        };
        Segment::new(desc, PAGE).unwrap()
    }

    #[test]
    fn small_file_prefix_then_zeroes() {
        let data = file(64);
        let mut seg = segment(10, PAGE, 0, Perms::READ | Perms::WRITE);
        let mut mapper = MemoryMapper::default();
        let page = seg.pages().index(0).unwrap();

        materialize(&mut seg, page, &mut mapper, &data).unwrap();

        let bytes = mapper.page(0x1000).unwrap();
        assert_eq!(&bytes[..10], &data[..10]);
        assert!(bytes[10..].iter().all(|b| *b == 0));
        assert_eq!(bytes.len(), PAGE);
        assert_eq!(mapper.perms(0x1000), Some(Perms::READ | Perms::WRITE));
        assert!(seg.pages().is_mapped(page));
    }

    #[test]
    fn partial_and_zero_fill_pages() {
        let data = file(0x100 + 3 * PAGE);
        let mut seg = segment(PAGE + PAGE / 2, 3 * PAGE, 0x100, Perms::READ | Perms::EXEC);
        let mut mapper = MemoryMapper::default();

        for k in [2, 0, 1] {
            let page = seg.pages().index(k).unwrap();
            materialize(&mut seg, page, &mut mapper, &data).unwrap();
            assert_eq!(seg.pages().mapped_count(), mapper.mapped_addrs().len());
        }

        let p0 = mapper.page(0x1000).unwrap();
        assert_eq!(p0, &data[0x100..0x100 + PAGE]);

        let p1 = mapper.page(0x1000 + PAGE).unwrap();
        assert_eq!(&p1[..PAGE / 2], &data[0x100 + PAGE..0x100 + PAGE + PAGE / 2]);
        assert!(p1[PAGE / 2..].iter().all(|b| *b == 0));

        let p2 = mapper.page(0x1000 + 2 * PAGE).unwrap();
        assert!(p2.iter().all(|b| *b == 0));

        for addr in mapper.mapped_addrs() {
            assert_eq!(mapper.perms(addr), Some(Perms::READ | Perms::EXEC));
        }
    }

    #[test]
    fn zero_fill_page_never_reads_the_file() {
        let empty: Vec<u8> = Vec::new();
        let mut seg = segment(0, 2 * PAGE, 0x5000, Perms::READ);
        let mut mapper = MemoryMapper::default();
        let page = seg.pages().index(1).unwrap();

        materialize(&mut seg, page, &mut mapper, &empty).unwrap();
        assert!(mapper.page(0x1000 + PAGE).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn short_file_is_io_error_and_page_is_released() {
        let data = file(5);
        let mut seg = segment(10, PAGE, 0, Perms::READ);
        let mut mapper = MemoryMapper::default();
        let page = seg.pages().index(0).unwrap();

        let err = materialize(&mut seg, page, &mut mapper, &data).unwrap_err();
        assert!(matches!(err, LoaderError::Io { offset: 0, len: 10, .. }));
        assert_eq!(seg.pages().state(page), PageState::Failed);
        assert!(mapper.mapped_addrs().is_empty());
        assert_eq!(mapper.unmapped, vec![0x1000]);
    }

    #[test]
    fn protect_failure_is_reported() {
        let data = file(PAGE);
        let mut seg = segment(PAGE, PAGE, 0, Perms::READ);
        let mut mapper = MemoryMapper::default();
        mapper.fail_protect = true;
        let page = seg.pages().index(0).unwrap();

        let err = materialize(&mut seg, page, &mut mapper, &data).unwrap_err();
        assert!(matches!(err, LoaderError::Protect { addr: 0x1000, .. }));
        assert_eq!(seg.pages().state(page), PageState::Failed);
        assert!(mapper.mapped_addrs().is_empty());
    }

    #[test]
    fn page_that_cannot_be_given_back_is_stranded() {
        let data = file(PAGE);
        let mut seg = segment(PAGE, PAGE, 0, Perms::READ);
        let mut mapper = MemoryMapper::default();
        mapper.fail_protect = true;
        mapper.fail_unmap.insert(0x1000);
        let page = seg.pages().index(0).unwrap();

        materialize(&mut seg, page, &mut mapper, &data).unwrap_err();
        assert_eq!(seg.pages().state(page), PageState::Stranded);
        assert!(!seg.pages().is_mapped(page));
        assert_eq!(seg.pages().reserved().collect::<Vec<_>>(), vec![page]);
        assert_eq!(mapper.mapped_addrs(), vec![0x1000]);
    }

    #[test]
    fn occupied_address_is_map_error() {
        let data = file(PAGE);
        let mut seg = segment(PAGE, PAGE, 0, Perms::READ);
        let mut mapper = MemoryMapper::default();
        mapper.map_zeroed(0x1000, PAGE).unwrap();
        let page = seg.pages().index(0).unwrap();

        let err = materialize(&mut seg, page, &mut mapper, &data).unwrap_err();
        assert!(matches!(err, LoaderError::Map { addr: 0x1000, .. }));
        assert_eq!(seg.pages().state(page), PageState::Failed);
        // the foreign mapping is left alone
        assert!(mapper.unmapped.is_empty());
    }
}
