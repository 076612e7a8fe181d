//! Per-segment record of which pages have been materialized.

use crate::error::{LoaderError, Result};

/// Index of a page inside one segment.
///
/// Only handed out by [`PageStateTable::index`] and
/// [`Segment::page_of`](crate::segment::Segment::page_of), both of which
/// check the range first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(usize);

impl PageIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Number of pages needed to cover `mem_size` bytes.
pub fn page_count(mem_size: usize, page_size: usize) -> usize {
    mem_size.div_ceil(page_size)
}

/// Where one page stands in its segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    #[default]
    Unmapped,
    Mapped,
    /// Materialization failed and the page was given back.
    Failed,
    /// Materialization failed and the page could not be given back; it is
    /// still reserved and must be unmapped on release.
    Stranded,
}

impl PageState {
    /// Whether the address range is reserved in the process.
    pub fn is_reserved(self) -> bool {
        matches!(self, PageState::Mapped | PageState::Stranded)
    }
}

/// Fixed-length table of page states, one per page of a segment.
///
/// A page leaves `Unmapped` at most once; the table never changes size.
#[derive(Debug)]
pub struct PageStateTable {
    states: Box<[PageState]>,
}

impl PageStateTable {
    /// All pages start out unmapped.
    pub fn create(pages: usize) -> Result<Self> {
        let mut states = Vec::new();
        states
            .try_reserve_exact(pages)
            .map_err(|_| LoaderError::Allocation { pages })?;
        states.resize(pages, PageState::Unmapped);
        Ok(Self {
            states: states.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn index(&self, k: usize) -> Option<PageIndex> {
        (k < self.states.len()).then_some(PageIndex(k))
    }

    /// # Panics
    /// If `page` is outside this table.
    pub fn state(&self, page: PageIndex) -> PageState {
        self.states[page.0]
    }

    /// # Panics
    /// If `page` is outside this table.
    pub fn is_mapped(&self, page: PageIndex) -> bool {
        self.states[page.0] == PageState::Mapped
    }

    /// # Panics
    /// If `page` is outside this table.
    pub fn mark_mapped(&mut self, page: PageIndex) {
        self.states[page.0] = PageState::Mapped;
    }

    /// Record a failed materialization. `reserved` says whether the page is
    /// still mapped in the process.
    ///
    /// # Panics
    /// If `page` is outside this table.
    pub fn mark_failed(&mut self, page: PageIndex, reserved: bool) {
        self.states[page.0] = if reserved {
            PageState::Stranded
        } else {
            PageState::Failed
        };
    }

    pub fn mapped(&self) -> impl Iterator<Item = PageIndex> + '_ {
        self.pages_where(|state| state == PageState::Mapped)
    }

    /// Pages that still occupy address space: mapped ones and stranded ones.
    pub fn reserved(&self) -> impl Iterator<Item = PageIndex> + '_ {
        self.pages_where(PageState::is_reserved)
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped().count()
    }

    fn pages_where(&self, pred: fn(PageState) -> bool) -> impl Iterator<Item = PageIndex> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(move |(_, state)| pred(**state))
            .map(|(k, _)| PageIndex(k))
    }
}
