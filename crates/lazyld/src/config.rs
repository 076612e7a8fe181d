use crate::error::{LoaderError, Result};

/// Default size of the stack handed to the loaded program.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Mapping granularity. Every segment base must be aligned to it.
    pub page_size: usize,
    /// Bytes reserved for the initial process stack.
    pub stack_size: usize,
}

impl LoaderConfig {
    /// Page size as reported by the running kernel.
    pub fn detect() -> Self {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = usize::try_from(raw).unwrap_or(0);
        Self::with_page_size(page_size).unwrap_or(Self {
            page_size: 4096,
            stack_size: DEFAULT_STACK_SIZE,
        })
    }

    pub fn with_page_size(page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(LoaderError::InvalidPageSize { page_size });
        }
        Ok(Self {
            page_size,
            stack_size: DEFAULT_STACK_SIZE,
        })
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::detect()
    }
}
