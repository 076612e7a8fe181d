use std::io;
use std::ptr::{self, NonNull};

use crate::error::{LoaderError, Result};
use crate::perms::Perms;

/// Virtual-memory operations the materializer and the registry need.
pub trait PageMapper {
    /// Reserve `len` zero-filled, writable bytes exactly at `addr`.
    ///
    /// Must fail rather than replace anything already mapped there.
    fn map_zeroed(&mut self, addr: usize, len: usize) -> Result<NonNull<u8>>;

    fn protect(&mut self, addr: usize, len: usize, perms: Perms) -> Result<()>;

    fn unmap(&mut self, addr: usize, len: usize) -> Result<()>;
}

/// Anonymous private mappings through `mmap(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapMapper;

impl PageMapper for MmapMapper {
    fn map_zeroed(&mut self, addr: usize, len: usize) -> Result<NonNull<u8>> {
        let mapped = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(LoaderError::Map {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        // Kernels before 4.17 treat MAP_FIXED_NOREPLACE as a plain hint.
        if mapped as usize != addr {
            unsafe { libc::munmap(mapped, len) };
            return Err(LoaderError::Map {
                addr,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }
        NonNull::new(mapped.cast::<u8>()).ok_or(LoaderError::Map {
            addr,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        })
    }

    fn protect(&mut self, addr: usize, len: usize, perms: Perms) -> Result<()> {
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, perms.prot()) };
        if rc != 0 {
            return Err(LoaderError::Protect {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<()> {
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(LoaderError::Unmap {
                addr,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Find `len` bytes of address space that are currently free.
///
/// The range is reserved and released again, so it is only a hint; anything
/// may claim it afterwards.
pub fn probe_free_range(len: usize) -> Result<usize> {
    let mapped = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(LoaderError::Map {
            addr: 0,
            source: io::Error::last_os_error(),
        });
    }
    let addr = mapped as usize;
    MmapMapper.unmap(addr, len)?;
    Ok(addr)
}
