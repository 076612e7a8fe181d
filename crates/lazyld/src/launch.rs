//! Handing control to the loaded program.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use log::info;

use crate::error::{LoaderError, Result};
use crate::image::ExecImage;

/// Transfers control to a registered image.
///
/// A real launcher does not come back; one that returns ends the session.
pub trait Launcher {
    fn launch(&mut self, image: &ExecImage, argv: &[CString]) -> Result<()>;
}

/// Builds a System V initial stack and jumps to the entry point.
#[derive(Debug, Clone, Copy)]
pub struct EntryLauncher {
    pub stack_size: usize,
    pub page_size: usize,
}

impl EntryLauncher {
    pub fn new(stack_size: usize, page_size: usize) -> Self {
        Self {
            stack_size,
            page_size,
        }
    }
}

impl Launcher for EntryLauncher {
    fn launch(&mut self, image: &ExecImage, argv: &[CString]) -> Result<()> {
        if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            return Err(LoaderError::load(
                &image.path,
                "entering a program is only implemented for x86_64 and aarch64",
            ));
        }

        let envp: Vec<CString> = std::env::vars_os()
            .filter_map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).ok()
            })
            .collect();

        let mut aux = vec![
            (libc::AT_PAGESZ as usize, self.page_size),
            (libc::AT_ENTRY as usize, image.entry),
        ];
        if let Some(phdrs) = image.phdrs {
            aux.push((libc::AT_PHDR as usize, phdrs.addr));
            aux.push((libc::AT_PHENT as usize, phdrs.entry_size));
            aux.push((libc::AT_PHNUM as usize, phdrs.count));
        }

        let base = map_stack(self.stack_size)?;
        // The stack belongs to the program from here on and is never unmapped.
        let stack = unsafe { std::slice::from_raw_parts_mut(base as *mut u8, self.stack_size) };
        let sp = build_stack(stack, base, argv, &envp, &aux, random_bytes())
            .map_err(|message| LoaderError::load(&image.path, message))?;

        info!(
            "entering {:?} at {:#x} (stack top {:#x})",
            image.path, image.entry, sp
        );
        unsafe { enter(image.entry, sp) }
    }
}

fn map_stack(len: usize) -> Result<usize> {
    let mapped = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
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
    Ok(mapped as usize)
}

fn random_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    // Zeroes are still a valid AT_RANDOM payload if the call fails.
    unsafe { libc::getrandom(bytes.as_mut_ptr().cast(), bytes.len(), 0) };
    bytes
}

/// Writes downwards from the end of a stack region.
struct StackWriter<'a> {
    stack: &'a mut [u8],
    base: usize,
    cursor: usize,
}

impl<'a> StackWriter<'a> {
    /// Copy `bytes` below the cursor and return their address.
    fn push_bytes(&mut self, bytes: &[u8]) -> std::result::Result<usize, String> {
        self.cursor = self
            .cursor
            .checked_sub(bytes.len())
            .ok_or("arguments and environment do not fit on the stack")?;
        self.stack[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        Ok(self.base + self.cursor)
    }

    fn put_word(&mut self, addr: usize, value: usize) {
        let off = addr - self.base;
        self.stack[off..off + 8].copy_from_slice(&(value as u64).to_ne_bytes());
    }
}

/// Lay out `argc, argv[], NULL, envp[], NULL, auxv..., AT_NULL` with the
/// strings above it. Returns the 16-byte aligned initial stack pointer.
fn build_stack(
    stack: &mut [u8],
    base: usize,
    argv: &[CString],
    envp: &[CString],
    aux: &[(usize, usize)],
    random: [u8; 16],
) -> std::result::Result<usize, String> {
    let mut w = StackWriter {
        cursor: stack.len(),
        stack,
        base,
    };

    let random_addr = w.push_bytes(&random)?;
    let env_ptrs = envp
        .iter()
        .map(|s| w.push_bytes(s.as_bytes_with_nul()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let arg_ptrs = argv
        .iter()
        .map(|s| w.push_bytes(s.as_bytes_with_nul()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut aux = aux.to_vec();
    aux.push((libc::AT_RANDOM as usize, random_addr));
    aux.push((libc::AT_NULL as usize, 0));

    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1 + 2 * aux.len();
    let sp = (base + w.cursor)
        .checked_sub(words * 8)
        .map(|sp| sp & !0xf)
        .filter(|sp| *sp >= base)
        .ok_or("arguments and environment do not fit on the stack")?;

    let mut at = sp;
    let mut put = |value: usize| {
        w.put_word(at, value);
        at += 8;
    };
    put(arg_ptrs.len());
    arg_ptrs.iter().for_each(|p| put(*p));
    put(0);
    env_ptrs.iter().for_each(|p| put(*p));
    put(0);
    for (key, value) in &aux {
        put(*key);
        put(*value);
    }
    Ok(sp)
}

#[cfg(target_arch = "x86_64")]
unsafe fn enter(entry: usize, sp: usize) -> ! {
    // rdx = 0: no exit hook registered by a dynamic linker
    std::arch::asm!(
        "mov rsp, rsi",
        "xor edx, edx",
        "xor ebp, ebp",
        "jmp rax",
        in("rax") entry,
        in("rsi") sp,
        options(noreturn)
    );
}

#[cfg(target_arch = "aarch64")]
unsafe fn enter(entry: usize, sp: usize) -> ! {
    std::arch::asm!(
        "mov sp, x1",
        "mov x0, xzr",
        "mov x29, xzr",
        "mov x30, xzr",
        "br x2",
        in("x1") sp,
        in("x2") entry,
        options(noreturn)
    );
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn enter(_entry: usize, _sp: usize) -> ! {
    std::process::abort()
}
