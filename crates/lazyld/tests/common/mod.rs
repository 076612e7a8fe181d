#![allow(dead_code)]

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;

use lazyld::{ExecImage, ImageParser, Launcher};

/// Hands out a prepared image instead of reading the file.
pub struct FixedImage(pub ExecImage);

impl ImageParser for FixedImage {
    fn parse(&self, _path: &Path, _page_size: usize) -> lazyld::Result<ExecImage> {
        Ok(self.0.clone())
    }
}

/// Stands in for the program: runs a closure instead of jumping anywhere.
pub struct Program<F: FnMut()>(pub F);

impl<F: FnMut()> Launcher for Program<F> {
    fn launch(&mut self, _image: &ExecImage, _argv: &[CString]) -> lazyld::Result<()> {
        (self.0)();
        Ok(())
    }
}

pub fn read(addr: usize) -> u8 {
    unsafe { ptr::read_volatile(addr as *const u8) }
}

pub fn write(addr: usize, value: u8) {
    unsafe { ptr::write_volatile(addr as *mut u8, value) }
}

/// Patterned file of `len` bytes in the temp directory, unique per `tag`.
pub fn backing_file(tag: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8 + 1).collect();
    let path = std::env::temp_dir().join(format!("lazyld-{tag}-{}.bin", std::process::id()));
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Run `f` in a forked child and return how it ended: `Ok(exit code)` or
/// `Err(signal)`. A panic in the child exits with 101.
pub fn in_child(f: impl FnOnce() -> i32) -> Result<i32, i32> {
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(101);
        unsafe { libc::_exit(code) };
    }
    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    if libc::WIFSIGNALED(status) {
        Err(libc::WTERMSIG(status))
    } else {
        Ok(libc::WEXITSTATUS(status))
    }
}
