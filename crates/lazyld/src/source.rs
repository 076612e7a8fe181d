use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Backing bytes of the executable, read by absolute offset.
pub trait PageSource {
    /// Fill `buf` completely from `offset`, or fail.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

// Positional reads keep no cursor, so a fault can never observe a seek
// left half-done by an interrupted one.
impl PageSource for File {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, offset)
    }
}

impl PageSource for Vec<u8> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::UnexpectedEof)?;
        let bytes = start
            .checked_add(buf.len())
            .and_then(|end| self.get(start..end))
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}
