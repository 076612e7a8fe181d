use bitflags::bitflags;
use object::elf::{PF_R, PF_W, PF_X};

bitflags! {
    /// Access permissions of a segment, using the `PROT_*` bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Perms {
    /// Translate ELF `p_flags` into permissions.
    pub fn from_elf(p_flags: u32) -> Self {
        let mut perms = Perms::empty();
        if p_flags & PF_R != 0 {
            perms |= Perms::READ;
        }
        if p_flags & PF_W != 0 {
            perms |= Perms::WRITE;
        }
        if p_flags & PF_X != 0 {
            perms |= Perms::EXEC;
        }
        perms
    }

    /// `PROT_*` mask for `mmap`/`mprotect`.
    pub fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Perms::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Perms::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Perms::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}
