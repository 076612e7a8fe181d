//! Segment table of an ELF executable.

use std::fs;
use std::path::{Path, PathBuf};

use object::elf::{FileHeader64, ProgramHeader64, ET_DYN, ET_EXEC, PT_INTERP, PT_LOAD, PT_PHDR};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;

use crate::error::{LoaderError, Result};
use crate::perms::Perms;
use crate::segment::SegmentDescriptor;

/// Where the program headers sit in the loaded image, for the aux vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeaders {
    pub addr: usize,
    pub entry_size: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecImage {
    pub path: PathBuf,
    pub entry: usize,
    pub segments: Vec<SegmentDescriptor>,
    pub phdrs: Option<ProgramHeaders>,
}

/// Produces the segment table for an executable on disk.
pub trait ImageParser {
    fn parse(&self, path: &Path, page_size: usize) -> Result<ExecImage>;
}

/// Statically linked, non-PIE ELF64 executables.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfParser;

impl ImageParser for ElfParser {
    fn parse(&self, path: &Path, page_size: usize) -> Result<ExecImage> {
        let data = fs::read(path).map_err(|source| LoaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_bytes(path, &data, page_size)
    }
}

impl ElfParser {
    pub fn parse_bytes(path: &Path, data: &[u8], page_size: usize) -> Result<ExecImage> {
        let fail = |message: String| LoaderError::load(path, message);

        let header = FileHeader64::<Endianness>::parse(data).map_err(|e| fail(e.to_string()))?;
        let endian = header.endian().map_err(|e| fail(e.to_string()))?;
        match header.e_type(endian) {
            ET_EXEC => {}
            ET_DYN => return Err(fail("position-independent executables are not supported".into())),
            other => return Err(fail(format!("not an executable (e_type {other:#x})"))),
        }

        let phdrs = header
            .program_headers(endian, data)
            .map_err(|e| fail(e.to_string()))?;

        let mut segments = Vec::new();
        let mut phdr_vaddr = None;
        for ph in phdrs {
            match ph.p_type(endian) {
                PT_LOAD => {
                    let desc = load_segment(ph, endian, data.len() as u64, page_size).map_err(fail)?;
                    segments.push(desc);
                }
                PT_PHDR => phdr_vaddr = Some(ph.p_vaddr(endian)),
                PT_INTERP => {
                    return Err(fail("dynamically linked executables are not supported".into()))
                }
                _ => {}
            }
        }
        if segments.is_empty() {
            return Err(fail("no loadable segments".into()));
        }

        // Without PT_PHDR, locate the table through the load segment covering e_phoff.
        let phoff = header.e_phoff(endian);
        let phdr_vaddr = phdr_vaddr.or_else(|| {
            phdrs
                .iter()
                .filter(|ph| ph.p_type(endian) == PT_LOAD)
                .find(|ph| {
                    let start = ph.p_offset(endian);
                    phoff >= start && phoff - start < ph.p_filesz(endian)
                })
                .map(|ph| ph.p_vaddr(endian) + (phoff - ph.p_offset(endian)))
        });
        let phdrs = phdr_vaddr.map(|addr| ProgramHeaders {
            addr: addr as usize,
            entry_size: usize::from(header.e_phentsize(endian)),
            count: phdrs.len(),
        });

        let entry = to_usize(header.e_entry(endian), "entry point").map_err(fail)?;
        Ok(ExecImage {
            path: path.to_path_buf(),
            entry,
            segments,
            phdrs,
        })
    }
}

/// Descriptor for one PT_LOAD, with its start moved down to a page boundary.
fn load_segment(
    ph: &ProgramHeader64<Endianness>,
    endian: Endianness,
    file_len: u64,
    page_size: usize,
) -> std::result::Result<SegmentDescriptor, String> {
    let vaddr = ph.p_vaddr(endian);
    let offset = ph.p_offset(endian);
    let filesz = ph.p_filesz(endian);
    let memsz = ph.p_memsz(endian);

    match offset.checked_add(filesz) {
        Some(end) if end <= file_len => {}
        _ => {
            return Err(format!(
                "segment at {vaddr:#x} reads {filesz:#x} bytes at {offset:#x}, past the end of the file"
            ))
        }
    }

    let delta = vaddr % page_size as u64;
    if offset < delta {
        return Err(format!(
            "segment at {vaddr:#x} starts {delta:#x} bytes into its page but only {offset:#x} bytes into the file"
        ));
    }

    Ok(SegmentDescriptor {
        vaddr: to_usize(vaddr - delta, "segment address")?,
        file_size: to_usize(filesz + delta, "segment file size")?,
        mem_size: to_usize(memsz.saturating_add(delta), "segment memory size")?,
        file_offset: offset - delta,
        perms: Perms::from_elf(ph.p_flags(endian)),
    })
}

fn to_usize(value: u64, what: &str) -> std::result::Result<usize, String> {
    usize::try_from(value).map_err(|_| format!("{what} {value:#x} does not fit the address space"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::elf::{PF_R, PF_W, PF_X, PT_GNU_STACK};

    const PAGE: usize = 4096;

    struct Phdr {
        p_type: u32,
        p_flags: u32,
        p_offset: u64,
        p_vaddr: u64,
        p_filesz: u64,
        p_memsz: u64,
    }

    /// Little-endian ELF64 header followed by the program header table.
    fn elf_bytes(e_type: u16, entry: u64, phdrs: &[Phdr], file_len: usize) -> Vec<u8> {
        let mut b = Vec::with_capacity(file_len);
        b.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        b.extend_from_slice(&[0; 8]);
        b.extend_from_slice(&e_type.to_le_bytes());
        b.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        b.extend_from_slice(&1u32.to_le_bytes());
        b.extend_from_slice(&entry.to_le_bytes());
        b.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        b.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&64u16.to_le_bytes());
        b.extend_from_slice(&56u16.to_le_bytes());
        b.extend_from_slice(&(phdrs.len() as u16).to_le_bytes());
        b.extend_from_slice(&64u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(b.len(), 64);
        for ph in phdrs {
            b.extend_from_slice(&ph.p_type.to_le_bytes());
            b.extend_from_slice(&ph.p_flags.to_le_bytes());
            b.extend_from_slice(&ph.p_offset.to_le_bytes());
            b.extend_from_slice(&ph.p_vaddr.to_le_bytes());
            b.extend_from_slice(&ph.p_vaddr.to_le_bytes()); // p_paddr
            b.extend_from_slice(&ph.p_filesz.to_le_bytes());
            b.extend_from_slice(&ph.p_memsz.to_le_bytes());
            b.extend_from_slice(&(PAGE as u64).to_le_bytes());
        }
        b.resize(file_len.max(b.len()), 0xcc);
        b
    }

    fn text_and_data() -> Vec<Phdr> {
        vec![
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0,
                p_vaddr: 0x40_0000,
                p_filesz: 0x1800,
                p_memsz: 0x1800,
            },
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: 0x1f30,
                p_vaddr: 0x40_3f30,
                p_filesz: 0x100,
                p_memsz: 0x2000,
            },
            Phdr {
                p_type: PT_GNU_STACK,
                p_flags: PF_R | PF_W,
                p_offset: 0,
                p_vaddr: 0,
                p_filesz: 0,
                p_memsz: 0,
            },
        ]
    }

    #[test]
    fn load_segments_are_page_normalized() {
        let data = elf_bytes(ET_EXEC, 0x40_1000, &text_and_data(), 0x2100);
        let image = ElfParser::parse_bytes(Path::new("a.out"), &data, PAGE).unwrap();

        assert_eq!(image.entry, 0x40_1000);
        assert_eq!(
            image.segments,
            vec![
                SegmentDescriptor {
                    vaddr: 0x40_0000,
                    file_size: 0x1800,
                    mem_size: 0x1800,
                    file_offset: 0,
                    perms: Perms::READ | Perms::EXEC,
                },
                SegmentDescriptor {
                    vaddr: 0x40_3000,
                    file_size: 0xf30 + 0x100,
                    mem_size: 0xf30 + 0x2000,
                    file_offset: 0x1000,
                    perms: Perms::READ | Perms::WRITE,
                },
            ]
        );
        assert_eq!(
            image.phdrs,
            Some(ProgramHeaders {
                addr: 0x40_0040,
                entry_size: 56,
                count: 3,
            })
        );
    }

    #[test]
    fn pie_and_truncated_files_are_rejected() {
        let pie = elf_bytes(ET_DYN, 0x1000, &text_and_data(), 0x2100);
        let err = ElfParser::parse_bytes(Path::new("pie"), &pie, PAGE).unwrap_err();
        assert!(matches!(err, LoaderError::Load { .. }));

        let short = elf_bytes(ET_EXEC, 0x40_1000, &text_and_data(), 0x1000);
        let err = ElfParser::parse_bytes(Path::new("short"), &short, PAGE).unwrap_err();
        assert!(err.to_string().contains("past the end of the file"), "{err}");
    }

    #[test]
    fn garbage_is_a_load_error() {
        let err = ElfParser::parse_bytes(Path::new("junk"), b"#!/bin/sh\n", PAGE).unwrap_err();
        assert!(matches!(err, LoaderError::Load { .. }));

        let err = ElfParser.parse(Path::new("/nonexistent/lazyld"), PAGE).unwrap_err();
        assert!(matches!(err, LoaderError::Open { .. }));
    }

    #[test]
    fn interpreter_is_rejected() {
        let mut phdrs = text_and_data();
        phdrs.push(Phdr {
            p_type: PT_INTERP,
            p_flags: PF_R,
            p_offset: 0x200,
            p_vaddr: 0x40_0200,
            p_filesz: 0x1c,
            p_memsz: 0x1c,
        });
        let data = elf_bytes(ET_EXEC, 0x40_1000, &phdrs, 0x2100);
        let err = ElfParser::parse_bytes(Path::new("dyn"), &data, PAGE).unwrap_err();
        assert!(err.to_string().contains("dynamically linked"), "{err}");
    }
}
