//! ELF loading (spec.md §6 "ELF loading"): 32-bit little-endian executables
//! only. This module only validates the header and program headers and
//! hands back the loadable segments; turning a segment into SPT entries is
//! `process::execute`'s job (spec.md §4.4/§4.6).

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 0x03;

const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_SHLIB: u32 = 5;
const PT_PHDR: u32 = 6;
const PT_STACK: u32 = 0x6474_e551;

bitflags! {
    /// Program header `p_flags` bits (spec.md §6).
    struct SegmentFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const MAX_PHNUM: u16 = 1024;

/// A validated `PT_LOAD` segment, ready to be installed as SPT entries
/// (spec.md §4.4 "iterate program headers ... for each PT_LOAD validate
/// and install backing via SPT").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub file_offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub writable: bool,
    pub executable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    TooManyProgramHeaders,
    DisallowedSegment,
    BadSegmentLayout,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::InvalidFormat => write!(f, "invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "unsupported architecture (need i386)"),
            ExecError::UnsupportedType => write!(f, "unsupported ELF type (need ET_EXEC)"),
            ExecError::TooManyProgramHeaders => write!(f, "too many program headers"),
            ExecError::DisallowedSegment => write!(f, "disallowed segment type"),
            ExecError::BadSegmentLayout => write!(f, "segment layout violates loader invariants"),
            ExecError::ReadError => write!(f, "short read while loading ELF"),
        }
    }
}

struct Ehdr {
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS32 {
            return Err(ExecError::UnsupportedArch);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }
        if data[6] != EV_CURRENT {
            return Err(ExecError::InvalidFormat);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        let e_version = u32::from_le_bytes(data[20..24].try_into().unwrap());
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_386 {
            return Err(ExecError::UnsupportedArch);
        }
        if e_version != EV_CURRENT as u32 {
            return Err(ExecError::InvalidFormat);
        }
        let e_phentsize = u16::from_le_bytes([data[42], data[43]]);
        if e_phentsize as usize != PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Ehdr {
            e_entry: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            e_phoff: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            e_phentsize,
            e_phnum: u16::from_le_bytes([data[44], data[45]]),
        })
    }
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

impl Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::ReadError);
        }
        Ok(Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_offset: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_vaddr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            p_filesz: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            p_memsz: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        })
    }
}

/// Validate an in-memory ELF image and return its entry point plus every
/// `PT_LOAD` segment, or the first violation encountered (spec.md §6).
pub fn validate(data: &[u8]) -> Result<(u64, Vec<LoadSegment>), ExecError> {
    let ehdr = Ehdr::parse(data)?;
    if ehdr.e_phnum > MAX_PHNUM {
        return Err(ExecError::TooManyProgramHeaders);
    }

    let mut segments = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let end = off.checked_add(PHDR_SIZE).ok_or(ExecError::ReadError)?;
        if end > data.len() {
            return Err(ExecError::ReadError);
        }
        let phdr = Phdr::parse(&data[off..end])?;

        match phdr.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_STACK => continue,
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::DisallowedSegment),
            PT_LOAD => {}
            _ => continue, // unknown types are ignored (spec.md §6)
        }

        validate_load_segment(&phdr)?;

        segments.push(LoadSegment {
            file_offset: phdr.p_offset as u64,
            vaddr: phdr.p_vaddr as u64,
            file_size: phdr.p_filesz as u64,
            mem_size: phdr.p_memsz as u64,
            writable: SegmentFlags::from_bits_truncate(phdr.p_flags).contains(SegmentFlags::W),
            executable: SegmentFlags::from_bits_truncate(phdr.p_flags).contains(SegmentFlags::X),
        });
    }

    Ok((ehdr.e_entry as u64, segments))
}

fn validate_load_segment(phdr: &Phdr) -> Result<(), ExecError> {
    const PAGE_MASK: u32 = crate::memory::PAGE_SIZE as u32 - 1;

    if phdr.p_offset & PAGE_MASK != phdr.p_vaddr & PAGE_MASK {
        return Err(ExecError::BadSegmentLayout);
    }
    if phdr.p_memsz < phdr.p_filesz {
        return Err(ExecError::BadSegmentLayout);
    }
    if phdr.p_memsz == 0 {
        return Err(ExecError::BadSegmentLayout);
    }
    let end = (phdr.p_vaddr as u64)
        .checked_add(phdr.p_memsz as u64)
        .ok_or(ExecError::BadSegmentLayout)?;
    if (phdr.p_vaddr as u64) < crate::memory::PAGE_SIZE as u64 {
        // Segment would include the zero page.
        return Err(ExecError::BadSegmentLayout);
    }
    if !crate::memory::VAddr::new(phdr.p_vaddr as u64).is_user_space()
        || !crate::memory::VAddr::new(end.saturating_sub(1)).is_user_space()
    {
        return Err(ExecError::BadSegmentLayout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn build_minimal_elf(phdrs: &[(u32, u32, u32, u32, u32, u32)]) -> Vec<u8> {
        let phoff = EHDR_SIZE as u32;
        let mut data = vec![0u8; EHDR_SIZE + phdrs.len() * PHDR_SIZE];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS32;
        data[5] = ELFDATA2LSB;
        data[6] = EV_CURRENT;
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&EM_386.to_le_bytes());
        data[20..24].copy_from_slice(&(EV_CURRENT as u32).to_le_bytes());
        data[24..28].copy_from_slice(&0x1000u32.to_le_bytes()); // e_entry
        data[28..32].copy_from_slice(&phoff.to_le_bytes());
        data[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        data[44..46].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

        for (i, &(p_type, p_offset, p_vaddr, p_filesz, p_memsz, p_flags)) in phdrs.iter().enumerate() {
            let base = phoff as usize + i * PHDR_SIZE;
            data[base..base + 4].copy_from_slice(&p_type.to_le_bytes());
            data[base + 4..base + 8].copy_from_slice(&p_offset.to_le_bytes());
            data[base + 8..base + 12].copy_from_slice(&p_vaddr.to_le_bytes());
            data[base + 16..base + 20].copy_from_slice(&p_filesz.to_le_bytes());
            data[base + 20..base + 24].copy_from_slice(&p_memsz.to_le_bytes());
            data[base + 24..base + 28].copy_from_slice(&p_flags.to_le_bytes());
        }
        data
    }

    #[test]
    fn valid_single_load_segment_parses() {
        let data = build_minimal_elf(&[(
            PT_LOAD,
            0x1000,
            0x1000,
            0x10,
            0x10,
            (SegmentFlags::X | SegmentFlags::R).bits(),
        )]);
        let (entry, segs) = validate(&data).unwrap();
        assert_eq!(entry, 0x1000);
        assert_eq!(segs.len(), 1);
        assert!(segs[0].executable);
        assert!(!segs[0].writable);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut data = build_minimal_elf(&[]);
        data[0] = 0;
        assert_eq!(validate(&data), Err(ExecError::InvalidFormat));
    }

    #[test]
    fn rejects_non_i386_machine() {
        let mut data = build_minimal_elf(&[]);
        data[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        assert_eq!(validate(&data), Err(ExecError::UnsupportedArch));
    }

    #[test]
    fn rejects_pt_dynamic() {
        let data = build_minimal_elf(&[(PT_DYNAMIC, 0, 0x1000, 0, 0x10, 0)]);
        assert_eq!(validate(&data), Err(ExecError::DisallowedSegment));
    }

    #[test]
    fn ignores_pt_note_and_pt_phdr() {
        let data = build_minimal_elf(&[(PT_NOTE, 0, 0, 0, 0, 0), (PT_PHDR, 0, 0, 0, 0, 0)]);
        let (_, segs) = validate(&data).unwrap();
        assert!(segs.is_empty());
    }

    #[test]
    fn rejects_memsz_less_than_filesz() {
        let data = build_minimal_elf(&[(PT_LOAD, 0x1000, 0x1000, 0x20, 0x10, 4)]);
        assert_eq!(validate(&data), Err(ExecError::BadSegmentLayout));
    }

    #[test]
    fn rejects_mismatched_page_offset() {
        let data = build_minimal_elf(&[(PT_LOAD, 0x1001, 0x1000, 0x10, 0x10, 4)]);
        assert_eq!(validate(&data), Err(ExecError::BadSegmentLayout));
    }

    #[test]
    fn rejects_zero_page_segment() {
        let data = build_minimal_elf(&[(PT_LOAD, 0, 0, 0x10, 0x10, 4)]);
        assert_eq!(validate(&data), Err(ExecError::BadSegmentLayout));
    }

    #[test]
    fn rejects_too_many_program_headers() {
        let mut data = build_minimal_elf(&[]);
        data[44..46].copy_from_slice(&(MAX_PHNUM + 1).to_le_bytes());
        assert_eq!(validate(&data), Err(ExecError::TooManyProgramHeaders));
    }
}
