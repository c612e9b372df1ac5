use nom::number::Endianness;
use nom_derive::Nom;
use num_derive::FromPrimitive;

use crate::error::{ProcessError, ProcessResult};
use crate::helpers::{native, parse_endian};
use crate::machine::CpuType;

pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MHFlags: u32 {
        const MH_NOUNDEFS = 0x1;
        const MH_INCRLINK = 0x2;
        const MH_DYLDLINK = 0x4;
        const MH_BINDATLOAD = 0x8;
        const MH_PREBOUND = 0x10;
        const MH_SPLIT_SEGS = 0x20;
        const MH_LAZY_INIT = 0x40;
        const MH_TWOLEVEL = 0x80;
        const MH_FORCE_FLAT = 0x100;
        const MH_NOMULTIDEFS = 0x200;
        const MH_NOFIXPREBINDING = 0x400;
        const MH_PREBINDABLE = 0x800;
        const MH_ALLMODSBOUND = 0x1000;
        const MH_SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        const MH_CANONICAL = 0x4000;
        const MH_WEAK_DEFINES = 0x8000;
        const MH_BINDS_TO_WEAK = 0x10000;
        const MH_ALLOW_STACK_EXECUTION = 0x20000;
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MHFileType {
    MhObject = 0x1,
    MhExecute = 0x2,
    MhFvmlib = 0x3,
    MhCore = 0x4,
    MhPreload = 0x5,
    MhDylib = 0x6,
    MhDylinker = 0x7,
    MhBundle = 0x8,
    MhDylibStub = 0x9,
    MhDsym = 0xa,
}

/// The fields following the magic word, in file byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
struct RawHeader {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
}

/// A 32-bit Mach-O header with every field in host order.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    pub endian: Endianness,
    pub cputype: CpuType,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: MHFlags,
}

impl MachHeader {
    pub const SIZE: usize = 28;

    /// Works out the image byte order from its magic word.
    pub fn detect_endianness(bytes: &[u8]) -> ProcessResult<Endianness> {
        let magic = bytes
            .get(..4)
            .map(|m| u32::from_be_bytes([m[0], m[1], m[2], m[3]]))
            .ok_or_else(|| ProcessError::truncated("mach header", 0, 4, bytes.len() as u64))?;

        match magic {
            MH_MAGIC => Ok(Endianness::Big),
            MH_CIGAM => Ok(Endianness::Little),
            MH_MAGIC_64 | MH_CIGAM_64 => Err(ProcessError::Unsupported64Bit(magic)),
            _ => Err(ProcessError::InvalidHeader(magic)),
        }
    }

    pub fn is_macho_magic(bytes: &[u8]) -> bool {
        Self::detect_endianness(bytes).is_ok()
    }

    pub fn parse(bytes: &[u8]) -> ProcessResult<MachHeader> {
        let endian = Self::detect_endianness(bytes)?;
        if bytes.len() < Self::SIZE {
            return Err(ProcessError::truncated(
                "mach header",
                0,
                Self::SIZE as u64,
                bytes.len() as u64,
            ));
        }

        let (_, raw) = parse_endian::<RawHeader>(&bytes[4..Self::SIZE], endian)
            .map_err(|_| ProcessError::Parsing("unable to parse mach header".to_string()))?;

        Ok(MachHeader {
            magic: MH_MAGIC,
            endian,
            cputype: CpuType::from_raw(raw.cputype),
            cpusubtype: raw.cpusubtype,
            filetype: raw.filetype,
            ncmds: raw.ncmds,
            sizeofcmds: raw.sizeofcmds,
            flags: MHFlags::from_bits_truncate(raw.flags),
        })
    }

    pub fn file_type(&self) -> Option<MHFileType> {
        num::FromPrimitive::from_u32(self.filetype)
    }

    /// True when the image byte order differs from the host's.
    pub fn swapped(&self) -> bool {
        native(self.endian) != native(Endianness::Native)
    }

    pub fn size(&self) -> usize {
        Self::SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(big: bool) -> Vec<u8> {
        let words = [MH_MAGIC, 18, 0, 2, 3, 0x200, 0x85];
        words
            .iter()
            .flat_map(|w| if big { w.to_be_bytes() } else { w.to_le_bytes() })
            .collect()
    }

    #[test]
    fn test_parse_big_endian_header() {
        let header = MachHeader::parse(&header_bytes(true)).unwrap();
        assert_eq!(header.endian, Endianness::Big);
        assert_eq!(header.cputype, CpuType::PowerPC);
        assert_eq!(header.ncmds, 3);
        assert_eq!(header.sizeofcmds, 0x200);
        assert_eq!(header.file_type(), Some(MHFileType::MhExecute));
        assert!(header.flags.contains(MHFlags::MH_NOUNDEFS | MHFlags::MH_DYLDLINK));
    }

    #[test]
    fn test_parse_little_endian_header() {
        let header = MachHeader::parse(&header_bytes(false)).unwrap();
        assert_eq!(header.endian, Endianness::Little);
        assert_eq!(header.ncmds, 3);
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            MachHeader::parse(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]),
            Err(ProcessError::InvalidHeader(0xdeadbeef))
        ));
        assert!(matches!(
            MachHeader::parse(&[0xcf, 0xfa, 0xed, 0xfe]),
            Err(ProcessError::Unsupported64Bit(_))
        ));
        assert!(matches!(
            MachHeader::parse(&[0xfe, 0xed, 0xfa, 0xce, 0, 0]),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }
}
