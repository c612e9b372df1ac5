use nom::{
    multi,
    number::{complete::u32 as word, Endianness},
    sequence, IResult,
};
use num_derive::FromPrimitive;

use crate::helpers::fixed_name;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const NONE = 0x00;
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SGFlags: u32 {
        const HIGHVM = 0x1;
        const FVMLIB = 0x2;
        const NORELOC = 0x4;
        const PROTECTED_VERSION_1 = 0x8;
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SectionType {
    SRegular = 0x0,
    SZeroFill = 0x1,
    SCstringLiterals = 0x2,
    S4ByteLiterals = 0x3,
    S8ByteLiterals = 0x4,
    SLiteralPointers = 0x5,
    SNonLazySymbolPointers = 0x6,
    SLazySymbolPointers = 0x7,
    SSymbolStubs = 0x8,
    SModInitFuncPointers = 0x9,
    SModTermFuncPointers = 0xa,
    SCoalesced = 0xb,
    SGbZeroFill = 0xc,
    SInterposing = 0xd,
    S16ByteLiterals = 0xe,
}

impl SectionType {
    pub const SECTION_TYPE_MASK: u32 = 0x000000ff;
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionAttributes: u32 {
        const PURE_INSTRUCTIONS = 0x80000000;
        const NO_TOC = 0x40000000;
        const STRIP_STATIC_SYMS = 0x20000000;
        const NO_DEAD_STRIP = 0x10000000;
        const LIVE_SUPPORT = 0x08000000;
        const SELF_MODIFYING_CODE = 0x04000000;
        const DEBUG = 0x02000000;
        const SOME_INSTRUCTIONS = 0x00000400;
        const EXT_RELOC = 0x00000200;
        const LOC_RELOC = 0x00000100;
    }
}

impl SectionAttributes {
    pub const SECTION_ATTRIBUTES_MASK: u32 = 0xffffff00;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl Section {
    pub const SIZE: usize = 68;

    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, sectname) = fixed_name(bytes)?;
        let (bytes, segname) = fixed_name(bytes)?;

        let (bytes, (addr, size, offset, align, reloff, nreloc, flags, reserved1, reserved2)) =
            sequence::tuple((
                word(endian),
                word(endian),
                word(endian),
                word(endian),
                word(endian),
                word(endian),
                word(endian),
                word(endian),
                word(endian),
            ))(bytes)?;

        Ok((
            bytes,
            Section {
                sectname,
                segname,
                addr,
                size,
                offset,
                align,
                reloff,
                nreloc,
                flags,
                reserved1,
                reserved2,
            },
        ))
    }

    pub fn section_type(&self) -> Option<SectionType> {
        num::FromPrimitive::from_u32(self.flags & SectionType::SECTION_TYPE_MASK)
    }

    pub fn attributes(&self) -> SectionAttributes {
        SectionAttributes::from_bits_truncate(self.flags & SectionAttributes::SECTION_ATTRIBUTES_MASK)
    }

    /// Zero-fill sections occupy address space but no file bytes.
    pub fn has_file_contents(&self) -> bool {
        !matches!(
            self.section_type(),
            Some(SectionType::SZeroFill) | Some(SectionType::SGbZeroFill)
        )
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && (addr - self.addr) < self.size
    }

    pub fn serialize(&self, endian: Endianness) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        push_name(&mut bytes, &self.sectname);
        push_name(&mut bytes, &self.segname);
        for w in [
            self.addr,
            self.size,
            self.offset,
            self.align,
            self.reloff,
            self.nreloc,
            self.flags,
            self.reserved1,
            self.reserved2,
        ] {
            push_word(&mut bytes, w, endian);
        }
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: String,
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: Protection,
    pub initprot: Protection,
    pub nsects: u32,
    pub flags: SGFlags,
    pub sections: Vec<Section>,
}

impl SegmentCommand {
    pub const SIZE: usize = 56;

    pub fn parse(ldcmd: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (cursor, (cmd, cmdsize)) = sequence::tuple((word(endian), word(endian)))(ldcmd)?;
        let (cursor, segname) = fixed_name(cursor)?;

        let (cursor, (vmaddr, vmsize, fileoff, filesize)) =
            sequence::tuple((word(endian), word(endian), word(endian), word(endian)))(cursor)?;

        let (cursor, (maxprot, initprot, nsects, flags)) =
            sequence::tuple((word(endian), word(endian), word(endian), word(endian)))(cursor)?;

        let (cursor, sections) =
            multi::count(|b| Section::parse(b, endian), nsects as usize)(cursor)?;

        Ok((
            cursor,
            SegmentCommand {
                cmd,
                cmdsize,
                segname,
                vmaddr,
                vmsize,
                fileoff,
                filesize,
                maxprot: Protection::from_bits_truncate(maxprot),
                initprot: Protection::from_bits_truncate(initprot),
                nsects,
                flags: SGFlags::from_bits_truncate(flags),
                sections,
            },
        ))
    }

    pub fn serialize(&self, endian: Endianness) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.cmdsize as usize);
        push_word(&mut bytes, self.cmd, endian);
        push_word(&mut bytes, self.cmdsize, endian);
        push_name(&mut bytes, &self.segname);
        for w in [
            self.vmaddr,
            self.vmsize,
            self.fileoff,
            self.filesize,
            self.maxprot.bits(),
            self.initprot.bits(),
            self.nsects,
            self.flags.bits(),
        ] {
            push_word(&mut bytes, w, endian);
        }
        for sect in &self.sections {
            bytes.extend(sect.serialize(endian));
        }
        if bytes.len() < self.cmdsize as usize {
            bytes.resize(self.cmdsize as usize, 0);
        }
        bytes
    }
}

fn push_word(out: &mut Vec<u8>, w: u32, endian: Endianness) {
    match crate::helpers::native(endian) {
        Endianness::Big => out.extend_from_slice(&w.to_be_bytes()),
        _ => out.extend_from_slice(&w.to_le_bytes()),
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    let len = name.len().min(16);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    out.extend_from_slice(&field);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_segment() -> SegmentCommand {
        let text = Section {
            sectname: "__text".to_string(),
            segname: "__TEXT".to_string(),
            addr: 0x1f00,
            size: 0x40,
            offset: 0xf00,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0x80000400,
            reserved1: 0,
            reserved2: 0,
        };
        let cstring = Section {
            sectname: "__cstring".to_string(),
            addr: 0x1f40,
            size: 0x20,
            offset: 0xf40,
            flags: 0x2,
            ..text.clone()
        };
        SegmentCommand {
            cmd: 1,
            cmdsize: (SegmentCommand::SIZE + 2 * Section::SIZE) as u32,
            segname: "__TEXT".to_string(),
            vmaddr: 0x1000,
            vmsize: 0x1000,
            fileoff: 0,
            filesize: 0x1000,
            maxprot: Protection::all(),
            initprot: Protection::READ | Protection::EXECUTE,
            nsects: 2,
            flags: SGFlags::empty(),
            sections: vec![text, cstring],
        }
    }

    #[test]
    fn test_segment_round_trip_both_orders() {
        let seg = text_segment();
        for endian in [Endianness::Big, Endianness::Little] {
            let bytes = seg.serialize(endian);
            assert_eq!(bytes.len(), seg.cmdsize as usize);
            let (_, parsed) = SegmentCommand::parse(&bytes, endian).unwrap();
            assert_eq!(parsed, seg);
        }
    }

    #[test]
    fn test_section_flags() {
        let seg = text_segment();
        let text = &seg.sections[0];
        assert_eq!(text.section_type(), Some(SectionType::SRegular));
        assert!(text
            .attributes()
            .contains(SectionAttributes::PURE_INSTRUCTIONS | SectionAttributes::SOME_INSTRUCTIONS));
        assert_eq!(seg.sections[1].section_type(), Some(SectionType::SCstringLiterals));
        assert!(text.contains(0x1f3f));
        assert!(!text.contains(0x1f40));
    }
}
