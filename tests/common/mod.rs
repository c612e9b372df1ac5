//! Builds small thin Mach-O images in memory: one `__TEXT` segment holding
//! the given sections, followed by a symbol table and, when stubs need one,
//! an indirect symbol table.

#![allow(dead_code)]

use nom::number::Endianness;
use otx::command::segment::{Protection, SGFlags, Section, SegmentCommand};

pub const MH_MAGIC: u32 = 0xfeedface;
pub const CPU_TYPE_I386: u32 = 7;
pub const CPU_TYPE_POWERPC: u32 = 18;
pub const SEGMENT_VMADDR: u32 = 0x1000;

const HEADER_SIZE: usize = 28;
const SEGMENT_SIZE: usize = 56;
const SECTION_SIZE: usize = 68;
const SYMTAB_SIZE: usize = 24;
const DYSYMTAB_SIZE: usize = 80;
const DATA_START: usize = 0x100;
pub const S_SYMBOL_STUBS: u32 = 0x8;
const N_EXT: u8 = 0x01;
const N_SECT_EXT: u8 = 0x0f;

struct PendingSection {
    segname: String,
    sectname: String,
    contents: Vec<u8>,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

pub struct ImageBuilder {
    pub cputype: u32,
    pub endian: Endianness,
    sections: Vec<PendingSection>,
    /// Name, type, section ordinal and value.
    symbols: Vec<(String, u8, u8, u32)>,
    indirect: Vec<u32>,
}

pub struct Image {
    pub bytes: Vec<u8>,
    /// Load address of each section, in the order they were added.
    pub addrs: Vec<u32>,
    pub offsets: Vec<u32>,
}

fn push_word(out: &mut Vec<u8>, w: u32, endian: Endianness) {
    match endian {
        Endianness::Big => out.extend_from_slice(&w.to_be_bytes()),
        _ => out.extend_from_slice(&w.to_le_bytes()),
    }
}

fn align(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

impl ImageBuilder {
    fn new(cputype: u32, endian: Endianness) -> Self {
        ImageBuilder {
            cputype,
            endian,
            sections: Vec::new(),
            symbols: Vec::new(),
            indirect: Vec::new(),
        }
    }

    pub fn i386() -> Self {
        Self::new(CPU_TYPE_I386, Endianness::Little)
    }

    pub fn ppc() -> Self {
        Self::new(CPU_TYPE_POWERPC, Endianness::Big)
    }

    pub fn section(self, segname: &str, sectname: &str, contents: &[u8]) -> Self {
        self.section_with(segname, sectname, contents, 0, 0, 0)
    }

    /// A `S_SYMBOL_STUBS` section whose entries start at indirect table
    /// index `first_indirect`.
    pub fn stubs(self, segname: &str, sectname: &str, contents: &[u8], first_indirect: u32, stub_size: u32) -> Self {
        self.section_with(segname, sectname, contents, S_SYMBOL_STUBS, first_indirect, stub_size)
    }

    pub fn section_with(
        mut self,
        segname: &str,
        sectname: &str,
        contents: &[u8],
        flags: u32,
        reserved1: u32,
        reserved2: u32,
    ) -> Self {
        self.sections.push(PendingSection {
            segname: segname.to_string(),
            sectname: sectname.to_string(),
            contents: contents.to_vec(),
            flags,
            reserved1,
            reserved2,
        });
        self
    }

    /// A symbol defined in the section with 1-based ordinal `sect`.
    pub fn symbol(mut self, name: &str, sect: u8, value: u32) -> Self {
        self.symbols.push((name.to_string(), N_SECT_EXT, sect, value));
        self
    }

    /// An undefined external, as imported functions appear.
    pub fn undefined(mut self, name: &str) -> Self {
        self.symbols.push((name.to_string(), N_EXT, 0, 0));
        self
    }

    /// Symbol table indices for the stub and pointer slots, in order.
    pub fn indirect_symbols(mut self, indices: &[u32]) -> Self {
        self.indirect.extend_from_slice(indices);
        self
    }

    /// Section addresses depend only on section sizes, so code that embeds
    /// addresses can be laid out with placeholder bytes first.
    pub fn layout(&self) -> Vec<u32> {
        self.build().addrs
    }

    pub fn build(&self) -> Image {
        let segment_size = SEGMENT_SIZE + SECTION_SIZE * self.sections.len();
        let has_dysymtab = !self.indirect.is_empty();
        let ncmds = if has_dysymtab { 3 } else { 2 };
        let sizeofcmds = segment_size + SYMTAB_SIZE + if has_dysymtab { DYSYMTAB_SIZE } else { 0 };

        let mut offsets = Vec::new();
        let mut cursor = DATA_START.max(align(HEADER_SIZE + sizeofcmds, 16));
        for pending in &self.sections {
            offsets.push(cursor as u32);
            cursor = align(cursor + pending.contents.len(), 16);
        }
        let segment_end = cursor;
        let addrs: Vec<u32> = offsets.iter().map(|off| SEGMENT_VMADDR + off).collect();

        let sections = self
            .sections
            .iter()
            .zip(&offsets)
            .map(|(pending, off)| Section {
                sectname: pending.sectname.clone(),
                segname: pending.segname.clone(),
                addr: SEGMENT_VMADDR + off,
                size: pending.contents.len() as u32,
                offset: *off,
                align: 4,
                reloff: 0,
                nreloc: 0,
                flags: pending.flags,
                reserved1: pending.reserved1,
                reserved2: pending.reserved2,
            })
            .collect();
        let segment = SegmentCommand {
            cmd: 0x1,
            cmdsize: segment_size as u32,
            segname: "__TEXT".to_string(),
            vmaddr: SEGMENT_VMADDR,
            vmsize: align(segment_end, 0x1000) as u32,
            fileoff: 0,
            filesize: segment_end as u32,
            maxprot: Protection::READ | Protection::EXECUTE,
            initprot: Protection::READ | Protection::EXECUTE,
            nsects: self.sections.len() as u32,
            flags: SGFlags::empty(),
            sections,
        };

        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for (name, n_type, sect, value) in &self.symbols {
            push_word(&mut nlists, strings.len() as u32, self.endian);
            nlists.push(*n_type);
            nlists.push(*sect);
            nlists.extend_from_slice(&[0, 0]);
            push_word(&mut nlists, *value, self.endian);
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        let symoff = segment_end;
        let indirectsymoff = symoff + nlists.len();
        let stroff = indirectsymoff + 4 * self.indirect.len();

        let mut out = Vec::new();
        for w in [
            MH_MAGIC,
            self.cputype,
            3,
            2,
            ncmds,
            sizeofcmds as u32,
            0,
        ] {
            push_word(&mut out, w, self.endian);
        }
        out.extend(segment.serialize(self.endian));
        for w in [
            0x2,
            SYMTAB_SIZE as u32,
            symoff as u32,
            self.symbols.len() as u32,
            stroff as u32,
            strings.len() as u32,
        ] {
            push_word(&mut out, w, self.endian);
        }
        if has_dysymtab {
            let mut words = [0u32; DYSYMTAB_SIZE / 4];
            words[0] = 0xb;
            words[1] = DYSYMTAB_SIZE as u32;
            words[14] = indirectsymoff as u32;
            words[15] = self.indirect.len() as u32;
            for w in words {
                push_word(&mut out, w, self.endian);
            }
        }

        out.resize(segment_end, 0);
        for (pending, off) in self.sections.iter().zip(&offsets) {
            let off = *off as usize;
            out[off..off + pending.contents.len()].copy_from_slice(&pending.contents);
        }
        out.extend(nlists);
        for index in &self.indirect {
            push_word(&mut out, *index, self.endian);
        }
        out.extend(strings);

        Image {
            bytes: out,
            addrs,
            offsets,
        }
    }
}
