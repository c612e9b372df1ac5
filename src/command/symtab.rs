use nom::{
    number::{
        complete::{u16 as half, u32 as word, u8 as byte},
        Endianness,
    },
    sequence, IResult,
};
use nom_derive::Nom;
use num_derive::FromPrimitive;

use crate::error::{ProcessError, ProcessResult};
use crate::helpers::{parse_endian, string_upto_null_terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum NlistTypeType {
    Undefined = 0x0,
    Absolute = 0x2,
    Section = 0xe,
    PreboundUndefined = 0xc,
    Indirect = 0xa,
}

impl NlistTypeType {
    pub const NLIST_TYPE_TYPE_BITMASK: u8 = 0x0e;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlistType {
    pub stab: bool,
    pub pext: bool,
    pub type_: Option<NlistTypeType>,
    pub ext: bool,
}

impl NlistType {
    pub const NLIST_TYPE_STAB_BITMASK: u8 = 0xe0;
    pub const NLIST_TYPE_PEXT_BITMASK: u8 = 0x10;
    pub const NLIST_TYPE_EXT_BITMASK: u8 = 0x01;

    pub fn from_raw(n_type: u8) -> NlistType {
        NlistType {
            stab: n_type & Self::NLIST_TYPE_STAB_BITMASK != 0,
            pext: n_type & Self::NLIST_TYPE_PEXT_BITMASK != 0,
            type_: num::FromPrimitive::from_u8(n_type & NlistTypeType::NLIST_TYPE_TYPE_BITMASK),
            ext: n_type & Self::NLIST_TYPE_EXT_BITMASK != 0,
        }
    }
}

/// A 32-bit symbol table entry with its name resolved from the string pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlist {
    pub name: String,
    pub n_type: NlistType,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u32,
}

impl Nlist {
    pub const SIZE: usize = 12;

    pub fn parse<'a>(bytes: &'a [u8], strings: &[u8], endian: Endianness) -> IResult<&'a [u8], Self> {
        let (cursor, (n_strx, n_type, n_sect, n_desc, n_value)) =
            sequence::tuple((word(endian), byte, byte, half(endian), word(endian)))(bytes)?;

        let name = match strings.get(n_strx as usize..) {
            Some(tail) if n_strx != 0 => string_upto_null_terminator(tail)
                .map(|(_, s)| s)
                .unwrap_or_default(),
            _ => String::new(),
        };

        Ok((
            cursor,
            Nlist {
                name,
                n_type: NlistType::from_raw(n_type),
                n_sect,
                n_desc,
                n_value,
            },
        ))
    }

    /// A symbol defined in a numbered section, as opposed to a stab or import.
    pub fn is_section_symbol(&self) -> bool {
        !self.n_type.stab && self.n_type.type_ == Some(NlistTypeType::Section)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Nom)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

impl SymtabCommand {
    pub fn parse(ldcmd: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        parse_endian(ldcmd, endian)
    }

    /// Reads every entry of the symbol table out of the image.
    pub fn symbols(&self, image: &[u8], endian: Endianness) -> ProcessResult<Vec<Nlist>> {
        let size = image.len() as u64;
        let table_len = self.nsyms as u64 * Nlist::SIZE as u64;
        if self.symoff as u64 + table_len > size {
            return Err(ProcessError::truncated("symbol table", self.symoff as u64, table_len, size));
        }
        if self.stroff as u64 + self.strsize as u64 > size {
            return Err(ProcessError::truncated(
                "string table",
                self.stroff as u64,
                self.strsize as u64,
                size,
            ));
        }

        let strings = &image[self.stroff as usize..(self.stroff + self.strsize) as usize];
        let mut cursor = &image[self.symoff as usize..];
        let mut symbols = Vec::with_capacity(self.nsyms as usize);
        for i in 0..self.nsyms {
            let (rest, sym) = Nlist::parse(cursor, strings, endian)
                .map_err(|_| ProcessError::Parsing(format!("unable to parse nlist {}", i)))?;
            symbols.push(sym);
            cursor = rest;
        }
        Ok(symbols)
    }
}
