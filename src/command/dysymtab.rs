use nom::{number::Endianness, IResult};
use nom_derive::Nom;

use crate::error::{ProcessError, ProcessResult};
use crate::helpers::{parse_endian, read_u32};

#[derive(Debug, Clone, PartialEq, Eq, Nom)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

impl DysymtabCommand {
    pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
    pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

    pub fn parse(ldcmd: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        parse_endian(ldcmd, endian)
    }

    /// The indirect symbol table: one symbol table index per stub or pointer slot.
    pub fn indirect_symbols(&self, image: &[u8], endian: Endianness) -> ProcessResult<Vec<u32>> {
        let start = self.indirectsymoff as u64;
        let len = self.nindirectsyms as u64 * 4;
        if start + len > image.len() as u64 {
            return Err(ProcessError::truncated(
                "indirect symbol table",
                start,
                len,
                image.len() as u64,
            ));
        }

        Ok(image[start as usize..(start + len) as usize]
            .chunks_exact(4)
            .filter_map(|chunk| read_u32(chunk, endian))
            .collect())
    }

    /// True for entries that name no symbol (local or absolute slots).
    pub fn is_special_index(index: u32) -> bool {
        index & (Self::INDIRECT_SYMBOL_LOCAL | Self::INDIRECT_SYMBOL_ABS) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(indirectsymoff: u32, nindirectsyms: u32) -> DysymtabCommand {
        let mut words = vec![0xbu32, 80];
        words.resize(20, 0);
        words[14] = indirectsymoff;
        words[15] = nindirectsyms;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        DysymtabCommand::parse(&bytes, Endianness::Little).unwrap().1
    }

    #[test]
    fn test_indirect_symbols() {
        let cmd = command(4, 3);
        assert_eq!(cmd.cmdsize, 80);
        let mut image = vec![0u8; 4];
        for index in [5u32, DysymtabCommand::INDIRECT_SYMBOL_LOCAL, 2] {
            image.extend_from_slice(&index.to_le_bytes());
        }
        let table = cmd.indirect_symbols(&image, Endianness::Little).unwrap();
        assert_eq!(table, vec![5, 0x80000000, 2]);
        assert!(DysymtabCommand::is_special_index(table[1]));
        assert!(!DysymtabCommand::is_special_index(table[2]));
    }

    #[test]
    fn test_indirect_table_past_end() {
        let cmd = command(0, 8);
        assert!(cmd.indirect_symbols(&[0u8; 12], Endianness::Little).is_err());
    }
}
