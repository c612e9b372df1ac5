//! The sections the processor cares about, copied out of the loaded image
//! and keyed by what their contents mean.

use std::collections::HashMap;

use nom::number::Endianness;
use tracing::debug;

use crate::command::segment::SectionType;
use crate::command::{DysymtabCommand, Nlist, Section};
use crate::helpers::{read_u32, read_u64, string_upto_null_terminator};
use crate::macho::MachO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Text,
    CoalescedText,
    CoalescedTextNt,
    ConstText,
    CString,
    Literal4,
    Literal8,
    Data,
    CoalescedData,
    CoalescedDataNt,
    ConstData,
    Dyld,
    CFString,
    NonLazySymbolPointers,
    ImportPointers,
    ObjcClass,
    ObjcMetaClass,
    ObjcInstanceVars,
    ObjcModuleInfo,
    ObjcSymbols,
    ObjcCategory,
    ObjcStringObject,
    ObjcMessageRefs,
    ObjcClassRefs,
}

impl SectionKind {
    pub fn from_names(segname: &str, sectname: &str) -> Option<SectionKind> {
        let kind = match (segname, sectname) {
            ("__TEXT", "__text") => SectionKind::Text,
            ("__TEXT", "__coalesced_text") => SectionKind::CoalescedText,
            ("__TEXT", "__textcoal_nt") => SectionKind::CoalescedTextNt,
            ("__TEXT", "__const") => SectionKind::ConstText,
            ("__TEXT", "__cstring") => SectionKind::CString,
            ("__TEXT", "__literal4") => SectionKind::Literal4,
            ("__TEXT", "__literal8") => SectionKind::Literal8,
            ("__DATA", "__data") => SectionKind::Data,
            ("__DATA", "__datacoal_nt") => SectionKind::CoalescedDataNt,
            ("__DATA", "__coalesced_data") => SectionKind::CoalescedData,
            ("__DATA", "__const") => SectionKind::ConstData,
            ("__DATA", "__dyld") => SectionKind::Dyld,
            ("__DATA", "__cfstring") => SectionKind::CFString,
            ("__DATA", "__nl_symbol_ptr") => SectionKind::NonLazySymbolPointers,
            ("__IMPORT", "__pointers") => SectionKind::ImportPointers,
            ("__OBJC", "__class") => SectionKind::ObjcClass,
            ("__OBJC", "__meta_class") => SectionKind::ObjcMetaClass,
            ("__OBJC", "__instance_vars") => SectionKind::ObjcInstanceVars,
            ("__OBJC", "__module_info") => SectionKind::ObjcModuleInfo,
            ("__OBJC", "__symbols") => SectionKind::ObjcSymbols,
            ("__OBJC", "__category") => SectionKind::ObjcCategory,
            ("__OBJC", "__string_object") => SectionKind::ObjcStringObject,
            ("__OBJC", "__message_refs") => SectionKind::ObjcMessageRefs,
            ("__OBJC", "__cls_refs") => SectionKind::ObjcClassRefs,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            SectionKind::Text | SectionKind::CoalescedText | SectionKind::CoalescedTextNt
        )
    }

}

/// Sections hex-dumped after the code when data sections are shown, in
/// output order.
pub const DUMPED_DATA: [SectionKind; 4] = [
    SectionKind::Data,
    SectionKind::CoalescedData,
    SectionKind::CoalescedDataNt,
    SectionKind::ConstData,
];

/// A section header plus a copy of its bytes.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub section: Section,
    pub contents: Vec<u8>,
    pub endian: Endianness,
}

impl SectionInfo {
    pub fn addr(&self) -> u32 {
        self.section.addr
    }

    pub fn size(&self) -> u32 {
        self.section.size
    }

    pub fn end(&self) -> u32 {
        self.section.addr.wrapping_add(self.section.size)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.section.contains(addr)
    }

    pub fn bytes_at(&self, addr: u32, len: usize) -> Option<&[u8]> {
        if !self.contains(addr) {
            return None;
        }
        let start = (addr - self.section.addr) as usize;
        self.contents.get(start..start.checked_add(len)?)
    }

    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        read_u32(self.bytes_at(addr, 4)?, self.endian)
    }

    pub fn read_u64(&self, addr: u32) -> Option<u64> {
        read_u64(self.bytes_at(addr, 8)?, self.endian)
    }

    pub fn cstring_at(&self, addr: u32) -> Option<String> {
        if !self.contains(addr) {
            return None;
        }
        let start = (addr - self.section.addr) as usize;
        let (_, s) = string_upto_null_terminator(self.contents.get(start..)?).ok()?;
        Some(s)
    }
}

/// All recognised sections of one image, plus the symbol data needed to
/// name stubs and pointers.
#[derive(Debug, Clone, Default)]
pub struct SectionTable {
    sections: HashMap<SectionKind, SectionInfo>,
    /// Stub and pointer sections resolved through the indirect symbol table.
    indirect: Vec<SectionInfo>,
    indirect_symbols: Vec<u32>,
    symbol_names: Vec<String>,
}

impl SectionTable {
    pub fn load(macho: &MachO) -> SectionTable {
        let mut table = SectionTable {
            indirect_symbols: macho.indirect_symbols.clone(),
            symbol_names: macho.symbols.iter().map(|s| s.name.clone()).collect(),
            ..Default::default()
        };

        for section in macho.sections() {
            let info = || SectionInfo {
                section: section.clone(),
                contents: macho.section_contents(section).to_vec(),
                endian: macho.endian(),
            };

            if let Some(kind) = SectionKind::from_names(&section.segname, &section.sectname) {
                debug!(
                    "section ({},{}) {:?} at {:#x}, {} bytes",
                    section.segname, section.sectname, kind, section.addr, section.size
                );
                table.sections.insert(kind, info());
            }
            if matches!(
                section.section_type(),
                Some(SectionType::SSymbolStubs)
                    | Some(SectionType::SNonLazySymbolPointers)
                    | Some(SectionType::SLazySymbolPointers)
            ) || (section.segname == "__IMPORT" && section.sectname == "__jump_table")
            {
                table.indirect.push(info());
            }
        }

        table
    }

    pub fn get(&self, kind: SectionKind) -> Option<&SectionInfo> {
        self.sections.get(&kind)
    }

    pub fn insert(&mut self, kind: SectionKind, info: SectionInfo) {
        self.sections.insert(kind, info);
    }

    /// The recognised section containing `addr`, if any.
    pub fn find(&self, addr: u32) -> Option<(SectionKind, &SectionInfo)> {
        self.sections
            .iter()
            .find(|(_, info)| info.contains(addr))
            .map(|(kind, info)| (*kind, info))
    }

    /// Text sections in the order they are processed.
    pub fn text_sections(&self) -> Vec<(SectionKind, &SectionInfo)> {
        [
            SectionKind::Text,
            SectionKind::CoalescedText,
            SectionKind::CoalescedTextNt,
        ]
        .into_iter()
        .filter_map(|kind| self.get(kind).map(|info| (kind, info)))
        .collect()
    }

    /// Names the imported symbol behind a stub or pointer slot.
    pub fn imported_symbol(&self, addr: u32) -> Option<&str> {
        let info = self.indirect.iter().find(|info| info.contains(addr))?;
        let entry_size = match info.section.section_type() {
            Some(SectionType::SSymbolStubs) => info.section.reserved2,
            _ if info.section.sectname == "__jump_table" => 5,
            _ => 4,
        };
        if entry_size == 0 {
            return None;
        }
        let slot = (addr - info.addr()) / entry_size;
        let first = info.section.reserved1.checked_add(slot)?;
        let index = *self.indirect_symbols.get(first as usize)?;
        if DysymtabCommand::is_special_index(index) {
            return None;
        }
        self.symbol_names
            .get(index as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Symbols that name code: defined in a text section, sorted by address.
pub fn function_symbols(macho: &MachO) -> Vec<Nlist> {
    let ordinals: Vec<bool> = macho
        .sections()
        .map(|s| {
            SectionKind::from_names(&s.segname, &s.sectname)
                .map(|k| k.is_text())
                .unwrap_or(false)
        })
        .collect();

    let mut syms: Vec<Nlist> = macho
        .symbols
        .iter()
        .filter(|sym| {
            sym.is_section_symbol()
                && sym.n_sect > 0
                && ordinals
                    .get(sym.n_sect as usize - 1)
                    .copied()
                    .unwrap_or(false)
        })
        .cloned()
        .collect();
    syms.sort_by_key(|s| s.n_value);
    syms
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn section_info(seg: &str, sect: &str, addr: u32, contents: Vec<u8>) -> SectionInfo {
        SectionInfo {
            section: Section {
                sectname: sect.to_string(),
                segname: seg.to_string(),
                addr,
                size: contents.len() as u32,
                offset: 0,
                align: 2,
                reloff: 0,
                nreloc: 0,
                flags: 0,
                reserved1: 0,
                reserved2: 0,
            },
            contents,
            endian: Endianness::Big,
        }
    }

    #[test]
    fn test_section_reads() {
        let info = section_info("__TEXT", "__cstring", 0x2000, b"hello\0world\0".to_vec());
        assert_eq!(info.cstring_at(0x2006).as_deref(), Some("world"));
        assert_eq!(info.cstring_at(0x200c), None);
        assert_eq!(info.read_u32(0x2000), Some(0x68656c6c));
        assert_eq!(info.read_u32(0x200a), None);
    }

    #[test]
    fn test_find_and_kinds() {
        let mut table = SectionTable::default();
        table.insert(
            SectionKind::CString,
            section_info("__TEXT", "__cstring", 0x2000, vec![0; 16]),
        );
        table.insert(
            SectionKind::Text,
            section_info("__TEXT", "__text", 0x1000, vec![0; 16]),
        );
        assert_eq!(table.find(0x2004).map(|(k, _)| k), Some(SectionKind::CString));
        assert!(table.find(0x100f).is_some_and(|(k, _)| k.is_text()));
        assert!(table.find(0x1010).is_none());
        assert_eq!(
            SectionKind::from_names("__IMPORT", "__pointers"),
            Some(SectionKind::ImportPointers)
        );
        assert!(DUMPED_DATA.contains(&SectionKind::ConstData));
        assert!(!DUMPED_DATA.contains(&SectionKind::CString));
    }

    #[test]
    fn test_imported_symbol_through_stubs() {
        let mut stubs = section_info("__TEXT", "__symbol_stub", 0x3000, vec![0; 12]);
        stubs.section.flags = SectionType::SSymbolStubs as u32;
        stubs.section.reserved1 = 1;
        stubs.section.reserved2 = 6;

        let table = SectionTable {
            indirect: vec![stubs],
            indirect_symbols: vec![0, 2, 1],
            symbol_names: vec!["_a".into(), "_printf".into(), "_malloc".into()],
            ..Default::default()
        };
        assert_eq!(table.imported_symbol(0x3000), Some("_malloc"));
        assert_eq!(table.imported_symbol(0x3006), Some("_printf"));
        assert_eq!(table.imported_symbol(0x300c), None);
    }

    #[test]
    fn test_stub_table_index_out_of_range() {
        let mut stubs = section_info("__TEXT", "__symbol_stub", 0x3000, vec![0; 12]);
        stubs.section.flags = SectionType::SSymbolStubs as u32;
        stubs.section.reserved1 = u32::MAX;
        stubs.section.reserved2 = 6;

        let table = SectionTable {
            indirect: vec![stubs],
            indirect_symbols: vec![0, 1],
            symbol_names: vec!["_a".into(), "_b".into()],
            ..Default::default()
        };
        assert_eq!(table.imported_symbol(0x3000), None);
        assert_eq!(table.imported_symbol(0x3006), None);
    }
}
