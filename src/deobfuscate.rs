//! Detection and repair of multi-byte NOPs placed to throw linear
//! disassemblers out of sync.
//!
//! The sequence is `[66] 0F 1F /0` with a memory ModRM operand. Its length
//! follows from the prefix, ModRM, SIB and displacement, so a match can be
//! overwritten with the same number of single-byte `nop`s without moving
//! anything else in the file. Only matches on an instruction boundary count;
//! the same bytes inside another instruction's operands are left alone.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::arch::x86_length::instruction_length;
use crate::error::{ProcessError, ProcessResult};
use crate::machine::Arch;
use crate::macho::MachO;
use crate::sections::SectionKind;

const OPERAND_SIZE_PREFIX: u8 = 0x66;
const NOP: u8 = 0x90;

/// Addresses of every obfuscating sequence found in an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NopList {
    pub addresses: Vec<u32>,
}

impl NopList {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Length of the obfuscating sequence starting at `bytes[0]`, if one does.
pub fn nop_length(bytes: &[u8]) -> Option<usize> {
    let prefix = usize::from(bytes.first() == Some(&OPERAND_SIZE_PREFIX));
    let rest = bytes.get(prefix..)?;
    if rest.get(..2)? != [0x0f, 0x1f] {
        return None;
    }

    let modrm = *rest.get(2)?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 7;
    let rm = modrm & 7;
    if mode == 3 || reg != 0 {
        return None;
    }

    let mut len = prefix + 3;
    let mut disp = match mode {
        1 => 1,
        2 => 4,
        _ if rm == 5 => 4,
        _ => 0,
    };
    if rm == 4 {
        let sib = *rest.get(3)?;
        len += 1;
        if mode == 0 && sib & 7 == 5 {
            disp = 4;
        }
    }
    len += disp;

    (len <= bytes.len()).then_some(len)
}

/// Walks `code`, mapped at `base`, one instruction at a time and reports
/// the sequences found on instruction boundaries. Bytes that do not decode
/// are stepped over singly.
pub fn search_for_nops_in(code: &[u8], base: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < code.len() {
        let rest = &code[i..];
        match nop_length(rest) {
            Some(len) => {
                found.push(base + i as u32);
                i += len;
            }
            None => i += instruction_length(rest).unwrap_or(1),
        }
    }
    found
}

/// Checks every byte offset, including ones inside an earlier match.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceNopSearch {
    /// Stop at the first hit.
    pub only_by_existence: bool,
}

impl BruteForceNopSearch {
    pub fn search(&self, code: &[u8], base: u32) -> Vec<u32> {
        let mut found = Vec::new();
        for i in 0..code.len() {
            if nop_length(&code[i..]).is_some() {
                found.push(base + i as u32);
                if self.only_by_existence {
                    break;
                }
            }
        }
        found
    }
}

/// Reports the sequences in every text section without changing anything.
pub fn verify_nops(macho: &MachO) -> ProcessResult<NopList> {
    if macho.arch != Arch::I386 {
        return Err(ProcessError::NotApplicable("NOP verification"));
    }

    let mut list = NopList::default();
    for section in macho.sections() {
        let is_text = SectionKind::from_names(&section.segname, &section.sectname)
            .is_some_and(|kind| kind.is_text());
        if !is_text {
            continue;
        }
        let found = search_for_nops_in(macho.section_contents(section), section.addr);
        debug!(
            "({},{}): {} obfuscated sequences",
            section.segname,
            section.sectname,
            found.len()
        );
        list.addresses.extend(found);
    }

    if list.is_empty() {
        return Err(ProcessError::NoMatchesFound);
    }
    info!("found {} obfuscated sequences", list.len());
    Ok(list)
}

/// Copies `file` to `dest` with every listed sequence replaced by single
/// byte NOPs. `file` is the whole input, universal container included.
pub fn fix_nops(file: &[u8], macho: &MachO, nops: &NopList, dest: &Path) -> ProcessResult<()> {
    if nops.is_empty() {
        return Err(ProcessError::NoMatchesFound);
    }

    let mut patched = file.to_vec();
    for &addr in &nops.addresses {
        let Some(offset) = macho
            .vm_addr_to_offset(addr)
            .map(|offset| offset + macho.file_offset)
        else {
            debug!("no file offset for {:#x}", addr);
            continue;
        };
        let Some(len) = patched.get(offset..).and_then(nop_length) else {
            debug!("no obfuscated sequence at {:#x}", addr);
            continue;
        };
        patched[offset..offset + len].fill(NOP);
    }

    let write_err = |source| ProcessError::Write {
        path: dest.to_path_buf(),
        source,
    };
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&patched).map_err(write_err)?;
    tmp.persist(dest).map_err(|e| write_err(e.error))?;

    info!("wrote repaired binary to {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PATTERNS: &[&[u8]] = &[
        &[0x0f, 0x1f, 0x00],
        &[0x0f, 0x1f, 0x40, 0x00],
        &[0x0f, 0x1f, 0x44, 0x00, 0x00],
        &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
        &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];

    #[test]
    fn test_lengths() {
        for pattern in PATTERNS {
            assert_eq!(nop_length(pattern), Some(pattern.len()), "{:02x?}", pattern);
        }
        // register operand and non-zero reg field are real instructions
        assert_eq!(nop_length(&[0x0f, 0x1f, 0xc0]), None);
        assert_eq!(nop_length(&[0x0f, 0x1f, 0x08]), None);
        // disp32 with no base
        assert_eq!(nop_length(&[0x0f, 0x1f, 0x05, 1, 2, 3, 4]), Some(7));
        assert_eq!(nop_length(&[0x0f, 0x1f, 0x04, 0x25, 1, 2, 3, 4]), Some(8));
        // runs off the end
        assert_eq!(nop_length(&[0x0f, 0x1f, 0x80, 0x00]), None);
        assert_eq!(nop_length(&[0x0f]), None);
    }

    #[test]
    fn test_operand_bytes_are_not_sequences() {
        // movl $0x1f0f,%eax; nopl (%eax); ret
        let code = [0xb8, 0x0f, 0x1f, 0x00, 0x00, 0x0f, 0x1f, 0x00, 0xc3];
        assert_eq!(search_for_nops_in(&code, 0x1000), vec![0x1005]);
        // call with the pattern in its displacement
        let call = [0xe8, 0x0f, 0x1f, 0x40, 0x00, 0xc3];
        assert!(search_for_nops_in(&call, 0x1000).is_empty());
        assert_eq!(BruteForceNopSearch::default().search(&call, 0x1000), vec![0x1001]);
    }

    #[test]
    fn test_brute_force_sees_overlaps() {
        // a second sequence starting inside the displacement of the first
        let code = [0x0f, 0x1f, 0x80, 0x0f, 0x1f, 0x00, 0x00, 0x90];
        assert_eq!(search_for_nops_in(&code, 0x1000), vec![0x1000]);
        assert_eq!(BruteForceNopSearch::default().search(&code, 0x1000), vec![0x1000, 0x1003]);
        let existence = BruteForceNopSearch {
            only_by_existence: true,
        };
        assert_eq!(existence.search(&code, 0x1000), vec![0x1000]);
    }

    /// Single byte instructions: inc, dec, push, pop, nop, leave, ret.
    fn filler() -> impl Strategy<Value = Vec<u8>> {
        let single = prop_oneof![0x40u8..0x60, Just(0x90u8), Just(0xc9u8), Just(0xc3u8)];
        prop::collection::vec(single, 0..12)
    }

    proptest! {
        #[test]
        fn no_planted_patterns_no_matches(
            code in prop::collection::vec(
                any::<u8>().prop_filter("not a pattern start", |b| *b != 0x0f),
                0..24,
            ),
        ) {
            prop_assert!(search_for_nops_in(&code, 0).is_empty());
        }

        #[test]
        fn planted_patterns_are_found(
            pieces in prop::collection::vec((filler(), 0..PATTERNS.len()), 0..8),
            tail in filler(),
        ) {
            let mut code = Vec::new();
            let mut planted = Vec::new();
            for (fill, which) in &pieces {
                code.extend_from_slice(fill);
                planted.push(0x4000 + code.len() as u32);
                code.extend_from_slice(PATTERNS[*which]);
            }
            code.extend_from_slice(&tail);
            prop_assert_eq!(search_for_nops_in(&code, 0x4000), planted);
        }
    }
}
