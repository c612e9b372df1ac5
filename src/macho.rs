use nom::number::Endianness;
use tracing::{debug, warn};

use crate::command::{DysymtabCommand, LoadCommand, Nlist, Section, SegmentCommand};
use crate::error::{ProcessError, ProcessResult};
use crate::fat::{parse_fat, FatArch32, FatHeader};
use crate::header::MachHeader;
use crate::helpers::{read_u32, string_upto_null_terminator};
use crate::machine::{Arch, CpuType};

/// One loaded 32-bit Mach-O image. For universal files this is the selected
/// slice; `file_offset` locates it inside the container.
#[derive(Debug, Clone)]
pub struct MachO {
    pub header: MachHeader,
    pub arch: Arch,
    pub load_commands: Vec<LoadCommand>,
    pub segments: Vec<SegmentCommand>,
    pub symbols: Vec<Nlist>,
    pub indirect_symbols: Vec<u32>,
    pub file_offset: usize,
    image: Vec<u8>,
}

impl MachO {
    /// Loads the slice for `arch` out of a thin or universal file. With no
    /// requested architecture the first supported slice wins.
    pub fn parse(file: &[u8], arch: Option<Arch>) -> ProcessResult<MachO> {
        if FatHeader::is_fat_magic(file) {
            let (_, archs) = parse_fat(file)?;
            let slice = select_slice(&archs, arch)?;
            let range = slice.range(file.len())?;
            debug!(
                "selected {} slice at {:#x} ({} bytes)",
                slice.cputype, range.start, slice.size
            );
            let offset = range.start;
            return Self::parse_thin(&file[range], offset, arch);
        }

        Self::parse_thin(file, 0, arch)
    }

    fn parse_thin(image: &[u8], file_offset: usize, wanted: Option<Arch>) -> ProcessResult<MachO> {
        let header = MachHeader::parse(image)?;
        let arch = header
            .cputype
            .arch()
            .ok_or_else(|| ProcessError::UnsupportedArchitecture(header.cputype.to_string()))?;
        if let Some(wanted) = wanted {
            if wanted != arch {
                return Err(ProcessError::ArchitectureNotFound(wanted.to_string()));
            }
        }

        let load_commands = LoadCommand::parse_all(image, &header)?;

        let mut segments = Vec::new();
        let mut symbols = Vec::new();
        let mut dysymtab: Option<&DysymtabCommand> = None;
        for cmd in &load_commands {
            match cmd {
                LoadCommand::Segment(seg) => {
                    check_segment(seg, image.len())?;
                    segments.push(seg.clone());
                }
                LoadCommand::Symtab(symtab) => {
                    symbols = symtab.symbols(image, header.endian)?;
                }
                LoadCommand::Dysymtab(cmd) => dysymtab = Some(cmd),
                LoadCommand::Other(_) => {}
            }
        }

        let indirect_symbols = match dysymtab {
            Some(cmd) => cmd.indirect_symbols(image, header.endian)?,
            None => Vec::new(),
        };

        debug!(
            "loaded {} image: {} load commands, {} segments, {} symbols",
            arch,
            load_commands.len(),
            segments.len(),
            symbols.len()
        );

        Ok(MachO {
            header,
            arch,
            load_commands,
            segments,
            symbols,
            indirect_symbols,
            file_offset,
            image: image.to_vec(),
        })
    }

    /// Architectures present in a thin or universal file.
    pub fn archs_in(file: &[u8]) -> ProcessResult<Vec<CpuType>> {
        if FatHeader::is_fat_magic(file) {
            let (_, archs) = parse_fat(file)?;
            return Ok(archs.iter().map(|a| a.cputype).collect());
        }
        Ok(vec![MachHeader::parse(file)?.cputype])
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn endian(&self) -> Endianness {
        self.header.endian
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.segments.iter().flat_map(|seg| seg.sections.iter())
    }

    pub fn section(&self, segname: &str, sectname: &str) -> Option<&Section> {
        self.sections()
            .find(|s| s.segname == segname && s.sectname == sectname)
    }

    pub fn section_contents(&self, section: &Section) -> &[u8] {
        if !section.has_file_contents() {
            return &[];
        }
        let start = section.offset as usize;
        self.image
            .get(start..start + section.size as usize)
            .unwrap_or(&[])
    }

    pub fn vm_addr_to_offset(&self, vm_addr: u32) -> Option<usize> {
        let seg = self
            .segments
            .iter()
            .find(|seg| seg.vmaddr <= vm_addr && vm_addr - seg.vmaddr < seg.filesize)?;
        Some((vm_addr - seg.vmaddr + seg.fileoff) as usize)
    }
}

/// Read access to an image by virtual address.
pub trait AddressSpace {
    fn endian(&self) -> Endianness;

    /// Everything mapped from `vm_addr` to the end of its region.
    fn bytes_from(&self, vm_addr: u32) -> Option<&[u8]>;

    fn bytes_at(&self, vm_addr: u32, len: usize) -> Option<&[u8]> {
        self.bytes_from(vm_addr)?.get(..len)
    }

    fn read_u32(&self, vm_addr: u32) -> Option<u32> {
        read_u32(self.bytes_at(vm_addr, 4)?, self.endian())
    }

    fn read_cstring(&self, vm_addr: u32) -> Option<String> {
        if vm_addr == 0 {
            return None;
        }
        let (_, s) = string_upto_null_terminator(self.bytes_from(vm_addr)?).ok()?;
        Some(s)
    }
}

impl AddressSpace for MachO {
    fn endian(&self) -> Endianness {
        self.header.endian
    }

    fn bytes_from(&self, vm_addr: u32) -> Option<&[u8]> {
        let seg = self
            .segments
            .iter()
            .find(|seg| seg.vmaddr <= vm_addr && vm_addr - seg.vmaddr < seg.filesize)?;
        let start = (vm_addr - seg.vmaddr + seg.fileoff) as usize;
        let end = (seg.fileoff + seg.filesize) as usize;
        self.image.get(start..end)
    }
}

fn select_slice(archs: &[FatArch32], wanted: Option<Arch>) -> ProcessResult<&FatArch32> {
    match wanted {
        Some(arch) => archs
            .iter()
            .find(|a| a.cputype == arch.cputype())
            .ok_or_else(|| ProcessError::ArchitectureNotFound(arch.to_string())),
        None => archs.iter().find(|a| a.cputype.arch().is_some()).ok_or_else(|| {
            warn!("no supported slice among {:?}", archs.iter().map(|a| a.cputype).collect::<Vec<_>>());
            ProcessError::ArchitectureNotFound("ppc or i386".to_string())
        }),
    }
}

fn check_segment(seg: &SegmentCommand, size: usize) -> ProcessResult<()> {
    let size = size as u64;
    if seg.fileoff as u64 + seg.filesize as u64 > size {
        return Err(ProcessError::truncated(
            format!("segment {}", seg.segname),
            seg.fileoff as u64,
            seg.filesize as u64,
            size,
        ));
    }
    for sect in seg.sections.iter().filter(|s| s.has_file_contents()) {
        if sect.offset as u64 + sect.size as u64 > size {
            return Err(ProcessError::truncated(
                format!("section ({},{})", sect.segname, sect.sectname),
                sect.offset as u64,
                sect.size as u64,
                size,
            ));
        }
    }
    Ok(())
}
