pub mod dysymtab;
pub mod segment;
pub mod symtab;

use nom::number::Endianness;
use nom::IResult;
use num_derive::FromPrimitive;
use tracing::trace;

use crate::error::{ProcessError, ProcessResult};
use crate::header::MachHeader;

pub use dysymtab::DysymtabCommand;
pub use segment::{Section, SegmentCommand};
pub use symtab::{Nlist, SymtabCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadCommandBase {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl LoadCommandBase {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], LoadCommandBase> {
        let (bytes, cmd) = nom::number::complete::u32(endian)(bytes)?;
        let (bytes, cmdsize) = nom::number::complete::u32(endian)(bytes)?;

        Ok((bytes, LoadCommandBase { cmd, cmdsize }))
    }

    pub fn kind(&self) -> Option<LCLoadCommand> {
        num::FromPrimitive::from_u32(self.cmd)
    }
}

/// Load commands that can appear in a 32-bit image of the era.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum LCLoadCommand {
    LcSegment = 0x1,
    LcSymtab = 0x2,
    LcSymseg = 0x3,
    LcThread = 0x4,
    LcUnixThread = 0x5,
    LcDysymtab = 0xb,
    LcLoadDylib = 0xc,
    LcIdDylib = 0xd,
    LcLoadDylinker = 0xe,
    LcIdDylinker = 0xf,
    LcPreboundDylib = 0x10,
    LcRoutines = 0x11,
    LcSubFramework = 0x12,
    LcSubUmbrella = 0x13,
    LcSubClient = 0x14,
    LcSubLibrary = 0x15,
    LcTwolevelHints = 0x16,
    LcPrebindCksum = 0x17,
    LcLoadWeakDylib = 0x18 | Self::LC_REQ_DYLD,
    LcUuid = 0x1b,
    LcRpath = 0x1c | Self::LC_REQ_DYLD,
    LcCodeSignature = 0x1d,
    LcSegmentSplitInfo = 0x1e,
    LcEncryptionInfo = 0x21,
    LcDyldInfo = 0x22,
    LcDyldInfoOnly = 0x22 | Self::LC_REQ_DYLD,
    LcVersionMinMacosx = 0x24,
    LcFunctionStarts = 0x26,
}

impl LCLoadCommand {
    pub const LC_REQ_DYLD: u32 = 0x80000000;
}

/// The load commands the processor reads. Everything else is kept only as
/// its header so the command list still round-trips in count and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCommand {
    Segment(SegmentCommand),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    Other(LoadCommandBase),
}

impl LoadCommand {
    pub fn parse(ldcmd: &[u8], base: LoadCommandBase, endian: Endianness) -> ProcessResult<Self> {
        let failed = |what: &str| ProcessError::Parsing(format!("unable to parse {}", what));

        match base.kind() {
            Some(LCLoadCommand::LcSegment) => {
                let (_, cmd) =
                    SegmentCommand::parse(ldcmd, endian).map_err(|_| failed("LC_SEGMENT"))?;
                Ok(LoadCommand::Segment(cmd))
            }
            Some(LCLoadCommand::LcSymtab) => {
                let (_, cmd) =
                    SymtabCommand::parse(ldcmd, endian).map_err(|_| failed("LC_SYMTAB"))?;
                Ok(LoadCommand::Symtab(cmd))
            }
            Some(LCLoadCommand::LcDysymtab) => {
                let (_, cmd) =
                    DysymtabCommand::parse(ldcmd, endian).map_err(|_| failed("LC_DYSYMTAB"))?;
                Ok(LoadCommand::Dysymtab(cmd))
            }
            kind => {
                trace!("skipping load command {:#x} ({:?})", base.cmd, kind);
                Ok(LoadCommand::Other(base))
            }
        }
    }

    pub fn cmdsize(&self) -> u32 {
        match self {
            LoadCommand::Segment(cmd) => cmd.cmdsize,
            LoadCommand::Symtab(cmd) => cmd.cmdsize,
            LoadCommand::Dysymtab(cmd) => cmd.cmdsize,
            LoadCommand::Other(base) => base.cmdsize,
        }
    }

    pub fn parse_all(image: &[u8], header: &MachHeader) -> ProcessResult<Vec<Self>> {
        iterate_load_commands(image, header, |base, ldcmd| {
            LoadCommand::parse(ldcmd, base, header.endian)
        })
    }
}

/// Walks the load command area of a thin image, handing each command's
/// bytes to `f`. Every command must lie inside `sizeofcmds` and the image.
pub fn iterate_load_commands<F, T>(image: &[u8], header: &MachHeader, mut f: F) -> ProcessResult<Vec<T>>
where
    F: FnMut(LoadCommandBase, &[u8]) -> ProcessResult<T>,
{
    let start = header.size();
    let end = start as u64 + header.sizeofcmds as u64;
    if end > image.len() as u64 {
        return Err(ProcessError::truncated(
            "load commands",
            start as u64,
            header.sizeofcmds as u64,
            image.len() as u64,
        ));
    }

    // every command takes at least its 8 byte base
    let minimum = header.ncmds as u64 * LoadCommandBase::SIZE as u64;
    if minimum > header.sizeofcmds as u64 {
        return Err(ProcessError::truncated(
            format!("{} load commands", header.ncmds),
            start as u64,
            minimum,
            end,
        ));
    }

    let mut results = Vec::with_capacity(header.ncmds as usize);
    let mut remaining = &image[start..end as usize];
    let mut offset = start as u64;

    for i in 0..header.ncmds {
        let (_, base) = LoadCommandBase::parse(remaining, header.endian).map_err(|_| {
            ProcessError::truncated(format!("load command {}", i), offset, 8, end)
        })?;

        let cmdsize = base.cmdsize as usize;
        if cmdsize < LoadCommandBase::SIZE || cmdsize > remaining.len() {
            return Err(ProcessError::truncated(
                format!("load command {} ({:#x})", i, base.cmd),
                offset,
                base.cmdsize as u64,
                end,
            ));
        }

        results.push(f(base, &remaining[..cmdsize])?);
        remaining = &remaining[cmdsize..];
        offset += cmdsize as u64;
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MH_MAGIC;

    fn image(endian_big: bool, cmds: &[(u32, u32)]) -> Vec<u8> {
        let put = |out: &mut Vec<u8>, w: u32| {
            if endian_big {
                out.extend_from_slice(&w.to_be_bytes())
            } else {
                out.extend_from_slice(&w.to_le_bytes())
            }
        };
        let sizeofcmds: u32 = cmds.iter().map(|(_, size)| size).sum();
        let mut out = Vec::new();
        out.extend_from_slice(&MH_MAGIC.to_be_bytes()[..]);
        if !endian_big {
            out.reverse();
        }
        for w in [7, 3, 2, cmds.len() as u32, sizeofcmds, 0] {
            put(&mut out, w);
        }
        for (cmd, size) in cmds {
            put(&mut out, *cmd);
            put(&mut out, *size);
            out.extend(std::iter::repeat(0).take(*size as usize - 8));
        }
        out
    }

    #[test]
    fn test_unknown_commands_keep_their_size() {
        let bytes = image(false, &[(0x1b, 24), (0x80000028, 24)]);
        let header = MachHeader::parse(&bytes).unwrap();
        let cmds = LoadCommand::parse_all(&bytes, &header).unwrap();

        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], LoadCommand::Other(LoadCommandBase { cmd: 0x1b, .. })));
        assert_eq!(cmds.iter().map(|c| c.cmdsize()).sum::<u32>(), header.sizeofcmds);
    }

    #[test]
    fn test_command_overruns_area() {
        let mut bytes = image(true, &[(0x1b, 24)]);
        // claim 64 bytes for a 24 byte command
        bytes[MachHeader::SIZE + 7] = 64;
        let header = MachHeader::parse(&bytes).unwrap();
        assert!(matches!(
            LoadCommand::parse_all(&bytes, &header),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_command_count_exceeds_area() {
        let mut bytes = image(false, &[]);
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let header = MachHeader::parse(&bytes).unwrap();
        assert_eq!(header.ncmds, u32::MAX);
        assert!(matches!(
            LoadCommand::parse_all(&bytes, &header),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_sizeofcmds_past_end() {
        let mut bytes = image(true, &[(0x1b, 24)]);
        bytes.truncate(MachHeader::SIZE + 10);
        let header = MachHeader::parse(&bytes).unwrap();
        assert!(matches!(
            LoadCommand::parse_all(&bytes, &header),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }
}
