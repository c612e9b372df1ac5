use nom::number::complete::be_u32;

use crate::error::{ProcessError, ProcessResult};
use crate::machine::CpuType;

pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;

/// Universal headers are always big-endian on disk.
#[derive(Debug, Clone, Copy)]
pub struct FatHeader {
    pub magic: u32,
    pub nfat_arch: u32,
}

impl FatHeader {
    pub const SIZE: usize = 8;

    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], FatHeader> {
        let (input, magic) = nom::combinator::verify(be_u32, |m: &u32| *m == FAT_MAGIC)(input)?;
        let (input, nfat_arch) = be_u32(input)?;

        Ok((input, FatHeader { magic, nfat_arch }))
    }

    pub fn is_fat_magic(bytes: &[u8]) -> bool {
        matches!(be_u32::<_, nom::error::Error<&[u8]>>(bytes), Ok((_, FAT_MAGIC)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FatArch32 {
    pub cputype: CpuType,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

impl FatArch32 {
    pub const SIZE: usize = 20;

    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], FatArch32> {
        let (input, cputype) = CpuType::parse(input, nom::number::Endianness::Big)?;
        let (input, cpusubtype) = be_u32(input)?;
        let (input, offset) = be_u32(input)?;
        let (input, size) = be_u32(input)?;
        let (input, align) = be_u32(input)?;

        Ok((
            input,
            FatArch32 {
                cputype,
                cpusubtype,
                offset,
                size,
                align,
            },
        ))
    }

    /// The byte range of this slice, checked against the container size.
    pub fn range(&self, file_size: usize) -> ProcessResult<std::ops::Range<usize>> {
        let start = self.offset as usize;
        let end = start.saturating_add(self.size as usize);
        if end > file_size {
            return Err(ProcessError::truncated(
                format!("{} slice", self.cputype),
                self.offset as u64,
                self.size as u64,
                file_size as u64,
            ));
        }
        Ok(start..end)
    }
}

/// Parses a universal header followed by its architecture table.
pub fn parse_fat(bytes: &[u8]) -> ProcessResult<(FatHeader, Vec<FatArch32>)> {
    let (mut rest, header) = FatHeader::parse(bytes)
        .map_err(|_| ProcessError::Parsing("unable to parse universal header".to_string()))?;

    let needed = FatHeader::SIZE as u64 + header.nfat_arch as u64 * FatArch32::SIZE as u64;
    if needed > bytes.len() as u64 {
        return Err(ProcessError::truncated(
            "universal architecture table",
            0,
            needed,
            bytes.len() as u64,
        ));
    }

    let mut archs = Vec::with_capacity(header.nfat_arch as usize);
    for _ in 0..header.nfat_arch {
        let (next, arch) = FatArch32::parse(rest)
            .map_err(|_| ProcessError::Parsing("unable to parse fat_arch".to_string()))?;
        archs.push(arch);
        rest = next;
    }

    Ok((header, archs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat_bytes(archs: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        out.extend_from_slice(&(archs.len() as u32).to_be_bytes());
        for (cpu, offset, size) in archs {
            for word in [*cpu, 0, *offset, *size, 12] {
                out.extend_from_slice(&word.to_be_bytes());
            }
        }
        out
    }

    #[test]
    fn test_parse_fat_table() {
        let mut bytes = fat_bytes(&[(18, 0x1000, 0x20), (7, 0x2000, 0x20)]);
        bytes.resize(0x2020, 0);

        assert!(FatHeader::is_fat_magic(&bytes));
        let (header, archs) = parse_fat(&bytes).unwrap();
        assert_eq!(header.nfat_arch, 2);
        assert_eq!(archs[0].cputype, CpuType::PowerPC);
        assert_eq!(archs[1].cputype, CpuType::I386);
        assert_eq!(archs[1].range(bytes.len()).unwrap(), 0x2000..0x2020);
    }

    #[test]
    fn test_slice_outside_file() {
        let bytes = fat_bytes(&[(7, 0x1000, 0x20)]);
        let (_, archs) = parse_fat(&bytes).unwrap();
        assert!(matches!(
            archs[0].range(bytes.len()),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_table_longer_than_file() {
        let mut bytes = fat_bytes(&[]);
        bytes[7] = 4;
        assert!(matches!(
            parse_fat(&bytes),
            Err(ProcessError::TruncatedFile { .. })
        ));
    }
}
