use nom::{number::Endianness, IResult};
use num_derive::FromPrimitive;
use strum_macros::{Display, EnumString};

#[repr(usize)]
#[derive(Debug, Copy, Clone, FromPrimitive)]
pub enum CpuABI {
    ABI64 = 0x01000000,
    ABI64_32 = 0x02000000,
}
impl CpuABI {
    pub const MASK: usize = 0xff000000;
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, FromPrimitive, PartialEq, Eq, Display)]
pub enum CpuType {
    Any = 0,
    Vax = 1,
    Mc680x0 = 6,
    I386 = 7,
    X86_64 = 7 | CpuABI::ABI64 as u32,
    Mc98000 = 10,
    Hppa = 11,
    Arm = 12,
    Arm64 = 12 | CpuABI::ABI64 as u32,
    Arm64_32 = 12 | CpuABI::ABI64_32 as u32,
    Mc88000 = 13,
    Sparc = 14,
    I860 = 15,
    PowerPC = 18,
    PowerPC64 = 18 | CpuABI::ABI64 as u32,
    Unknown = !0,
}

impl CpuType {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], CpuType> {
        let (bytes, cputype) = nom::number::complete::u32(endian)(bytes)?;
        Ok((bytes, Self::from_raw(cputype)))
    }

    pub fn from_raw(cputype: u32) -> CpuType {
        num::FromPrimitive::from_u32(cputype).unwrap_or(CpuType::Unknown)
    }

    /// The processing architecture for this CPU type, if one exists.
    pub fn arch(&self) -> Option<Arch> {
        match self {
            CpuType::PowerPC => Some(Arch::Ppc),
            CpuType::I386 => Some(Arch::I386),
            _ => None,
        }
    }
}

/// The two instruction sets this crate annotates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Arch {
    #[strum(to_string = "ppc", ascii_case_insensitive)]
    Ppc,
    #[strum(to_string = "i386", serialize = "x86", ascii_case_insensitive)]
    I386,
}

impl Arch {
    pub fn cputype(&self) -> CpuType {
        match self {
            Arch::Ppc => CpuType::PowerPC,
            Arch::I386 => CpuType::I386,
        }
    }

    /// Native byte order of the instruction set.
    pub fn endianness(&self) -> Endianness {
        match self {
            Arch::Ppc => Endianness::Big,
            Arch::I386 => Endianness::Little,
        }
    }
}
