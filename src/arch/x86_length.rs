//! Instruction lengths for 32-bit x86 code, enough to walk a section one
//! instruction at a time without a disassembler.

/// Decoded ModR/M byte.
#[derive(Debug, Clone, Copy)]
struct ModRM {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl ModRM {
    fn parse(byte: u8) -> Self {
        ModRM {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    /// Bytes taken by the ModR/M byte, any SIB byte and the displacement.
    fn length(&self, rest: &[u8], address16: bool) -> Option<usize> {
        if self.mode == 3 {
            return Some(1);
        }
        if address16 {
            let disp = match self.mode {
                1 => 1,
                2 => 2,
                _ if self.rm == 6 => 2,
                _ => 0,
            };
            return Some(1 + disp);
        }

        let mut len = 1;
        let mut disp = match self.mode {
            1 => 1,
            2 => 4,
            _ if self.rm == 5 => 4,
            _ => 0,
        };
        if self.rm == 4 {
            let sib = *rest.get(1)?;
            len += 1;
            if self.mode == 0 && sib & 7 == 5 {
                disp = 4;
            }
        }
        Some(len + disp)
    }
}

/// Operand layout after the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    None,
    Imm(usize),
    ModRM,
    ModRMImm(usize),
    /// `f6`/`f7`: the immediate only exists for `test`.
    Group3(usize),
}

fn one_byte(opcode: u8, imm: usize, address16: bool) -> Option<Shape> {
    let shape = match opcode {
        0x00..=0x3f => match opcode & 7 {
            0..=3 => Shape::ModRM,
            4 => Shape::Imm(1),
            5 => Shape::Imm(imm),
            _ => Shape::None,
        },
        0x40..=0x61 | 0x6c..=0x6f | 0x90..=0x99 | 0x9b..=0x9f | 0xa4..=0xa7 | 0xaa..=0xaf => {
            Shape::None
        }
        0x62 | 0x63 | 0x84..=0x8f | 0xc4 | 0xc5 | 0xd0..=0xd3 | 0xd8..=0xdf | 0xfe | 0xff => {
            Shape::ModRM
        }
        0x68 | 0xa9 | 0xb8..=0xbf | 0xe8 | 0xe9 => Shape::Imm(imm),
        0x6a | 0x70..=0x7f | 0xa8 | 0xb0..=0xb7 | 0xcd | 0xd4 | 0xd5 | 0xe0..=0xe7 | 0xeb => {
            Shape::Imm(1)
        }
        0x69 | 0x81 | 0xc7 => Shape::ModRMImm(imm),
        0x6b | 0x80 | 0x82 | 0x83 | 0xc0 | 0xc1 | 0xc6 => Shape::ModRMImm(1),
        0x9a | 0xea => Shape::Imm(imm + 2),
        0xa0..=0xa3 => Shape::Imm(if address16 { 2 } else { 4 }),
        0xc2 | 0xca => Shape::Imm(2),
        0xc8 => Shape::Imm(3),
        0xc3 | 0xc9 | 0xcb | 0xcc | 0xce | 0xcf | 0xd6 | 0xd7 | 0xec..=0xef | 0xf1 | 0xf4 | 0xf5
        | 0xf8..=0xfd => Shape::None,
        0xf6 => Shape::Group3(1),
        0xf7 => Shape::Group3(imm),
        _ => return None,
    };
    Some(shape)
}

fn two_byte(opcode: u8, imm: usize) -> Option<Shape> {
    let shape = match opcode {
        0x05..=0x09 | 0x0b | 0x0e | 0x30..=0x37 | 0x77 | 0xa0..=0xa2 | 0xa8..=0xaa | 0xc8..=0xcf => {
            Shape::None
        }
        0x0f | 0x3a | 0x70..=0x73 | 0xa4 | 0xac | 0xba | 0xc2 | 0xc4..=0xc6 => Shape::ModRMImm(1),
        0x80..=0x8f => Shape::Imm(imm),
        0x00..=0x03
        | 0x0d
        | 0x10..=0x23
        | 0x28..=0x2f
        | 0x38
        | 0x40..=0x7f
        | 0x90..=0x9f
        | 0xa3
        | 0xa5
        | 0xab
        | 0xad..=0xc1
        | 0xc3
        | 0xc7
        | 0xd0..=0xff => Shape::ModRM,
        _ => return None,
    };
    Some(shape)
}

/// Length of the instruction starting at `code[0]`, or `None` when the
/// bytes do not decode or run past the end.
pub fn instruction_length(code: &[u8]) -> Option<usize> {
    let mut i = 0;
    let (mut operand16, mut address16) = (false, false);
    loop {
        match *code.get(i)? {
            0x66 => operand16 = true,
            0x67 => address16 = true,
            0xf0 | 0xf2 | 0xf3 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => {}
            _ => break,
        }
        i += 1;
    }
    let imm = if operand16 { 2 } else { 4 };

    let opcode = *code.get(i)?;
    i += 1;
    let shape = if opcode == 0x0f {
        let second = *code.get(i)?;
        i += 1;
        // three byte opcodes carry the third byte ahead of ModR/M
        if matches!(second, 0x38 | 0x3a) {
            i += 1;
        }
        two_byte(second, imm)?
    } else {
        one_byte(opcode, imm, address16)?
    };

    let rest = code.get(i..)?;
    i += match shape {
        Shape::None => 0,
        Shape::Imm(n) => n,
        Shape::ModRM => ModRM::parse(*rest.first()?).length(rest, address16)?,
        Shape::ModRMImm(n) => ModRM::parse(*rest.first()?).length(rest, address16)? + n,
        Shape::Group3(n) => {
            let modrm = ModRM::parse(*rest.first()?);
            let len = modrm.length(rest, address16)?;
            if modrm.reg <= 1 {
                len + n
            } else {
                len
            }
        }
    };
    (i <= code.len()).then_some(i)
}
