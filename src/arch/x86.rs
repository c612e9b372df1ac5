use super::{parse_number, ArchSpecifics, Context, DataRef, Flow, SendKind, ThunkInfo};
use crate::lines::{Line, LineList};
use crate::machine::Arch;
use crate::state::{GPRegisterInfo, MachineState, STACK_SIZE};

pub const REGISTER_COUNT: usize = 8;
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

/// Frame offset of the first argument, where methods find `self`.
pub const SELF_OFFSET: i32 = 8;

const MNEMONICS: &[&str] = &[
    "mov", "lea", "add", "sub", "xor", "and", "or", "cmp", "test", "push", "pop", "call", "jmp",
    "ret", "inc", "dec", "int", "leave", "nop", "mul", "imul", "div", "idiv", "xchg", "xadd",
    "cmpxchg", "movs", "stos", "lods", "cmps", "scas", "pusha", "popa", "pushf", "popf",
];

/// Drops the AT&T size suffix from mnemonics that take one, and a `rep/`
/// style prefix.
fn base_mnemonic(mnemonic: &str) -> &str {
    let mnemonic = mnemonic.rsplit('/').next().unwrap_or(mnemonic);
    if MNEMONICS.contains(&mnemonic) {
        return mnemonic;
    }
    match mnemonic.strip_suffix(['l', 'w', 'b']) {
        Some(base) if MNEMONICS.contains(&base) => base,
        _ => mnemonic,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register index, and whether the full 32 bits are named.
    Reg(usize, bool),
    Imm(u32),
    Mem {
        base: Option<usize>,
        index: Option<usize>,
        disp: i32,
    },
    Other,
}

fn register(name: &str) -> Option<(usize, bool)> {
    const FULL: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    const WORD: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
    const LOW: [&str; 4] = ["al", "cl", "dl", "bl"];
    const HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];

    let name = name.strip_prefix('%')?;
    if let Some(i) = FULL.iter().position(|r| *r == name) {
        return Some((i, true));
    }
    [&WORD[..], &LOW[..], &HIGH[..]]
        .iter()
        .find_map(|set| set.iter().position(|r| *r == name))
        .map(|i| (i, false))
}

impl Operand {
    pub fn parse(text: &str) -> Operand {
        let text = text.trim().trim_start_matches('*');
        if let Some(imm) = text.strip_prefix('$') {
            return parse_number(imm)
                .map(|v| Operand::Imm(v as u32))
                .unwrap_or(Operand::Other);
        }
        if text.starts_with('%') {
            return register(text)
                .map(|(reg, full)| Operand::Reg(reg, full))
                .unwrap_or(Operand::Other);
        }

        let (disp_text, inner) = match text.find('(') {
            Some(open) => (&text[..open], text[open + 1..].trim_end_matches(')')),
            None => (text, ""),
        };
        let disp = if disp_text.is_empty() {
            0
        } else {
            match parse_number(disp_text) {
                Some(v) => v as u32 as i32,
                None => return Operand::Other,
            }
        };
        let mut parts = inner.split(',').map(str::trim);
        let base = parts.next().and_then(register).map(|(r, _)| r);
        let index = parts.next().and_then(register).map(|(r, _)| r);
        Operand::Mem { base, index, disp }
    }
}

/// Splits an operand list on commas outside parentheses.
pub fn split_operands(operands: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0, 0);
    for (i, c) in operands.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(operands[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = operands[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

struct Decoded<'a> {
    mnemonic: &'a str,
    operands: Vec<Operand>,
    raw: Vec<&'a str>,
}

fn decode(line: &Line) -> Option<Decoded<'_>> {
    let (mnemonic, operands) = line.instruction()?;
    let raw = split_operands(operands);
    Some(Decoded {
        mnemonic: base_mnemonic(mnemonic),
        operands: raw.iter().map(|op| Operand::parse(op)).collect(),
        raw,
    })
}

/// A direct branch target written as a bare address.
fn direct_target(raw: &[&str]) -> Option<u32> {
    match raw {
        [target] if !target.starts_with('*') && !target.contains('(') => {
            parse_number(target).map(|v| v as u32)
        }
        _ => None,
    }
}

/// Registers an instruction writes without naming them as its destination.
fn implicit_writes(mnemonic: &str, operands: &[Operand]) -> &'static [usize] {
    match (mnemonic, operands.len()) {
        ("mul" | "imul" | "div" | "idiv", 1) => &[EAX, EDX],
        ("cltd" | "cwtd" | "cdq" | "cwd", _) => &[EDX],
        ("cwtl" | "cbtw" | "cwde" | "cbw", _) => &[EAX],
        ("rdtsc", _) => &[EAX, EDX],
        ("cpuid", _) => &[EAX, EBX, ECX, EDX],
        ("movs" | "cmps", _) => &[ECX, ESI, EDI],
        ("stos" | "scas", _) => &[ECX, EDI],
        ("lods", _) => &[EAX, ECX, ESI],
        ("rep" | "repe" | "repz" | "repne" | "repnz", _) => &[EAX, ECX, ESI, EDI],
        _ => &[],
    }
}

fn instruction_length(line: &Line) -> u32 {
    (line.info.code.len() / 2) as u32
}

pub struct X86Specifics;

impl X86Specifics {
    fn value_of(state: &MachineState, operand: &Operand, ctx: &Context) -> GPRegisterInfo {
        match *operand {
            Operand::Imm(value) => GPRegisterInfo::known(value),
            Operand::Reg(reg, true) => state.get(reg),
            Operand::Mem {
                base: Some(EBP),
                index: None,
                disp,
            } => state.local_self(disp).unwrap_or_default(),
            Operand::Mem {
                base: Some(base),
                index: None,
                disp,
            } if base != ESP => match state.get(base).valid_value() {
                Some(addr) => Self::read(ctx, addr.wrapping_add(disp as u32)),
                None => GPRegisterInfo::default(),
            },
            Operand::Mem {
                base: None,
                index: None,
                disp,
            } => Self::read(ctx, disp as u32),
            _ => GPRegisterInfo::default(),
        }
    }

    fn read(ctx: &Context, addr: u32) -> GPRegisterInfo {
        ctx.mem
            .read_u32(addr)
            .map(GPRegisterInfo::known)
            .unwrap_or_default()
    }

    fn store(state: &mut MachineState, dst: &Operand, value: GPRegisterInfo) {
        match *dst {
            Operand::Reg(ESP, _) => {
                state.invalidate(ESP);
                state.clear_stack();
            }
            Operand::Reg(reg, true) => state.set(reg, value),
            Operand::Reg(reg, false) => state.invalidate(reg),
            Operand::Mem {
                base: Some(ESP),
                index: None,
                disp,
            } if disp >= 0 && disp % 4 == 0 && ((disp / 4) as usize) < STACK_SIZE => {
                state.set_stack_slot((disp / 4) as usize, value);
            }
            Operand::Mem {
                base: Some(EBP),
                index: None,
                disp,
            } => {
                if value.class.is_some() {
                    state.set_local_self(disp, value);
                } else {
                    state.forget_local(disp);
                }
            }
            _ => {}
        }
    }

    fn invalidate_destination(state: &mut MachineState, operands: &[Operand]) {
        if let Some(Operand::Reg(reg, _)) = operands.last() {
            state.invalidate(*reg);
            if *reg == ESP {
                state.clear_stack();
            }
        }
    }

    fn invalidate_registers(state: &mut MachineState, operands: &[Operand]) {
        for operand in operands {
            if let Operand::Reg(reg, _) = operand {
                state.invalidate(*reg);
            }
        }
    }
}

impl ArchSpecifics for X86Specifics {
    fn arch(&self) -> Arch {
        Arch::I386
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn return_register(&self) -> usize {
        EAX
    }

    /// Calls and jumps of every encoding. `ff` only counts with a ModRM
    /// reg field naming an indirect call or jump.
    fn keeps_verbose(&self, line: &Line) -> bool {
        match line.info.code_bytes().as_slice() {
            [0xe8 | 0xe9 | 0xeb | 0x9a, ..] => true,
            [0x70..=0x7f, ..] | [0xe3, ..] => true,
            [0x0f, 0x80..=0x8f, ..] => true,
            [0xff, modrm, ..] => matches!((modrm >> 3) & 7, 2..=5),
            _ => false,
        }
    }

    /// `push %ebp; mov %esp,%ebp` following a return, jump or padding.
    fn starts_function(&self, lines: &LineList, index: usize) -> bool {
        let Some(current) = lines.plain(index) else {
            return false;
        };
        if current.info.code_bytes().first() != Some(&0x55) {
            return false;
        }
        let next = (index + 1..lines.len())
            .filter_map(|i| lines.plain(i))
            .find(|line| line.info.is_code);
        let sets_frame = next.is_some_and(|line| {
            matches!(line.info.code_bytes().get(..2), Some([0x89, 0xe5]) | Some([0x8b, 0xec]))
        });
        if !sets_frame {
            return false;
        }

        let previous = (0..index)
            .rev()
            .filter_map(|i| lines.plain(i))
            .find(|line| line.info.is_code);
        match previous {
            None => true,
            Some(prev) => {
                !self.flow(prev).falls_through() || prev.info.code_bytes().first() == Some(&0x90)
            }
        }
    }

    fn flow(&self, line: &Line) -> Flow {
        let Some(decoded) = decode(line) else {
            return Flow::Next;
        };
        match decoded.mnemonic {
            "ret" => Flow::Return,
            "jmp" => Flow::Jump(direct_target(&decoded.raw)),
            "call" => Flow::Call(direct_target(&decoded.raw)),
            m if m.starts_with('j') => match direct_target(&decoded.raw) {
                Some(target) => Flow::Branch(target),
                None => Flow::Next,
            },
            _ => Flow::Next,
        }
    }

    fn enter_function(&self, state: &mut MachineState, receiver: Option<GPRegisterInfo>) {
        state.reset();
        if let Some(receiver) = receiver {
            state.set_local_self(SELF_OFFSET, receiver);
        }
    }

    fn update_registers(&self, state: &mut MachineState, line: &Line, ctx: &Context) {
        let Some(decoded) = decode(line) else {
            return;
        };
        let ops = &decoded.operands;

        let implicit = implicit_writes(decoded.mnemonic, ops);
        if !implicit.is_empty() {
            for &reg in implicit {
                state.invalidate(reg);
            }
            return;
        }

        match (decoded.mnemonic, ops.as_slice()) {
            ("mov", [src, dst]) => {
                let value = Self::value_of(state, src, ctx);
                Self::store(state, dst, value);
            }
            ("lea", [Operand::Mem { base, index: None, disp }, Operand::Reg(dst, _)]) => {
                let base_value = match base {
                    None => Some(0),
                    Some(ESP) | Some(EBP) => None,
                    Some(reg) => state.get(*reg).valid_value(),
                };
                match base_value {
                    Some(b) => state.set_value(*dst, b.wrapping_add(*disp as u32)),
                    None => state.invalidate(*dst),
                }
            }
            ("add" | "sub", [Operand::Imm(imm), Operand::Reg(ESP, _)]) => {
                let words = (*imm / 4) as i32;
                match (*imm % 4, decoded.mnemonic) {
                    (0, "sub") => state.shift_stack(words),
                    (0, _) => state.shift_stack(-words),
                    _ => state.clear_stack(),
                }
            }
            ("add" | "sub", [Operand::Imm(imm), Operand::Reg(dst, true)]) => {
                match state.get(*dst).valid_value() {
                    Some(v) if decoded.mnemonic == "add" => state.set_value(*dst, v.wrapping_add(*imm)),
                    Some(v) => state.set_value(*dst, v.wrapping_sub(*imm)),
                    None => state.invalidate(*dst),
                }
            }
            ("xor", [Operand::Reg(a, true), Operand::Reg(b, true)]) if a == b => {
                state.set_value(*a, 0);
            }
            ("xchg", [Operand::Reg(a, true), Operand::Reg(b, true)]) => {
                let (first, second) = (state.get(*a), state.get(*b));
                state.set(*a, second);
                state.set(*b, first);
            }
            ("xchg" | "xadd", _) => Self::invalidate_registers(state, ops),
            ("cmpxchg", _) => {
                state.invalidate(EAX);
                Self::invalidate_destination(state, ops);
            }
            ("push", [src]) => {
                let value = Self::value_of(state, src, ctx);
                state.push_stack(value);
            }
            ("pop", [dst]) => {
                let value = state.pop_stack();
                Self::store(state, dst, value);
            }
            ("pushf", _) => state.shift_stack(1),
            ("popf", _) => state.shift_stack(-1),
            ("pusha", _) => state.shift_stack(8),
            ("popa", _) => {
                for reg in (0..REGISTER_COUNT).filter(|reg| *reg != ESP) {
                    state.invalidate(reg);
                }
                state.shift_stack(-8);
            }
            ("call", _) => {
                let return_address = line.info.address.wrapping_add(instruction_length(line));
                let target = direct_target(&decoded.raw);
                if let Some(thunk) = target.and_then(|t| ctx.thunk_at(t)) {
                    state.set_value(thunk.reg, return_address);
                } else if target == Some(return_address) {
                    state.push_stack(GPRegisterInfo::known(return_address));
                } else {
                    for reg in [EAX, ECX, EDX] {
                        state.invalidate(reg);
                    }
                    state.clear_stack();
                }
            }
            ("int", _) => state.invalidate(EAX),
            ("leave", _) => {
                state.invalidate(EBP);
                state.clear_stack();
            }
            ("cmp" | "test" | "jmp" | "ret" | "nop", _) => {}
            (m, _) if m.starts_with('j') => {}
            _ => Self::invalidate_destination(state, ops),
        }
    }

    fn data_reference(&self, state: &MachineState, line: &Line) -> Option<DataRef> {
        let decoded = decode(line)?;
        if matches!(decoded.mnemonic, "call" | "jmp") || decoded.mnemonic.starts_with('j') {
            return None;
        }

        let memory = decoded.operands.iter().find_map(|op| match *op {
            Operand::Mem { base, index: None, disp } => Some((base, disp)),
            _ => None,
        });
        let from_memory = match memory {
            Some((None, disp)) => Some(DataRef::Address(disp as u32)),
            Some((Some(ESP), _)) | Some((Some(EBP), _)) | None => None,
            Some((Some(base), disp)) => {
                let object = state.get(base);
                if object.class.is_some() && !object.is_valid {
                    Some(DataRef::Ivar {
                        object,
                        offset: disp as u32,
                    })
                } else {
                    object
                        .valid_value()
                        .map(|v| DataRef::Address(v.wrapping_add(disp as u32)))
                }
            }
        };
        // an immediate stored or pushed is often a string or selector address
        from_memory.or_else(|| match (decoded.mnemonic, decoded.operands.first()) {
            ("mov" | "push", Some(Operand::Imm(value))) => Some(DataRef::Address(*value)),
            _ => None,
        })
    }

    fn send_arguments(&self, state: &MachineState, kind: SendKind) -> (GPRegisterInfo, GPRegisterInfo) {
        if kind.is_stret() {
            (state.stack_slot(1), state.stack_slot(2))
        } else {
            (state.stack_slot(0), state.stack_slot(1))
        }
    }

    fn receiver_name(&self, kind: SendKind) -> &'static str {
        if kind.is_stret() {
            "0x4(%esp)"
        } else {
            "(%esp)"
        }
    }

    fn syscall_number(&self, state: &MachineState, line: &Line) -> Option<u32> {
        let decoded = decode(line)?;
        match (decoded.mnemonic, decoded.operands.as_slice()) {
            ("int", [Operand::Imm(0x80)]) => state.get(EAX).valid_value(),
            _ => None,
        }
    }

    /// `movl (%esp),%reg; ret`
    fn check_thunk(&self, address: u32, code: &[u8]) -> Option<ThunkInfo> {
        match code.get(..4)? {
            [0x8b, modrm, 0x24, 0xc3] if modrm & 0xc7 == 0x04 => {
                let reg = ((modrm >> 3) & 7) as usize;
                (reg != ESP).then_some(ThunkInfo { address, reg })
            }
            _ => None,
        }
    }
}
