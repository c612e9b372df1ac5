//! Instruction-set specific behaviour behind one interface, picked once per
//! session from the image's CPU type.

pub mod ppc;
pub mod x86;
pub mod x86_length;

use crate::lines::{Line, LineList};
use crate::machine::Arch;
use crate::macho::AddressSpace;
use crate::state::{GPRegisterInfo, MachineState};

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Call(Option<u32>),
    /// Unconditional transfer. `None` when the target is computed.
    Jump(Option<u32>),
    /// Conditional branch; falls through when not taken.
    Branch(u32),
    Return,
}

impl Flow {
    pub fn falls_through(&self) -> bool {
        !matches!(self, Flow::Jump(_) | Flow::Return)
    }

    /// A target inside the current function that starts a new block.
    pub fn block_target(&self) -> Option<u32> {
        match self {
            Flow::Jump(Some(target)) | Flow::Branch(target) => Some(*target),
            _ => None,
        }
    }
}

/// A memory reference made by an instruction, resolved as far as the
/// register file allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRef {
    Address(u32),
    /// `offset(reg)` where `reg` holds an object of a known class.
    Ivar { object: GPRegisterInfo, offset: u32 },
}

/// The Objective-C dispatch entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Send,
    /// PPC runtime page variant reached with `bla`.
    SendRtp,
    SendSuper,
    SendStret,
    SendSuperStret,
    SendFpret,
}

impl SendKind {
    pub fn from_symbol(name: &str) -> Option<SendKind> {
        let kind = match name.strip_prefix('_').unwrap_or(name) {
            "objc_msgSend" => SendKind::Send,
            "objc_msgSend_rtp" => SendKind::SendRtp,
            "objc_msgSendSuper" => SendKind::SendSuper,
            "objc_msgSend_stret" => SendKind::SendStret,
            "objc_msgSendSuper_stret" => SendKind::SendSuperStret,
            "objc_msgSend_fpret" => SendKind::SendFpret,
            _ => return None,
        };
        Some(kind)
    }

    /// Struct returns pass the result buffer first, shifting the receiver
    /// and selector by one argument.
    pub fn is_stret(&self) -> bool {
        matches!(self, SendKind::SendStret | SendKind::SendSuperStret)
    }

    pub fn is_super(&self) -> bool {
        matches!(self, SendKind::SendSuper | SendKind::SendSuperStret)
    }
}

/// A position independent code helper that loads its return address into
/// `reg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThunkInfo {
    pub address: u32,
    pub reg: usize,
}

/// Read-only session data the simulator consults.
pub struct Context<'a> {
    pub mem: &'a dyn AddressSpace,
    pub thunks: &'a [ThunkInfo],
}

impl<'a> Context<'a> {
    pub fn new(mem: &'a dyn AddressSpace, thunks: &'a [ThunkInfo]) -> Self {
        Context { mem, thunks }
    }

    pub fn thunk_at(&self, address: u32) -> Option<&ThunkInfo> {
        self.thunks.iter().find(|thunk| thunk.address == address)
    }
}

/// Per-instruction-set behavior, chosen once per image. `Send` so a whole
/// processing session can move to a worker thread.
pub trait ArchSpecifics: Send {
    fn arch(&self) -> Arch;

    fn register_count(&self) -> usize;

    /// Register holding a call's result.
    fn return_register(&self) -> usize;

    /// Whether the symbolic text can be trusted for this instruction.
    fn keeps_verbose(&self, line: &Line) -> bool;

    /// Function-start heuristic for code with no symbol.
    fn starts_function(&self, lines: &LineList, index: usize) -> bool;

    fn flow(&self, line: &Line) -> Flow;

    /// Seeds the state at a function entry, with `receiver` describing
    /// `self` for Objective-C methods.
    fn enter_function(&self, state: &mut MachineState, receiver: Option<GPRegisterInfo>);

    /// Applies one instruction's effect. Anything not modeled invalidates
    /// the destination.
    fn update_registers(&self, state: &mut MachineState, line: &Line, ctx: &Context);

    fn data_reference(&self, state: &MachineState, line: &Line) -> Option<DataRef>;

    /// Receiver and selector of a message send about to happen.
    fn send_arguments(&self, state: &MachineState, kind: SendKind) -> (GPRegisterInfo, GPRegisterInfo);

    /// Where the receiver lives, shown when its class is unknown.
    fn receiver_name(&self, kind: SendKind) -> &'static str;

    fn syscall_number(&self, state: &MachineState, line: &Line) -> Option<u32>;

    /// Message sends reached without a symbol stub.
    fn special_send(&self, _target: u32) -> Option<SendKind> {
        None
    }

    fn check_thunk(&self, _address: u32, _code: &[u8]) -> Option<ThunkInfo> {
        None
    }
}

pub fn specifics_for(arch: Arch) -> Box<dyn ArchSpecifics> {
    match arch {
        Arch::Ppc => Box::new(ppc::PpcSpecifics),
        Arch::I386 => Box::new(x86::X86Specifics),
    }
}

/// Parses `0x`-prefixed hex or decimal, with an optional minus sign.
pub(crate) fn parse_number(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => s.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_kinds() {
        assert_eq!(SendKind::from_symbol("_objc_msgSend"), Some(SendKind::Send));
        assert_eq!(
            SendKind::from_symbol("_objc_msgSendSuper_stret"),
            Some(SendKind::SendSuperStret)
        );
        assert!(SendKind::SendSuperStret.is_stret() && SendKind::SendSuperStret.is_super());
        assert_eq!(SendKind::from_symbol("_printf"), None);
    }

    #[test]
    fn test_flow() {
        assert!(!Flow::Return.falls_through());
        assert!(Flow::Branch(0x10).falls_through());
        assert_eq!(Flow::Jump(Some(0x20)).block_target(), Some(0x20));
        assert_eq!(Flow::Call(Some(0x20)).block_target(), None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x1f"), Some(31));
        assert_eq!(parse_number("-0x8"), Some(-8));
        assert_eq!(parse_number("12"), Some(12));
        assert_eq!(parse_number("%eax"), None);
    }
}
