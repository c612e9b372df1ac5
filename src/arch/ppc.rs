use bitfield::bitfield;

use super::{ArchSpecifics, Context, DataRef, Flow, SendKind};
use crate::lines::{Line, LineList};
use crate::machine::Arch;
use crate::state::{GPRegisterInfo, MachineState};

/// r0-r31 plus the link register.
pub const REGISTER_COUNT: usize = 33;
pub const LR: usize = 32;
const STACK_POINTER: usize = 1;

/// `bla` target of the commpage message send.
pub const RTP_SEND_ADDRESS: u32 = 0xfffeff00;

const MFLR_R0: u32 = 0x7c0802a6;

bitfield! {
    pub struct PpcWord(u32);
    impl Debug;
    pub opcode, set_opcode: 31, 26;
    pub rt, set_rt: 25, 21;
    pub ra, set_ra: 20, 16;
    pub rb, set_rb: 15, 11;
    pub uimm, set_uimm: 15, 0;
    pub li, set_li: 25, 2;
    pub bd, set_bd: 15, 2;
    pub xo, set_xo: 10, 1;
    pub aa, set_aa: 1;
    pub lk, set_lk: 0;
}

impl PpcWord {
    pub fn simm(&self) -> i32 {
        self.uimm() as u16 as i16 as i32
    }

    /// BO field of conditional branches.
    pub fn bo(&self) -> u32 {
        self.rt()
    }

    pub fn spr(&self) -> u32 {
        (self.rb() << 5) | self.ra()
    }

    fn branch_target(&self, address: u32) -> u32 {
        let offset = match self.opcode() {
            18 => ((self.li() << 8) as i32) >> 6,
            _ => ((self.bd() << 18) as i32) >> 16,
        };
        if self.aa() {
            offset as u32
        } else {
            address.wrapping_add(offset as u32)
        }
    }

    fn branches_always(&self) -> bool {
        self.bo() & 0x14 == 0x14
    }
}

fn word(line: &Line) -> Option<PpcWord> {
    line.info.code_word().map(PpcWord)
}

/// X-form instructions whose destination is RA.
const RA_DESTINATION_XO: &[u32] = &[24, 26, 28, 60, 124, 284, 316, 412, 476, 536, 792, 824, 922, 954];
/// X-form instructions that write no general purpose register.
const NO_DESTINATION_XO: &[u32] = &[
    0, 32, 86, 144, 150, 151, 183, 215, 247, 407, 439, 598, 662, 663, 695, 727, 759, 918, 982,
    1014,
];
/// Update-form stores, which write the effective address back to RA.
const UPDATE_STORE_XO: &[u32] = &[183, 247, 439, 695, 759];
/// Update-form indexed loads, which write both RT and RA.
const UPDATE_LOAD_XO: &[u32] = &[55, 119, 311, 375];

pub struct PpcSpecifics;

impl PpcSpecifics {
    fn clobber_call(state: &mut MachineState, return_address: u32) {
        state.invalidate(0);
        for reg in 3..=12 {
            state.invalidate(reg);
        }
        state.set_value(LR, return_address);
    }

    fn load(state: &MachineState, w: &PpcWord, ctx: &Context) -> GPRegisterInfo {
        let ra = w.ra() as usize;
        if ra == STACK_POINTER {
            return state.local_self(w.simm()).unwrap_or_default();
        }
        match Self::effective_address(state, w) {
            Some(ea) => ctx
                .mem
                .read_u32(ea)
                .map(GPRegisterInfo::known)
                .unwrap_or_default(),
            None => GPRegisterInfo::default(),
        }
    }

    /// `d(rA)` with rA known, or `d` alone when rA is r0.
    fn effective_address(state: &MachineState, w: &PpcWord) -> Option<u32> {
        let ra = w.ra() as usize;
        let base = if ra == 0 { 0 } else { state.get(ra).valid_value()? };
        Some(base.wrapping_add(w.simm() as u32))
    }

    fn update_base(state: &mut MachineState, w: &PpcWord) {
        let ra = w.ra() as usize;
        if ra == STACK_POINTER {
            return;
        }
        match Self::effective_address(state, w) {
            Some(ea) => state.set_value(ra, ea),
            None => state.invalidate(ra),
        }
    }

    fn update_x_form(state: &mut MachineState, w: &PpcWord) {
        let (rt, ra, rb) = (w.rt() as usize, w.ra() as usize, w.rb() as usize);
        match w.xo() {
            // or; mr when both sources match
            444 => {
                let info = if rt == rb {
                    state.get(rt)
                } else {
                    match (state.get(rt).valid_value(), state.get(rb).valid_value()) {
                        (Some(a), Some(b)) => GPRegisterInfo::known(a | b),
                        _ => GPRegisterInfo::default(),
                    }
                };
                state.set(ra, info);
            }
            // mfspr
            339 => {
                if w.spr() == 8 {
                    state.set(rt, state.get(LR));
                } else {
                    state.invalidate(rt);
                }
            }
            // mtspr
            467 => {
                if w.spr() == 8 {
                    state.set(LR, state.get(rt));
                }
            }
            xo if RA_DESTINATION_XO.contains(&xo) => state.invalidate(ra),
            xo if UPDATE_STORE_XO.contains(&xo) => state.invalidate(ra),
            xo if UPDATE_LOAD_XO.contains(&xo) => {
                state.invalidate(rt);
                state.invalidate(ra);
            }
            xo if NO_DESTINATION_XO.contains(&xo) => {}
            _ => state.invalidate(rt),
        }
    }
}

impl ArchSpecifics for PpcSpecifics {
    fn arch(&self) -> Arch {
        Arch::Ppc
    }

    fn register_count(&self) -> usize {
        REGISTER_COUNT
    }

    fn return_register(&self) -> usize {
        3
    }

    fn keeps_verbose(&self, line: &Line) -> bool {
        matches!(word(line).map(|w| w.opcode()), Some(16) | Some(18))
    }

    fn starts_function(&self, lines: &LineList, index: usize) -> bool {
        let Some(current) = lines.plain(index).and_then(word) else {
            return false;
        };
        let opens_frame = current.0 == MFLR_R0
            || (current.opcode() == 37 && current.rt() == 1 && current.ra() == 1);
        if !opens_frame {
            return false;
        }

        let previous = (0..index)
            .rev()
            .filter_map(|i| lines.plain(i))
            .find(|line| line.info.is_code);
        match previous {
            None => true,
            Some(prev) => !self.flow(prev).falls_through(),
        }
    }

    fn flow(&self, line: &Line) -> Flow {
        let Some(w) = word(line) else {
            return Flow::Next;
        };
        let address = line.info.address;
        match w.opcode() {
            18 => {
                let target = w.branch_target(address);
                if w.lk() {
                    Flow::Call(Some(target))
                } else {
                    Flow::Jump(Some(target))
                }
            }
            16 => {
                let target = w.branch_target(address);
                if w.lk() {
                    Flow::Call(Some(target))
                } else if w.branches_always() {
                    Flow::Jump(Some(target))
                } else {
                    Flow::Branch(target)
                }
            }
            19 if matches!(w.xo(), 16 | 528) => {
                if w.lk() {
                    Flow::Call(None)
                } else if !w.branches_always() {
                    Flow::Next
                } else if w.xo() == 16 {
                    Flow::Return
                } else {
                    Flow::Jump(None)
                }
            }
            _ => Flow::Next,
        }
    }

    fn enter_function(&self, state: &mut MachineState, receiver: Option<GPRegisterInfo>) {
        state.reset();
        if let Some(receiver) = receiver {
            state.set(3, receiver);
        }
    }

    fn update_registers(&self, state: &mut MachineState, line: &Line, ctx: &Context) {
        let Some(w) = word(line) else {
            return;
        };
        let address = line.info.address;
        let (rt, ra) = (w.rt() as usize, w.ra() as usize);
        let uimm = w.uimm();

        match w.opcode() {
            // addi, li
            14 => match Self::effective_address(state, &w) {
                Some(value) if ra != STACK_POINTER => state.set_value(rt, value),
                _ => state.invalidate(rt),
            },
            // addis, lis
            15 => {
                let high = uimm << 16;
                let base = if ra == 0 { Some(0) } else { state.get(ra).valid_value() };
                match base {
                    Some(base) => state.set_value(rt, base.wrapping_add(high)),
                    None => state.invalidate(rt),
                }
            }
            // ori, oris, xori, andi.
            24 | 25 | 26 | 28 => {
                let info = match state.get(rt).valid_value() {
                    Some(source) => GPRegisterInfo::known(match w.opcode() {
                        24 => source | uimm,
                        25 => source | (uimm << 16),
                        26 => source ^ uimm,
                        _ => source & uimm,
                    }),
                    None => GPRegisterInfo::default(),
                };
                state.set(ra, info);
            }
            20 | 21 | 23 | 27 | 29 => state.invalidate(ra),
            // lwz, lwzu
            32 | 33 => {
                let loaded = Self::load(state, &w, ctx);
                if w.opcode() == 33 {
                    Self::update_base(state, &w);
                }
                state.set(rt, loaded);
            }
            // stw: a copy of self on the stack is remembered
            36 | 37 => {
                if ra == STACK_POINTER {
                    let source = state.get(rt);
                    if source.class.is_some() {
                        state.set_local_self(w.simm(), source);
                    } else {
                        state.forget_local(w.simm());
                    }
                }
                if w.opcode() == 37 {
                    Self::update_base(state, &w);
                }
            }
            // other loads
            34 | 40 | 42 => state.invalidate(rt),
            35 | 41 | 43 => {
                Self::update_base(state, &w);
                state.invalidate(rt);
            }
            39 | 45 | 49 | 51 | 53 | 55 => Self::update_base(state, &w),
            46 => {
                for reg in rt..32 {
                    state.invalidate(reg);
                }
            }
            7 | 8 | 12 | 13 => state.invalidate(rt),
            18 => {
                if w.lk() {
                    let return_address = address.wrapping_add(4);
                    if w.branch_target(address) == return_address {
                        state.set_value(LR, return_address);
                    } else {
                        Self::clobber_call(state, return_address);
                    }
                }
            }
            16 => {
                if w.lk() {
                    state.set_value(LR, address.wrapping_add(4));
                }
            }
            19 => {
                if w.lk() {
                    Self::clobber_call(state, address.wrapping_add(4));
                }
            }
            17 => state.invalidate(3),
            31 => Self::update_x_form(state, &w),
            // compares, stores and floating point leave the GPRs alone
            10 | 11 | 38 | 44 | 47 | 48 | 50 | 52 | 54 | 59 | 63 => {}
            _ => state.invalidate(rt),
        }
    }

    fn data_reference(&self, state: &MachineState, line: &Line) -> Option<DataRef> {
        let w = word(line)?;
        let ra = w.ra() as usize;
        match w.opcode() {
            32..=55 if ra != STACK_POINTER => {
                let base = state.get(ra);
                if ra != 0 && base.class.is_some() && !base.is_valid {
                    Some(DataRef::Ivar {
                        object: base,
                        offset: w.simm() as u32,
                    })
                } else {
                    Self::effective_address(state, &w).map(DataRef::Address)
                }
            }
            14 if ra != 0 && ra != STACK_POINTER => {
                Self::effective_address(state, &w).map(DataRef::Address)
            }
            _ => None,
        }
    }

    fn send_arguments(&self, state: &MachineState, kind: SendKind) -> (GPRegisterInfo, GPRegisterInfo) {
        if kind.is_stret() {
            (state.get(4), state.get(5))
        } else {
            (state.get(3), state.get(4))
        }
    }

    fn receiver_name(&self, kind: SendKind) -> &'static str {
        if kind.is_stret() {
            "r4"
        } else {
            "r3"
        }
    }

    fn syscall_number(&self, state: &MachineState, line: &Line) -> Option<u32> {
        match word(line)?.opcode() {
            17 => state.get(0).valid_value(),
            _ => None,
        }
    }

    fn special_send(&self, target: u32) -> Option<SendKind> {
        (target == RTP_SEND_ADDRESS).then_some(SendKind::SendRtp)
    }
}
