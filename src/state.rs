//! Simulated register file and the per-function block snapshots that carry
//! it across branches.

use std::collections::BTreeMap;

use tracing::trace;

/// Slots tracked for outgoing stack arguments.
pub const STACK_SIZE: usize = 20;

/// What is known about one general purpose register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GPRegisterInfo {
    pub value: u32,
    pub is_valid: bool,
    /// Address of the Objective-C class (or metaclass) the register points at.
    pub class: Option<u32>,
    pub category: Option<u32>,
}

impl GPRegisterInfo {
    pub fn known(value: u32) -> Self {
        GPRegisterInfo {
            value,
            is_valid: true,
            ..Default::default()
        }
    }

    /// An object of a known class whose address is not known.
    pub fn object(class: u32, category: Option<u32>) -> Self {
        GPRegisterInfo {
            class: Some(class),
            category,
            ..Default::default()
        }
    }

    pub fn valid_value(&self) -> Option<u32> {
        self.is_valid.then_some(self.value)
    }

    pub fn is_unknown(&self) -> bool {
        !self.is_valid && self.class.is_none()
    }

    /// State at a join: each piece survives only when both sides agree.
    pub fn merge(&self, other: &GPRegisterInfo) -> GPRegisterInfo {
        let is_valid = self.is_valid && other.is_valid && self.value == other.value;
        GPRegisterInfo {
            value: if is_valid { self.value } else { 0 },
            is_valid,
            class: if self.class == other.class { self.class } else { None },
            category: if self.class == other.class && self.category == other.category {
                self.category
            } else {
                None
            },
        }
    }
}

/// A stack or frame slot holding a copy of `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub info: GPRegisterInfo,
    pub offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub regs: Vec<GPRegisterInfo>,
    pub local_selves: Vec<VarInfo>,
    /// Words at and above the stack pointer, slot 0 at `(%esp)`.
    pub stack: [GPRegisterInfo; STACK_SIZE],
}

impl MachineState {
    pub fn new(register_count: usize) -> Self {
        MachineState {
            regs: vec![GPRegisterInfo::default(); register_count],
            local_selves: Vec::new(),
            stack: [GPRegisterInfo::default(); STACK_SIZE],
        }
    }

    /// Forgets everything.
    pub fn reset(&mut self) {
        self.reset_registers();
        self.local_selves.clear();
    }

    /// Forgets registers and stack arguments but keeps the frame slots
    /// holding `self`, which stay put for the whole function.
    pub fn reset_registers(&mut self) {
        self.regs.fill(GPRegisterInfo::default());
        self.clear_stack();
    }

    pub fn clear_stack(&mut self) {
        self.stack.fill(GPRegisterInfo::default());
    }

    pub fn get(&self, reg: usize) -> GPRegisterInfo {
        self.regs.get(reg).copied().unwrap_or_default()
    }

    pub fn set(&mut self, reg: usize, info: GPRegisterInfo) {
        if let Some(slot) = self.regs.get_mut(reg) {
            *slot = info;
        }
    }

    pub fn set_value(&mut self, reg: usize, value: u32) {
        self.set(reg, GPRegisterInfo::known(value));
    }

    pub fn invalidate(&mut self, reg: usize) {
        self.set(reg, GPRegisterInfo::default());
    }

    pub fn stack_slot(&self, index: usize) -> GPRegisterInfo {
        self.stack.get(index).copied().unwrap_or_default()
    }

    pub fn set_stack_slot(&mut self, index: usize, info: GPRegisterInfo) {
        if let Some(slot) = self.stack.get_mut(index) {
            *slot = info;
        }
    }

    /// Follows the stack pointer moving down by `words` (up when negative).
    /// Slots uncovered at either end are unknown.
    pub fn shift_stack(&mut self, words: i32) {
        let n = words.unsigned_abs() as usize;
        if n >= STACK_SIZE {
            self.clear_stack();
        } else if words > 0 {
            self.stack.copy_within(..STACK_SIZE - n, n);
            self.stack[..n].fill(GPRegisterInfo::default());
        } else if words < 0 {
            self.stack.copy_within(n.., 0);
            self.stack[STACK_SIZE - n..].fill(GPRegisterInfo::default());
        }
    }

    pub fn push_stack(&mut self, info: GPRegisterInfo) {
        self.shift_stack(1);
        self.stack[0] = info;
    }

    pub fn pop_stack(&mut self) -> GPRegisterInfo {
        let top = self.stack[0];
        self.shift_stack(-1);
        top
    }

    pub fn local_self(&self, offset: i32) -> Option<GPRegisterInfo> {
        self.local_selves
            .iter()
            .find(|var| var.offset == offset)
            .map(|var| var.info)
    }

    pub fn set_local_self(&mut self, offset: i32, info: GPRegisterInfo) {
        match self.local_selves.iter_mut().find(|var| var.offset == offset) {
            Some(var) => var.info = info,
            None => self.local_selves.push(VarInfo { info, offset }),
        }
    }

    pub fn forget_local(&mut self, offset: i32) {
        self.local_selves.retain(|var| var.offset != offset);
    }

    pub fn merge(&self, other: &MachineState) -> MachineState {
        let regs = self
            .regs
            .iter()
            .zip(&other.regs)
            .map(|(a, b)| a.merge(b))
            .collect();

        let mut stack = [GPRegisterInfo::default(); STACK_SIZE];
        for (slot, (a, b)) in stack.iter_mut().zip(self.stack.iter().zip(&other.stack)) {
            *slot = a.merge(b);
        }

        let local_selves = self
            .local_selves
            .iter()
            .filter(|var| other.local_self(var.offset) == Some(var.info))
            .copied()
            .collect();

        MachineState {
            regs,
            local_selves,
            stack,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub address: u32,
    /// Number given to a function with no name, if it has none.
    pub anon_index: Option<u32>,
    blocks: BTreeMap<u32, MachineState>,
}

impl FunctionInfo {
    pub fn new(address: u32) -> Self {
        FunctionInfo {
            address,
            anon_index: None,
            blocks: BTreeMap::new(),
        }
    }

    pub fn add_block(&mut self, start: u32) {
        self.blocks.entry(start).or_insert_with(|| MachineState::new(0));
    }

    pub fn is_block_start(&self, address: u32) -> bool {
        self.blocks.contains_key(&address)
    }

    /// Records the state flowing into `target`, merging it with what other
    /// predecessors already left there. Returns whether the snapshot changed.
    pub fn save_block_state(&mut self, target: u32, state: &MachineState) -> bool {
        match self.blocks.get_mut(&target) {
            Some(saved) if saved.regs.is_empty() => {
                *saved = state.clone();
                true
            }
            Some(saved) => {
                let merged = saved.merge(state);
                let changed = merged != *saved;
                if changed {
                    trace!("merged state into block 0x{:08x}", target);
                    *saved = merged;
                }
                changed
            }
            None => {
                self.blocks.insert(target, state.clone());
                true
            }
        }
    }

    pub fn block_state(&self, start: u32) -> Option<&MachineState> {
        self.blocks.get(&start).filter(|state| !state.regs.is_empty())
    }

    /// Applies the snapshot for the block starting at `address` to `state`.
    /// After an unconditional transfer the snapshot replaces the state (or
    /// the registers are cleared if no branch reached here yet); on fall
    /// through the two are merged. Returns whether `state` changed.
    pub fn restore_registers(&self, address: u32, state: &mut MachineState, fell_through: bool) -> bool {
        if !self.is_block_start(address) {
            return false;
        }
        let restored = match (self.block_state(address), fell_through) {
            (Some(saved), true) => state.merge(saved),
            (Some(saved), false) => saved.clone(),
            (None, true) => return false,
            (None, false) => {
                let mut cleared = state.clone();
                cleared.reset_registers();
                cleared
            }
        };
        let changed = restored != *state;
        *state = restored;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state_with(values: &[Option<u32>]) -> MachineState {
        let mut state = MachineState::new(values.len());
        for (reg, value) in values.iter().enumerate() {
            if let Some(v) = value {
                state.set_value(reg, *v);
            }
        }
        state
    }

    #[test]
    fn test_merge_keeps_agreement_only() {
        let a = state_with(&[Some(1), Some(2), None]);
        let b = state_with(&[Some(1), Some(3), Some(4)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get(0).valid_value(), Some(1));
        assert!(!merged.get(1).is_valid);
        assert!(!merged.get(2).is_valid);
    }

    #[test]
    fn test_local_selves() {
        let mut state = MachineState::new(8);
        state.set_local_self(8, GPRegisterInfo::object(0x5100, None));
        assert_eq!(state.local_self(8).and_then(|s| s.class), Some(0x5100));
        state.reset_registers();
        assert!(state.local_self(8).is_some());
        state.forget_local(8);
        assert!(state.local_self(8).is_none());
    }

    #[test]
    fn test_push_and_pop_move_slots() {
        let mut state = MachineState::new(8);
        state.set_stack_slot(0, GPRegisterInfo::known(0x10));
        state.set_stack_slot(1, GPRegisterInfo::known(0x20));

        state.push_stack(GPRegisterInfo::known(0x30));
        assert_eq!(state.stack_slot(0).valid_value(), Some(0x30));
        assert_eq!(state.stack_slot(1).valid_value(), Some(0x10));
        assert_eq!(state.stack_slot(2).valid_value(), Some(0x20));

        assert_eq!(state.pop_stack().valid_value(), Some(0x30));
        assert_eq!(state.stack_slot(0).valid_value(), Some(0x10));
        assert!(!state.stack_slot(STACK_SIZE - 1).is_valid);

        // reserving space for arguments moves what was there out of reach
        state.shift_stack(2);
        assert!(!state.stack_slot(0).is_valid);
        assert_eq!(state.stack_slot(2).valid_value(), Some(0x10));
        state.shift_stack(STACK_SIZE as i32);
        assert!(state.stack.iter().all(|slot| !slot.is_valid));
    }

    #[test]
    fn test_block_save_and_restore() {
        let mut func = FunctionInfo::new(0x1000);
        func.add_block(0x1020);
        assert!(func.block_state(0x1020).is_none());

        assert!(func.save_block_state(0x1020, &state_with(&[Some(7), Some(8)])));
        assert!(!func.save_block_state(0x1020, &state_with(&[Some(7), Some(8)])));
        assert!(func.save_block_state(0x1020, &state_with(&[Some(7), None])));

        let mut current = state_with(&[None, Some(9)]);
        assert!(func.restore_registers(0x1020, &mut current, false));
        assert_eq!(current.get(0).valid_value(), Some(7));
        assert!(!current.get(1).is_valid);

        let mut unreached = state_with(&[Some(1), Some(1)]);
        func.add_block(0x1040);
        assert!(func.restore_registers(0x1040, &mut unreached, false));
        assert!(unreached.regs.iter().all(|r| !r.is_valid));
        assert!(!func.restore_registers(0x1044, &mut unreached, false));
    }

    fn reg_value() -> impl Strategy<Value = Option<u32>> {
        prop::option::of(0u32..4)
    }

    proptest! {
        #[test]
        fn merge_never_revalidates(
            a in prop::collection::vec(reg_value(), 6),
            b in prop::collection::vec(reg_value(), 6),
        ) {
            let (a, b) = (state_with(&a), state_with(&b));
            let merged = a.merge(&b);
            for reg in 0..6 {
                if merged.get(reg).is_valid {
                    prop_assert!(a.get(reg).is_valid && b.get(reg).is_valid);
                    prop_assert_eq!(a.get(reg).value, b.get(reg).value);
                }
            }
        }

        #[test]
        fn restore_is_idempotent(
            saved in prop::collection::vec(reg_value(), 6),
            current in prop::collection::vec(reg_value(), 6),
            fell_through: bool,
        ) {
            let mut func = FunctionInfo::new(0);
            func.save_block_state(0x40, &state_with(&saved));

            let mut first = state_with(&current);
            func.restore_registers(0x40, &mut first, fell_through);
            let mut second = first.clone();
            let changed = func.restore_registers(0x40, &mut second, fell_through);
            prop_assert!(!changed);
            prop_assert_eq!(first, second);
        }
    }
}
