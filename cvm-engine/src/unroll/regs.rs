//! Pseudo-stack register allocator.
//!
//! The top of the operand stack is modelled as a list of registers, bottom
//! first. Entry `i` belongs in memory at `[STACK + (height + i) * 8]`; the
//! entries below the list are already there. Registers are allocated in the
//! machine's priority order and, when none is free, the bottom entry is
//! spilled.

use crate::machine::{Cond, FpModel, Machine, Patch, Reg};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Word(Reg),
    Native(Reg),
    Float(Reg),
}

impl Slot {
    pub(crate) fn reg(self) -> Reg {
        match self {
            Slot::Word(reg) | Slot::Native(reg) | Slot::Float(reg) => reg,
        }
    }

    pub(crate) fn is_float(self) -> bool {
        matches!(self, Slot::Float(_))
    }

    pub(crate) fn is_native(self) -> bool {
        matches!(self, Slot::Native(_))
    }

    pub(crate) fn word(reg: Reg, native: bool) -> Slot {
        if native { Slot::Native(reg) } else { Slot::Word(reg) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThisState {
    Unchecked,
    Checked,
    Escaped,
}

pub(crate) const WORD_BYTES: i32 = crate::format::WORD_SIZE as i32;

pub(crate) fn local_disp(index: u32) -> i32 {
    (index as i64 * WORD_BYTES as i64) as i32
}

pub(crate) struct Unroller<'a, M: Machine> {
    pub(crate) machine: &'a M,
    pub(crate) code: Vec<u8>,
    pub(crate) stack: Vec<Slot>,
    /// Words between the block's entry stack pointer and the bottom of the
    /// pseudo-stack. May go negative.
    pub(crate) height: i32,
    pub(crate) saved: Vec<Reg>,
    pub(crate) cached: Option<(u32, Slot)>,
    pub(crate) this_state: ThisState,
}

impl<'a, M: Machine> Unroller<'a, M> {
    pub(crate) fn new(machine: &'a M) -> Self {
        Self {
            machine,
            code: Vec::with_capacity(4096),
            stack: Vec::with_capacity(32),
            height: 0,
            saved: Vec::new(),
            cached: None,
            this_state: ThisState::Unchecked,
        }
    }

    pub(crate) fn start_block(&mut self) {
        self.stack.clear();
        self.height = 0;
        self.saved.clear();
        self.cached = None;
        if self.this_state != ThisState::Escaped {
            self.this_state = ThisState::Unchecked;
        }
        self.machine.prologue(&mut self.code);
    }

    pub(crate) fn bind(&mut self, patch: Patch) {
        let here = self.code.len();
        self.machine.patch(&mut self.code, patch, here);
    }

    fn in_use(&self, reg: Reg, float: bool) -> bool {
        self.stack
            .iter()
            .any(|slot| slot.is_float() == float && slot.reg() == reg)
    }

    fn float_count(&self) -> usize {
        self.stack.iter().filter(|slot| slot.is_float()).count()
    }

    pub(crate) fn claim(&mut self, reg: Reg) {
        if self.machine.is_callee_saved(reg) && !self.saved.contains(&reg) {
            self.machine.push(&mut self.code, reg);
            self.saved.push(reg);
        }
    }

    fn free_word_reg(&self, preferred: Option<Reg>) -> Option<Reg> {
        if let Some(reg) = preferred {
            if !self.in_use(reg, false) {
                return Some(reg);
            }
        }
        self.machine
            .word_regs()
            .iter()
            .copied()
            .find(|reg| !self.in_use(*reg, false))
    }

    pub(crate) fn word_register(&mut self, native: bool) -> Reg {
        self.cached = None;
        let reg = loop {
            if let Some(reg) = self.free_word_reg(None) {
                break reg;
            }
            match (M::FP, self.stack.first().copied()) {
                // Only the top of a register stack FPU can be stored.
                (FpModel::Stack { .. }, Some(Slot::Float(_))) => self.flush(),
                _ => self.spill_bottom(),
            }
        };
        self.claim(reg);
        self.stack.push(Slot::word(reg, native));
        reg
    }

    pub(crate) fn fp_register(&mut self) -> Reg {
        self.cached = None;
        let reg = match M::FP {
            FpModel::Flat => loop {
                let free = self
                    .machine
                    .fp_regs()
                    .iter()
                    .copied()
                    .find(|reg| !self.in_use(*reg, true));
                if let Some(reg) = free {
                    break reg;
                }
                self.spill_bottom();
            },
            FpModel::Stack { depth } => {
                if self.float_count() >= depth {
                    self.flush();
                }
                self.machine.fp_regs().first().copied().unwrap_or(Reg(0))
            }
            FpModel::None => Reg(0),
        };
        self.stack.push(Slot::Float(reg));
        reg
    }

    fn store_entry(&mut self, slot: Slot, disp: i32) {
        let stack_reg = self.machine.stack_reg();
        match slot {
            Slot::Word(reg) => self.machine.store_slot(&mut self.code, reg, false, stack_reg, disp),
            Slot::Native(reg) => self.machine.store_slot(&mut self.code, reg, true, stack_reg, disp),
            Slot::Float(reg) => self.machine.fp_store(&mut self.code, reg, stack_reg, disp),
        }
    }

    pub(crate) fn spill_bottom(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        let slot = self.stack.remove(0);
        self.store_entry(slot, self.height * WORD_BYTES);
        self.height += 1;
    }

    pub(crate) fn flush_no_update(&mut self) {
        let stacked_fp = matches!(M::FP, FpModel::Stack { .. });
        for index in 0..self.stack.len() {
            let slot = self.stack[index];
            if slot.is_float() && stacked_fp {
                continue;
            }
            self.store_entry(slot, (self.height + index as i32) * WORD_BYTES);
        }
        if stacked_fp {
            for index in (0..self.stack.len()).rev() {
                let slot = self.stack[index];
                if slot.is_float() {
                    self.store_entry(slot, (self.height + index as i32) * WORD_BYTES);
                }
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        self.flush_no_update();
        self.height += self.stack.len() as i32;
        self.stack.clear();
        self.cached = None;
    }

    pub(crate) fn exit_to(&mut self, pc: usize) {
        self.machine.exit(
            &mut self.code,
            pc as u64,
            self.height * WORD_BYTES,
            false,
            &self.saved,
        );
    }

    pub(crate) fn branch_to_pc(&mut self, pc: usize) {
        self.flush();
        self.exit_to(pc);
    }

    /// Failure path of a guard: hands the instruction at `pc`, operands
    /// still on the pseudo-stack, back to the interpreter.
    pub(crate) fn reexecute(&mut self, pc: usize) {
        self.flush_no_update();
        let adjust = (self.height + self.stack.len() as i32) * WORD_BYTES;
        self.machine
            .exit(&mut self.code, pc as u64, adjust, true, &self.saved);
    }

    pub(crate) fn roll_register(&mut self, native: bool, preferred: Option<Reg>) -> Reg {
        self.cached = None;
        let reg = loop {
            if let Some(reg) = self.free_word_reg(preferred) {
                break reg;
            }
            self.flush();
        };
        self.claim(reg);
        self.height -= 1;
        let stack_reg = self.machine.stack_reg();
        self.machine.load_slot(
            &mut self.code,
            reg,
            native,
            stack_reg,
            self.height * WORD_BYTES,
        );
        self.stack.insert(0, Slot::word(reg, native));
        reg
    }

    fn top_words_present(&self, count: usize) -> bool {
        self.stack.len() >= count
            && self.stack[self.stack.len() - count..]
                .iter()
                .all(|slot| !slot.is_float())
    }

    fn top_words(&mut self, kinds: &[bool]) -> Vec<Reg> {
        let count = kinds.len();
        if !self.top_words_present(count) {
            let words_only = self.stack.iter().all(|slot| !slot.is_float());
            if words_only && self.stack.len() < count {
                for native in kinds[..count - self.stack.len()].iter().rev() {
                    self.roll_register(*native, None);
                }
            } else {
                self.flush();
                let regs = self.machine.word_regs();
                for (index, native) in kinds.iter().enumerate().rev() {
                    self.roll_register(*native, regs.get(index).copied());
                }
            }
        }
        self.stack[self.stack.len() - count..]
            .iter()
            .map(|slot| slot.reg())
            .collect()
    }

    pub(crate) fn top_word(&mut self, native: bool) -> Reg {
        self.top_words(&[native])[0]
    }

    pub(crate) fn top_two(&mut self, native_a: bool, native_b: bool) -> (Reg, Reg) {
        let regs = self.top_words(&[native_a, native_b]);
        (regs[0], regs[1])
    }

    pub(crate) fn top_three(&mut self, na: bool, nb: bool, nc: bool) -> (Reg, Reg, Reg) {
        let regs = self.top_words(&[na, nb, nc]);
        (regs[0], regs[1], regs[2])
    }

    pub(crate) fn top_fixed(&mut self, regs: &[Reg], kinds: &[bool]) {
        let len = self.stack.len();
        let in_place = len == regs.len()
            && self
                .stack
                .iter()
                .zip(regs)
                .all(|(slot, reg)| !slot.is_float() && slot.reg() == *reg);
        if in_place {
            return;
        }
        self.flush();
        for (reg, native) in regs.iter().zip(kinds).rev() {
            self.roll_register(*native, Some(*reg));
        }
    }

    pub(crate) fn top_fp(&mut self) -> Reg {
        if let Some(Slot::Float(reg)) = self.stack.last() {
            return *reg;
        }
        self.flush();
        self.height -= 1;
        let reg = self.fp_register();
        let stack_reg = self.machine.stack_reg();
        self.machine
            .fp_load(&mut self.code, reg, stack_reg, self.height * WORD_BYTES);
        reg
    }

    pub(crate) fn top_two_fp(&mut self) -> (Reg, Reg) {
        let len = self.stack.len();
        if len >= 2 && self.stack[len - 2].is_float() && self.stack[len - 1].is_float() {
            return (self.stack[len - 2].reg(), self.stack[len - 1].reg());
        }
        self.flush();
        self.height -= 2;
        let stack_reg = self.machine.stack_reg();
        let a = self.fp_register();
        self.machine
            .fp_load(&mut self.code, a, stack_reg, self.height * WORD_BYTES);
        let b = self.fp_register();
        self.machine
            .fp_load(&mut self.code, b, stack_reg, (self.height + 1) * WORD_BYTES);
        (a, b)
    }

    /// Brings a group of mixed entries into registers, bottom first. `None`
    /// marks a float; `Some(native)` a word.
    pub(crate) fn top_mixed(&mut self, kinds: &[Option<bool>]) -> Vec<Reg> {
        let count = kinds.len();
        let len = self.stack.len();
        let ready = len >= count
            && self.stack[len - count..]
                .iter()
                .zip(kinds)
                .all(|(slot, kind)| slot.is_float() == kind.is_none());
        if !ready {
            self.flush();
            self.height -= count as i32;
            let stack_reg = self.machine.stack_reg();
            for (index, kind) in kinds.iter().enumerate() {
                let disp = (self.height + index as i32) * WORD_BYTES;
                match kind {
                    Some(native) => {
                        let reg = self.word_register(*native);
                        self.machine
                            .load_slot(&mut self.code, reg, *native, stack_reg, disp);
                    }
                    None => {
                        let reg = self.fp_register();
                        self.machine.fp_load(&mut self.code, reg, stack_reg, disp);
                    }
                }
            }
        }
        self.stack[self.stack.len() - count..]
            .iter()
            .map(|slot| slot.reg())
            .collect()
    }

    pub(crate) fn free_top(&mut self) {
        if self.stack.pop().is_none() {
            self.height -= 1;
        }
    }

    pub(crate) fn free_top_local(&mut self, index: u32) {
        if let Some(slot) = self.stack.pop() {
            self.cached = Some((index, slot));
        }
    }

    pub(crate) fn set_top(&mut self, slot: Slot) {
        if let Some(top) = self.stack.last_mut() {
            *top = slot;
        }
    }

    pub(crate) fn check_null(&mut self, reg: Reg, pc: usize) {
        self.machine.cmp_imm(&mut self.code, Cond::Ne, reg, 0, true);
        let ok = self.machine.jcc(&mut self.code, Cond::Ne);
        self.reexecute(pc);
        self.bind(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Amd64, X86, amd64};

    #[test]
    fn allocation_follows_priority_order() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        assert_eq!(unroller.word_register(false), amd64::RAX);
        assert_eq!(unroller.word_register(true), amd64::RCX);
        assert_eq!(
            unroller.stack,
            vec![Slot::Word(amd64::RAX), Slot::Native(amd64::RCX)]
        );
    }

    #[test]
    fn exhausted_registers_spill_the_bottom_entry() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        for _ in 0..machine.word_regs().len() {
            unroller.word_register(false);
        }
        assert_eq!(unroller.height, 0);
        let reg = unroller.word_register(false);
        assert_eq!(reg, amd64::RAX);
        assert_eq!(unroller.height, 1);
        assert_eq!(unroller.stack.len(), machine.word_regs().len());
        assert_eq!(unroller.stack.last(), Some(&Slot::Word(amd64::RAX)));
    }

    #[test]
    fn callee_saved_registers_are_pushed_once() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        for _ in 0..4 {
            unroller.word_register(false);
        }
        assert_eq!(unroller.saved, vec![amd64::RBX]);
        unroller.flush();
        for _ in 0..4 {
            unroller.word_register(false);
        }
        assert_eq!(unroller.saved, vec![amd64::RBX]);
    }

    #[test]
    fn rolling_reads_below_the_pseudo_stack() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        let (a, b) = unroller.top_two(false, false);
        assert_eq!((a, b), (amd64::RCX, amd64::RAX));
        assert_eq!(unroller.height, -2);
        assert_eq!(unroller.stack, vec![Slot::Word(a), Slot::Word(b)]);
    }

    #[test]
    fn reexecute_keeps_the_bookkeeping() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        unroller.word_register(false);
        let before = unroller.stack.clone();
        unroller.reexecute(12);
        assert_eq!(unroller.stack, before);
        assert_eq!(unroller.height, 0);
    }

    #[test]
    fn x87_spill_with_a_float_at_the_bottom_flushes() {
        let machine = X86;
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.fp_register();
        for _ in 0..machine.word_regs().len() {
            unroller.word_register(false);
        }
        assert_eq!(unroller.height, 0);
        unroller.word_register(false);
        assert_eq!(unroller.height, 1 + machine.word_regs().len() as i32);
        assert_eq!(unroller.stack.len(), 1);
    }

    #[test]
    fn mixed_operands_load_from_memory_in_order() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.fp_register();
        let regs = unroller.top_mixed(&[Some(true), None]);
        assert_eq!(unroller.height, -1);
        assert_eq!(unroller.stack, vec![Slot::Native(regs[0]), Slot::Float(regs[1])]);

        let before = unroller.code.len();
        let again = unroller.top_mixed(&[Some(true), None]);
        assert_eq!(again, regs);
        assert_eq!(unroller.code.len(), before);
    }

    #[test]
    fn store_cache_remembers_the_freed_register() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        let reg = unroller.word_register(false);
        unroller.free_top_local(3);
        assert_eq!(unroller.cached, Some((3, Slot::Word(reg))));
        unroller.word_register(false);
        assert_eq!(unroller.cached, None);
    }
}
