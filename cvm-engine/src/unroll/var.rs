use super::regs::{Slot, ThisState, Unroller, local_disp};
use crate::format::{CodeView, Insn, Operand};
use crate::machine::Machine;
use crate::opcodes::Opcode;

fn local_index(insn: &Insn) -> u32 {
    insn.opcode
        .implied_local()
        .unwrap_or(insn.operand.int() as u32)
}

pub(crate) fn this_escapes(view: &CodeView<'_>) -> bool {
    match view.instructions() {
        Ok(insns) => insns
            .iter()
            .any(|insn| insn.opcode == Opcode::Waddr && local_index(insn) == 0),
        Err(_) => true,
    }
}

impl<M: Machine> Unroller<'_, M> {
    pub(crate) fn load_local(&mut self, insn: &Insn, cached: Option<(u32, Slot)>, native: bool) {
        let index = local_index(insn);
        if let Some((local, slot)) = cached {
            if local == index && !slot.is_float() && slot.is_native() == native {
                self.stack.push(slot);
                return;
            }
        }
        let reg = self.word_register(native);
        let frame = self.machine.frame_reg();
        self.machine
            .load_slot(&mut self.code, reg, native, frame, local_disp(index));
    }

    pub(crate) fn store_local(&mut self, insn: &Insn, native: bool) {
        let index = local_index(insn);
        let reg = self.top_word(native);
        let frame = self.machine.frame_reg();
        self.machine
            .store_slot(&mut self.code, reg, native, frame, local_disp(index));
        self.free_top_local(index);
        if index == 0 && self.this_state == ThisState::Checked {
            self.this_state = ThisState::Unchecked;
        }
    }

    pub(crate) fn local_address(&mut self, insn: &Insn) {
        let index = local_index(insn);
        let reg = self.word_register(true);
        let frame = self.machine.frame_reg();
        self.machine.lea(&mut self.code, reg, frame, local_disp(index));
        if index == 0 {
            self.this_state = ThisState::Escaped;
        }
    }

    pub(crate) fn constant(&mut self, insn: &Insn) {
        match insn.opcode {
            Opcode::LdcI8 => {
                let reg = self.word_register(true);
                self.machine
                    .load_imm_native(&mut self.code, reg, insn.operand.int());
            }
            Opcode::Ldnull => {
                let reg = self.word_register(true);
                self.machine.load_imm_native(&mut self.code, reg, 0);
            }
            Opcode::LdcR4 | Opcode::LdcR8 => {
                let value = match insn.operand {
                    Operand::Float(value) => value,
                    _ => 0.0,
                };
                let reg = self.fp_register();
                self.machine.fp_const(&mut self.code, reg, value);
            }
            opcode => {
                let value = opcode
                    .implied_constant()
                    .unwrap_or(insn.operand.int() as i32);
                let reg = self.word_register(false);
                self.machine.load_imm(&mut self.code, reg, value);
            }
        }
    }

    pub(crate) fn dup(&mut self) {
        if self.stack.last().is_some_and(|slot| slot.is_float()) {
            self.flush();
        }
        let native = self.stack.last().is_none_or(|slot| slot.is_native());
        let src = self.top_word(native);
        let dst = self.word_register(native);
        self.machine.mov(&mut self.code, dst, src);
    }

    pub(crate) fn dup2(&mut self) {
        if self.stack.iter().any(|slot| slot.is_float()) {
            self.flush();
        }
        let len = self.stack.len();
        let native_a = len < 2 || self.stack[len - 2].is_native();
        let native_b = len < 1 || self.stack[len - 1].is_native();
        let (a, b) = self.top_two(native_a, native_b);
        let c = self.word_register(native_a);
        self.machine.mov(&mut self.code, c, a);
        let d = self.word_register(native_b);
        self.machine.mov(&mut self.code, d, b);
    }

    pub(crate) fn pop(&mut self, count: usize) {
        let len = self.stack.len();
        if self.stack[len.saturating_sub(count)..]
            .iter()
            .any(|slot| slot.is_float())
        {
            self.flush();
        }
        for _ in 0..count {
            self.free_top();
        }
    }
}
