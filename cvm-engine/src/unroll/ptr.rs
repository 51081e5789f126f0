use super::regs::{Slot, ThisState, Unroller, WORD_BYTES};
use crate::heap::{
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, MARRAY_DATA_OFFSET, MARRAY_ELEM_SIZE_OFFSET,
    MARRAY_LOWER_OFFSET, MARRAY_MULT_OFFSET, MARRAY_SIZE_OFFSET, marray_bound,
};
use crate::machine::{Alu, Cond, Machine, Mem, Reg};

fn is_wide(kind: Mem) -> bool {
    kind == Mem::Native
}

impl<M: Machine> Unroller<'_, M> {
    pub(crate) fn check_null_this(&mut self, reg: Reg, pc: usize) {
        self.machine.cmp_imm(&mut self.code, Cond::Ne, reg, 0, true);
        let ok = self.machine.jcc(&mut self.code, Cond::Ne);
        // The instruction takes no operands; the loaded `this` is not one.
        let pushed = self.stack.pop();
        self.reexecute(pc);
        if let Some(slot) = pushed {
            self.stack.push(slot);
        }
        self.bind(ok);
    }

    fn check_array(&mut self, array: Reg, index: Reg, pc: usize) {
        self.machine
            .cmp_imm(&mut self.code, Cond::Eq, array, 0, true);
        let null = self.machine.jcc(&mut self.code, Cond::Eq);
        self.machine
            .cmp_mem(&mut self.code, Cond::LtUn, index, array, ARRAY_LENGTH_OFFSET);
        let ok = self.machine.jcc(&mut self.code, Cond::LtUn);
        self.bind(null);
        self.reexecute(pc);
        self.bind(ok);
    }

    fn check_2d(&mut self, array: Reg, i: Reg, j: Reg, pc: usize) {
        self.check_null(array, pc);

        let lower0 = marray_bound(0, MARRAY_LOWER_OFFSET);
        let lower1 = marray_bound(1, MARRAY_LOWER_OFFSET);
        self.machine
            .alu_mem(&mut self.code, Alu::Sub, i, array, lower0);
        self.machine.cmp_mem(
            &mut self.code,
            Cond::LtUn,
            i,
            array,
            marray_bound(0, MARRAY_SIZE_OFFSET),
        );
        let first_ok = self.machine.jcc(&mut self.code, Cond::LtUn);
        self.machine
            .alu_mem(&mut self.code, Alu::Add, i, array, lower0);
        self.reexecute(pc);
        self.bind(first_ok);

        self.machine
            .alu_mem(&mut self.code, Alu::Sub, j, array, lower1);
        self.machine.cmp_mem(
            &mut self.code,
            Cond::LtUn,
            j,
            array,
            marray_bound(1, MARRAY_SIZE_OFFSET),
        );
        let second_ok = self.machine.jcc(&mut self.code, Cond::LtUn);
        self.machine
            .alu_mem(&mut self.code, Alu::Add, j, array, lower1);
        self.machine
            .alu_mem(&mut self.code, Alu::Add, i, array, lower0);
        self.reexecute(pc);
        self.bind(second_ok);

        self.machine.alu_mem(
            &mut self.code,
            Alu::Mul,
            i,
            array,
            marray_bound(0, MARRAY_MULT_OFFSET),
        );
        self.machine.alu_mem(
            &mut self.code,
            Alu::Mul,
            j,
            array,
            marray_bound(1, MARRAY_MULT_OFFSET),
        );
        self.machine.alu(&mut self.code, Alu::Add, i, j, false);
        self.machine
            .alu_mem(&mut self.code, Alu::Mul, i, array, MARRAY_ELEM_SIZE_OFFSET);
        self.machine.widen(&mut self.code, i, false);
        self.machine
            .load(&mut self.code, Mem::Native, array, array, MARRAY_DATA_OFFSET);
        self.machine.alu(&mut self.code, Alu::Add, array, i, true);
    }

    pub(crate) fn read_elem(&mut self, kind: Mem, pc: usize) {
        let (array, index) = self.top_two(true, false);
        self.check_array(array, index, pc);
        self.machine
            .load_index(&mut self.code, kind, array, array, index, ARRAY_DATA_OFFSET);
        self.free_top();
        self.set_top(Slot::word(array, is_wide(kind)));
    }

    pub(crate) fn write_elem(&mut self, kind: Mem, pc: usize) {
        let (array, index, value) = self.top_three(true, false, is_wide(kind));
        self.check_array(array, index, pc);
        self.machine
            .store_index(&mut self.code, kind, value, array, index, ARRAY_DATA_OFFSET);
        for _ in 0..3 {
            self.free_top();
        }
    }

    pub(crate) fn array_len(&mut self, pc: usize) {
        let array = self.top_word(true);
        self.check_null(array, pc);
        self.machine
            .load(&mut self.code, Mem::Word32, array, array, ARRAY_LENGTH_OFFSET);
        self.set_top(Slot::Word(array));
    }

    pub(crate) fn read_at(&mut self, kind: Mem, offset: i32, pc: usize) {
        let ptr = self.top_word(true);
        self.check_null(ptr, pc);
        self.machine.load(&mut self.code, kind, ptr, ptr, offset);
        self.set_top(Slot::word(ptr, is_wide(kind)));
    }

    pub(crate) fn write_at(&mut self, kind: Mem, offset: i32, pc: usize) {
        let (ptr, value) = self.top_two(true, is_wide(kind));
        self.check_null(ptr, pc);
        self.machine.store(&mut self.code, kind, value, ptr, offset);
        self.free_top();
        self.free_top();
    }

    pub(crate) fn write_reversed(&mut self, kind: Mem, pc: usize) {
        let (value, ptr) = self.top_two(is_wide(kind), true);
        self.check_null(ptr, pc);
        self.machine.store(&mut self.code, kind, value, ptr, 0);
        self.free_top();
        self.free_top();
    }

    pub(crate) fn read_float(&mut self, pc: usize) {
        let ptr = self.top_word(true);
        self.check_null(ptr, pc);
        self.free_top();
        let value = self.fp_register();
        self.machine.fp_load(&mut self.code, value, ptr, 0);
    }

    pub(crate) fn write_float(&mut self, reversed: bool, pc: usize) {
        let (ptr, value) = if reversed {
            let regs = self.top_mixed(&[None, Some(true)]);
            (regs[1], regs[0])
        } else {
            let regs = self.top_mixed(&[Some(true), None]);
            (regs[0], regs[1])
        };
        self.check_null(ptr, pc);
        self.machine.fp_store(&mut self.code, value, ptr, 0);
        self.free_top();
        self.free_top();
    }

    pub(crate) fn read_float_elem(&mut self, pc: usize) {
        let (array, index) = self.top_two(true, false);
        self.check_array(array, index, pc);
        self.machine
            .lea_index(&mut self.code, array, array, index, 3, ARRAY_DATA_OFFSET);
        self.free_top();
        self.free_top();
        let value = self.fp_register();
        self.machine.fp_load(&mut self.code, value, array, 0);
    }

    pub(crate) fn write_float_elem(&mut self, pc: usize) {
        let regs = self.top_mixed(&[Some(true), Some(false), None]);
        let (array, index, value) = (regs[0], regs[1], regs[2]);
        self.check_array(array, index, pc);
        self.machine
            .lea_index(&mut self.code, array, array, index, 3, ARRAY_DATA_OFFSET);
        self.machine.fp_store(&mut self.code, value, array, 0);
        for _ in 0..3 {
            self.free_top();
        }
    }

    pub(crate) fn element_address(&mut self, size: u32, pc: usize) {
        let (array, index) = self.top_two(true, false);
        self.check_array(array, index, pc);
        let shift = if size.is_power_of_two() && size <= 8 {
            size.trailing_zeros() as u8
        } else {
            self.machine
                .alu_imm(&mut self.code, Alu::Mul, index, size as i32, true);
            0
        };
        self.machine
            .lea_index(&mut self.code, array, array, index, shift, ARRAY_DATA_OFFSET);
        self.free_top();
        self.set_top(Slot::Native(array));
    }

    pub(crate) fn read_this(&mut self, kind: Mem, offset: i32, pc: usize) {
        let reg = self.word_register(true);
        let frame = self.machine.frame_reg();
        self.machine.load_slot(&mut self.code, reg, true, frame, 0);
        if self.this_state != ThisState::Checked {
            self.check_null_this(reg, pc);
            if self.this_state == ThisState::Unchecked {
                self.this_state = ThisState::Checked;
            }
        }
        self.machine.load(&mut self.code, kind, reg, reg, offset);
        self.set_top(Slot::word(reg, is_wide(kind)));
    }

    pub(crate) fn cknull(&mut self, pc: usize) {
        let reg = self.top_word(true);
        self.check_null(reg, pc);
    }

    pub(crate) fn padd_i4(&mut self) {
        let (ptr, offset) = self.top_two(true, false);
        self.machine.widen(&mut self.code, offset, true);
        self.machine.alu(&mut self.code, Alu::Add, ptr, offset, true);
        self.free_top();
        self.set_top(Slot::Native(ptr));
    }

    pub(crate) fn padd_i4_reversed(&mut self) {
        let (offset, ptr) = self.top_two(false, true);
        self.machine.widen(&mut self.code, offset, true);
        self.machine.alu(&mut self.code, Alu::Add, ptr, offset, true);
        let below = self.stack.len() - 2;
        self.stack.remove(below);
        self.set_top(Slot::Native(ptr));
    }

    pub(crate) fn padd_offset(&mut self, offset: u8) {
        let ptr = self.top_word(true);
        self.machine
            .alu_imm(&mut self.code, Alu::Add, ptr, i32::from(offset), true);
        self.set_top(Slot::Native(ptr));
    }

    pub(crate) fn psub(&mut self) {
        let (a, b) = self.top_two(true, true);
        self.machine.alu(&mut self.code, Alu::Sub, a, b, true);
        self.free_top();
        self.set_top(Slot::Native(a));
    }

    pub(crate) fn psub_i4(&mut self) {
        let (ptr, offset) = self.top_two(true, false);
        self.machine.widen(&mut self.code, offset, true);
        self.machine.alu(&mut self.code, Alu::Sub, ptr, offset, true);
        self.free_top();
        self.set_top(Slot::Native(ptr));
    }

    pub(crate) fn get2d(&mut self, pc: usize) {
        let (array, i, j) = self.top_three(true, false, false);
        self.check_2d(array, i, j, pc);
        self.free_top();
        self.free_top();
        self.set_top(Slot::Native(array));
    }

    pub(crate) fn set2d(&mut self, words: u32, pc: usize) {
        self.flush();
        let offset = self.height - (words as i32 + 3);
        let regs = self.machine.word_regs();
        let (array, i, j) = (regs[0], regs[1], regs[2]);
        for reg in [array, i, j] {
            self.claim(reg);
        }
        let stack = self.machine.stack_reg();
        self.machine
            .load_slot(&mut self.code, array, true, stack, offset * WORD_BYTES);
        self.machine
            .load_slot(&mut self.code, i, false, stack, (offset + 1) * WORD_BYTES);
        self.machine
            .load_slot(&mut self.code, j, false, stack, (offset + 2) * WORD_BYTES);
        self.check_2d(array, i, j, pc);
        self.machine
            .store_slot(&mut self.code, array, true, stack, offset * WORD_BYTES);
        for word in 0..words as i32 {
            let from = (offset + 3 + word) * WORD_BYTES;
            let to = (offset + 1 + word) * WORD_BYTES;
            self.machine.load_slot(&mut self.code, i, true, stack, from);
            self.machine.store_slot(&mut self.code, i, true, stack, to);
        }
        self.height -= 2;
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::{Amd64, Mem, X86, amd64};
    use crate::unroll::regs::{Slot, ThisState, Unroller};

    #[test]
    fn this_is_checked_once_per_block() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        let start = unroller.code.len();
        unroller.read_this(Mem::Word32, 8, 0);
        let first = unroller.code.len() - start;
        assert_eq!(unroller.this_state, ThisState::Checked);
        let start = unroller.code.len();
        unroller.read_this(Mem::Word32, 12, 0);
        let second = unroller.code.len() - start;
        assert!(second < first);
        assert_eq!(unroller.stack.len(), 2);
    }

    #[test]
    fn escaped_this_is_always_checked() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.this_state = ThisState::Escaped;
        let start = unroller.code.len();
        unroller.read_this(Mem::Word32, 8, 0);
        let first = unroller.code.len() - start;
        unroller.stack.clear();
        let start = unroller.code.len();
        unroller.read_this(Mem::Word32, 8, 0);
        assert_eq!(unroller.code.len() - start, first);
        assert_eq!(unroller.this_state, ThisState::Escaped);
    }

    #[test]
    fn element_read_pops_the_index() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(true);
        unroller.word_register(false);
        unroller.read_elem(Mem::Word32, 0);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
    }

    #[test]
    fn element_write_pops_everything() {
        let machine = X86;
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.write_elem(Mem::Byte, 0);
        assert!(unroller.stack.is_empty());
        assert_eq!(unroller.height, -3);
    }

    #[test]
    fn float_read_replaces_the_pointer() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(true);
        unroller.read_float(0);
        assert_eq!(unroller.stack.len(), 1);
        assert!(unroller.stack[0].is_float());
    }

    #[test]
    fn float_writes_consume_both_operand_orders() {
        let machine = Amd64::sysv();
        for reversed in [false, true] {
            let mut unroller = Unroller::new(&machine);
            unroller.start_block();
            if reversed {
                unroller.fp_register();
                unroller.word_register(true);
            } else {
                unroller.word_register(true);
                unroller.fp_register();
            }
            let before = unroller.code.len();
            unroller.write_float(reversed, 0);
            assert!(unroller.stack.is_empty());
            assert_eq!(unroller.height, 0);
            // movsd [rax], xmm0 closes the sequence.
            assert_eq!(&unroller.code[unroller.code.len() - 4..], &[0xF2, 0x0F, 0x11, 0x00]);
            assert!(unroller.code.len() > before);
        }
    }

    #[test]
    fn float_element_write_loads_a_spilled_group() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.write_float_elem(0);
        assert!(unroller.stack.is_empty());
        assert_eq!(unroller.height, -3);
    }

    #[test]
    fn element_address_scales_odd_sizes() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(true);
        unroller.word_register(false);
        unroller.element_address(12, 0);
        assert_eq!(unroller.stack, vec![Slot::Native(amd64::RAX)]);
    }

    #[test]
    fn reversed_pointer_add_keeps_the_pointer_register() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        let ptr = unroller.word_register(true);
        unroller.padd_i4_reversed();
        assert_eq!(unroller.stack, vec![Slot::Native(ptr)]);
    }

    #[test]
    fn set2d_squashes_the_indices() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        for _ in 0..4 {
            unroller.word_register(false);
        }
        unroller.set2d(1, 0);
        assert!(unroller.stack.is_empty());
        assert_eq!(unroller.height, 2);
    }

    #[test]
    fn get2d_leaves_a_pointer() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.get2d(0);
        assert_eq!(unroller.height, -3);
        assert_eq!(unroller.stack.len(), 1);
        assert!(unroller.stack[0].is_native());
    }
}
