use super::regs::{Slot, Unroller};
use crate::machine::{Alu, Cond, Division, FpOp, Machine, Shift, Unary};

impl<M: Machine> Unroller<'_, M> {
    pub(crate) fn binary(&mut self, op: Alu, native: bool) {
        let (a, b) = self.top_two(native, native);
        self.machine.alu(&mut self.code, op, a, b, native);
        self.free_top();
        self.set_top(Slot::word(a, native));
    }

    pub(crate) fn unary_op(&mut self, op: Unary, native: bool) {
        let reg = self.top_word(native);
        self.machine.unary(&mut self.code, op, reg, native);
        self.set_top(Slot::word(reg, native));
    }

    pub(crate) fn shift_op(&mut self, op: Shift, native: bool) {
        let (value, count) = self.top_two(native, false);
        self.machine
            .shift(&mut self.code, op, value, count, native);
        self.free_top();
        self.set_top(Slot::word(value, native));
    }

    pub(crate) fn divide_op(&mut self, signed: bool, remainder: bool, native: bool, pc: usize) {
        let (a, b) = match M::DIVISION {
            Division::Fixed {
                dividend, divisor, ..
            } => {
                self.top_fixed(&[dividend, divisor], &[native, native]);
                (dividend, divisor)
            }
            Division::Registers => self.top_two(native, native),
            Division::None => return,
        };

        self.machine
            .cmp_imm(&mut self.code, Cond::Eq, b, 0, native);
        if signed {
            let fail = self.machine.jcc(&mut self.code, Cond::Eq);
            let min = if native { i64::MIN } else { i32::MIN as i64 };
            self.machine
                .cmp_imm(&mut self.code, Cond::Ne, b, -1, native);
            let ok_divisor = self.machine.jcc(&mut self.code, Cond::Ne);
            self.machine
                .cmp_imm(&mut self.code, Cond::Ne, a, min, native);
            let ok_dividend = self.machine.jcc(&mut self.code, Cond::Ne);
            self.bind(fail);
            self.reexecute(pc);
            self.bind(ok_divisor);
            self.bind(ok_dividend);
        } else {
            let ok = self.machine.jcc(&mut self.code, Cond::Ne);
            self.reexecute(pc);
            self.bind(ok);
        }

        self.machine
            .divide(&mut self.code, signed, remainder, native, a, b);
        self.free_top();
        let result = match M::DIVISION {
            Division::Fixed {
                remainder: rem_reg, ..
            } if remainder => rem_reg,
            _ => a,
        };
        self.set_top(Slot::word(result, native));
    }

    pub(crate) fn float_op(&mut self, op: FpOp) {
        if op == FpOp::Rem {
            self.flush();
        }
        let (a, b) = self.top_two_fp();
        self.machine.fp_op(&mut self.code, op, a, b);
        self.free_top();
    }

    pub(crate) fn float_neg(&mut self) {
        let reg = self.top_fp();
        self.machine.fp_neg(&mut self.code, reg);
    }

    pub(crate) fn compare(&mut self, native: bool, unsigned: bool) {
        let (a, b) = self.top_two(native, native);
        let less = if unsigned { Cond::LtUn } else { Cond::Lt };
        self.machine.cmp(&mut self.code, less, a, b, native);
        self.machine.load_imm(&mut self.code, a, 0);
        let equal = self.machine.jcc(&mut self.code, Cond::Eq);
        self.machine.load_imm(&mut self.code, a, -1);
        let below = self.machine.jcc(&mut self.code, less);
        self.machine.load_imm(&mut self.code, a, 1);
        self.bind(equal);
        self.bind(below);
        self.free_top();
        self.set_top(Slot::Word(a));
    }

    pub(crate) fn float_compare(&mut self, unordered: i32) {
        let (a, b) = self.top_two_fp();
        let dst = self.word_register(false);
        self.machine.fp_cmp(&mut self.code, dst, a, b, unordered);
        let len = self.stack.len();
        self.stack.drain(len - 3..len - 1);
    }

    pub(crate) fn set_cond(&mut self, cond: Cond) {
        let reg = self.top_word(false);
        self.machine.cmp_imm(&mut self.code, cond, reg, 0, false);
        self.machine.load_imm(&mut self.code, reg, 1);
        let done = self.machine.jcc(&mut self.code, cond);
        self.machine.load_imm(&mut self.code, reg, 0);
        self.bind(done);
        self.set_top(Slot::Word(reg));
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::{Alu, Amd64, Cond, FpOp, Ppc, X86, amd64};
    use crate::unroll::regs::{Slot, Unroller};

    #[test]
    fn float_compare_leaves_a_word() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.fp_register();
        unroller.fp_register();
        unroller.float_compare(1);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
        assert_eq!(unroller.height, 0);
    }

    #[test]
    fn fixed_division_leaves_the_remainder_register() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        unroller.word_register(false);
        unroller.divide_op(true, true, false, 4);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RDX)]);
        // cdq; idiv ecx
        let tail = &unroller.code[unroller.code.len() - 3..];
        assert_eq!(tail, &[0x99, 0xF7, 0xF9]);
    }

    #[test]
    fn misplaced_dividend_is_flushed_and_reloaded() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        unroller.word_register(false);
        unroller.word_register(false);
        unroller.divide_op(false, false, false, 0);
        assert_eq!(unroller.height, 1);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
    }

    #[test]
    fn register_division_keeps_operands_in_place() {
        let machine = Ppc;
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        let a = unroller.word_register(false);
        unroller.word_register(false);
        unroller.divide_op(true, false, false, 0);
        assert_eq!(unroller.stack, vec![Slot::Word(a)]);
        assert_eq!(unroller.height, 0);
    }

    #[test]
    fn binary_ops_pop_one_entry() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        unroller.word_register(false);
        unroller.binary(Alu::Add, false);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
        // add eax, ecx
        assert_eq!(&unroller.code[unroller.code.len() - 2..], &[0x01, 0xC8]);
    }

    #[test]
    fn x87_remainder_starts_from_memory() {
        let machine = X86;
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.fp_register();
        unroller.fp_register();
        unroller.float_op(FpOp::Rem);
        assert_eq!(unroller.height, 0);
        assert_eq!(unroller.stack.len(), 1);
        assert!(unroller.stack[0].is_float());
    }

    #[test]
    fn set_cond_keeps_a_word() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(true);
        unroller.set_cond(Cond::Lt);
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
    }
}
