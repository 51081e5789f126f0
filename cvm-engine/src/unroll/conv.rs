use super::regs::{Slot, Unroller};
use crate::machine::{Extend, Machine};

impl<M: Machine> Unroller<'_, M> {
    pub(crate) fn narrow(&mut self, kind: Extend) {
        let reg = self.top_word(false);
        self.machine.extend(&mut self.code, kind, reg);
        self.set_top(Slot::Word(reg));
    }

    pub(crate) fn widen_top(&mut self, signed: bool) {
        let reg = self.top_word(false);
        self.machine.widen(&mut self.code, reg, signed);
        self.set_top(Slot::Native(reg));
    }

    pub(crate) fn truncate_top(&mut self) {
        let reg = self.top_word(true);
        self.machine.truncate(&mut self.code, reg);
        self.set_top(Slot::Word(reg));
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::{Amd64, Extend, amd64};
    use crate::unroll::regs::{Slot, Unroller};

    #[test]
    fn widening_retags_the_top() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.word_register(false);
        unroller.widen_top(true);
        assert_eq!(unroller.stack, vec![Slot::Native(amd64::RAX)]);
        // movsxd rax, eax
        assert_eq!(&unroller.code[unroller.code.len() - 3..], &[0x48, 0x63, 0xC0]);
        unroller.truncate_top();
        assert_eq!(unroller.stack, vec![Slot::Word(amd64::RAX)]);
    }

    #[test]
    fn narrowing_a_rolled_value() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.narrow(Extend::Sbyte);
        assert_eq!(unroller.height, -1);
        // movsx eax, al
        assert_eq!(&unroller.code[unroller.code.len() - 3..], &[0x0F, 0xBE, 0xC0]);
    }
}
