use super::regs::Unroller;
use crate::machine::{Cond, Machine};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Test {
    Int(Cond),
    Native(Cond),
    Zero(Cond),
}

impl<M: Machine> Unroller<'_, M> {
    pub(crate) fn branch(&mut self, target: usize) {
        self.branch_to_pc(target);
    }

    pub(crate) fn branch_if(&mut self, test: Test, target: usize, next: usize) {
        let cond = match test {
            Test::Int(cond) | Test::Native(cond) => {
                let native = matches!(test, Test::Native(_));
                let (a, b) = self.top_two(native, native);
                self.free_top();
                self.free_top();
                self.flush();
                self.machine.cmp(&mut self.code, cond, a, b, native);
                cond
            }
            Test::Zero(cond) => {
                let reg = self.top_word(true);
                self.free_top();
                self.flush();
                self.machine.cmp_imm(&mut self.code, cond, reg, 0, true);
                cond
            }
        };
        let taken = self.machine.jcc(&mut self.code, cond);
        self.exit_to(next);
        self.bind(taken);
        self.exit_to(target);
    }
}

#[cfg(test)]
mod tests {
    use super::Test;
    use crate::machine::{Amd64, Cond};
    use crate::unroll::regs::Unroller;

    #[test]
    fn conditional_branch_flushes_what_lies_below() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        for _ in 0..3 {
            unroller.word_register(false);
        }
        unroller.branch_if(Test::Int(Cond::Lt), 40, 10);
        assert!(unroller.stack.is_empty());
        assert_eq!(unroller.height, 1);
    }

    #[test]
    fn zero_test_on_an_empty_pseudo_stack() {
        let machine = Amd64::sysv();
        let mut unroller = Unroller::new(&machine);
        unroller.start_block();
        unroller.branch_if(Test::Zero(Cond::Ne), 0, 5);
        assert_eq!(unroller.height, -1);
    }
}
