pub mod amd64;
pub mod arm;
pub mod ppc;
pub mod x86;

pub use amd64::Amd64;
pub use arm::Arm;
pub use ppc::Ppc;
pub use x86::X86;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeState {
    pub pc: u64,
    pub stack: u64,
    pub frame: u64,
    pub reexecute: u64,
}

pub const STATE_PC_OFFSET: i32 = 0;
pub const STATE_STACK_OFFSET: i32 = 8;
pub const STATE_FRAME_OFFSET: i32 = 16;
pub const STATE_REEXECUTE_OFFSET: i32 = 24;

pub type BlockFn = unsafe extern "C" fn(*mut NativeState);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpModel {
    None,
    Stack { depth: usize },
    Flat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Division {
    None,
    Fixed {
        dividend: Reg,
        divisor: Reg,
        remainder: Reg,
    },
    Registers,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mem {
    Sbyte,
    Byte,
    Short,
    Ushort,
    Word32,
    Native,
}

impl Mem {
    pub fn size(self, native_size: u32) -> u32 {
        match self {
            Mem::Sbyte | Mem::Byte => 1,
            Mem::Short | Mem::Ushort => 2,
            Mem::Word32 => 4,
            Mem::Native => native_size,
        }
    }

    pub fn shift(self, native_size: u32) -> u8 {
        self.size(native_size).trailing_zeros() as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alu {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unary {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shift {
    Shl,
    Sar,
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extend {
    Sbyte,
    Byte,
    Short,
    Ushort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUn,
    LeUn,
    GtUn,
    GeUn,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
            Cond::LtUn => Cond::GeUn,
            Cond::LeUn => Cond::GtUn,
            Cond::GtUn => Cond::LeUn,
            Cond::GeUn => Cond::LtUn,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Cond::LtUn | Cond::LeUn | Cond::GtUn | Cond::GeUn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    pub at: usize,
    pub field: usize,
}

/// Architecture-neutral code emission interface.
///
/// Every method appends to `code`. Immediate loads must leave condition flags
/// untouched: the unroller materializes comparison results between a compare
/// and the branches that consume it.
pub trait Machine {
    const NAME: &'static str;
    const NATIVE_SIZE: u32;
    const FP: FpModel;
    const DIVISION: Division;

    fn word_regs(&self) -> &'static [Reg];
    fn fp_regs(&self) -> &'static [Reg];
    fn is_callee_saved(&self, reg: Reg) -> bool;
    fn stack_reg(&self) -> Reg;
    fn frame_reg(&self) -> Reg;

    fn has_long(&self) -> bool {
        Self::NATIVE_SIZE == 8
    }

    fn prologue(&self, code: &mut Vec<u8>);
    fn push(&self, code: &mut Vec<u8>, reg: Reg);
    fn pop(&self, code: &mut Vec<u8>, reg: Reg);
    fn exit(&self, code: &mut Vec<u8>, pc: u64, adjust: i32, reexecute: bool, saved: &[Reg]);

    fn mov(&self, code: &mut Vec<u8>, dst: Reg, src: Reg);
    fn load_imm(&self, code: &mut Vec<u8>, dst: Reg, value: i32);
    fn load_imm_native(&self, code: &mut Vec<u8>, dst: Reg, value: i64);

    fn load(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, disp: i32);
    fn store(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, base: Reg, disp: i32);
    fn load_index(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, index: Reg, disp: i32);
    fn store_index(
        &self,
        code: &mut Vec<u8>,
        kind: Mem,
        src: Reg,
        base: Reg,
        index: Reg,
        disp: i32,
    );

    fn load_slot(&self, code: &mut Vec<u8>, dst: Reg, native: bool, base: Reg, disp: i32) {
        let kind = if native { Mem::Native } else { Mem::Word32 };
        self.load(code, kind, dst, base, disp);
    }
    fn store_slot(&self, code: &mut Vec<u8>, src: Reg, native: bool, base: Reg, disp: i32);

    fn lea(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32);
    fn lea_index(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, index: Reg, shift: u8, disp: i32);

    fn alu(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, src: Reg, native: bool);
    fn alu_imm(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, imm: i32, native: bool);
    fn alu_mem(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, base: Reg, disp: i32);
    fn unary(&self, code: &mut Vec<u8>, op: Unary, reg: Reg, native: bool);
    /// Shift `dst` by the low five (or six) bits of `count`. `count` is
    /// dead afterwards and may be clobbered.
    fn shift(&self, code: &mut Vec<u8>, op: Shift, dst: Reg, count: Reg, native: bool);
    fn extend(&self, code: &mut Vec<u8>, kind: Extend, reg: Reg);
    fn widen(&self, code: &mut Vec<u8>, reg: Reg, signed: bool);
    fn truncate(&self, code: &mut Vec<u8>, reg: Reg);

    fn divide(
        &self,
        code: &mut Vec<u8>,
        signed: bool,
        remainder: bool,
        native: bool,
        dst: Reg,
        src: Reg,
    );

    fn cmp(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, b: Reg, native: bool);
    fn cmp_imm(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, imm: i64, native: bool);
    fn cmp_mem(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, base: Reg, disp: i32);
    fn jcc(&self, code: &mut Vec<u8>, cond: Cond) -> Patch;
    fn jmp(&self, code: &mut Vec<u8>) -> Patch;
    fn patch(&self, code: &mut [u8], patch: Patch, target: usize);

    fn fp_load(&self, _code: &mut Vec<u8>, _dst: Reg, _base: Reg, _disp: i32) {}
    fn fp_store(&self, _code: &mut Vec<u8>, _src: Reg, _base: Reg, _disp: i32) {}
    fn fp_const(&self, _code: &mut Vec<u8>, _dst: Reg, _value: f64) {}
    /// `dst = dst op src`; on a stack FPU the operands are `st1 op st0`.
    fn fp_op(&self, _code: &mut Vec<u8>, _op: FpOp, _dst: Reg, _src: Reg) {}
    fn fp_neg(&self, _code: &mut Vec<u8>, _reg: Reg) {}
    fn fp_swap(&self, _code: &mut Vec<u8>) {}
    fn fp_rem_supported(&self) -> bool {
        false
    }
    /// Three-way compare of two float registers into `dst`, which gets
    /// `unordered` when either operand is NaN.
    fn fp_cmp(&self, _code: &mut Vec<u8>, _dst: Reg, _a: Reg, _b: Reg, _unordered: i32) {}
    fn fp_cmp_supported(&self) -> bool {
        false
    }
}

pub(crate) fn patch_rel32(code: &mut [u8], patch: Patch, target: usize) {
    let rel = target as i64 - (patch.field as i64 + 4);
    code[patch.field..patch.field + 4].copy_from_slice(&(rel as i32).to_le_bytes());
}

pub(crate) fn fits_i8(value: i64) -> bool {
    (i8::MIN as i64..=i8::MAX as i64).contains(&value)
}

pub(crate) fn fits_i16(value: i64) -> bool {
    (i16::MIN as i64..=i16::MAX as i64).contains(&value)
}

pub(crate) fn fits_i32(value: i64) -> bool {
    (i32::MIN as i64..=i32::MAX as i64).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_layout_matches_offsets() {
        assert_eq!(std::mem::offset_of!(NativeState, pc) as i32, STATE_PC_OFFSET);
        assert_eq!(std::mem::offset_of!(NativeState, stack) as i32, STATE_STACK_OFFSET);
        assert_eq!(std::mem::offset_of!(NativeState, frame) as i32, STATE_FRAME_OFFSET);
        assert_eq!(
            std::mem::offset_of!(NativeState, reexecute) as i32,
            STATE_REEXECUTE_OFFSET
        );
    }

    #[test]
    fn negated_conditions_are_involutive() {
        for cond in [
            Cond::Eq,
            Cond::Ne,
            Cond::Lt,
            Cond::Le,
            Cond::Gt,
            Cond::Ge,
            Cond::LtUn,
            Cond::LeUn,
            Cond::GtUn,
            Cond::GeUn,
        ] {
            assert_eq!(cond.negate().negate(), cond);
            assert_eq!(cond.negate().is_unsigned(), cond.is_unsigned());
        }
    }
}
