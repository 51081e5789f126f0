use super::{
    Alu, Cond, Division, Extend, FpModel, Machine, Mem, Patch, Reg, STATE_FRAME_OFFSET,
    STATE_PC_OFFSET, STATE_REEXECUTE_OFFSET, STATE_STACK_OFFSET, Shift, Unary, fits_i16,
};

const R0: Reg = Reg(0);
const SP: Reg = Reg(1);
const ADDR: Reg = Reg(12);
const STATE: Reg = Reg(18);
const STACK: Reg = Reg(19);
const FRAME: Reg = Reg(20);

static WORD_REGS: [Reg; 9] = [
    Reg(9),
    Reg(11),
    Reg(10),
    Reg(8),
    Reg(7),
    Reg(6),
    Reg(5),
    Reg(4),
    Reg(3),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ppc;

fn word(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_be_bytes());
}

fn r(reg: Reg) -> u32 {
    reg.0 as u32
}

fn d_form(op: u32, rt: Reg, ra: Reg, imm: i32) -> u32 {
    op << 26 | r(rt) << 21 | r(ra) << 16 | (imm as u32 & 0xFFFF)
}

fn x_form(rt: Reg, ra: Reg, rb: Reg, xo: u32) -> u32 {
    31 << 26 | r(rt) << 21 | r(ra) << 16 | r(rb) << 11 | xo << 1
}

fn rlwinm(ra: Reg, rs: Reg, sh: u32, mb: u32, me: u32) -> u32 {
    21 << 26 | r(rs) << 21 | r(ra) << 16 | sh << 11 | mb << 6 | me << 1
}

fn branch_fields(cond: Cond) -> (u32, u32) {
    const TRUE: u32 = 12;
    const FALSE: u32 = 4;
    const LT: u32 = 0;
    const GT: u32 = 1;
    const EQ: u32 = 2;
    match cond {
        Cond::Eq => (TRUE, EQ),
        Cond::Ne => (FALSE, EQ),
        Cond::Lt | Cond::LtUn => (TRUE, LT),
        Cond::Ge | Cond::GeUn => (FALSE, LT),
        Cond::Gt | Cond::GtUn => (TRUE, GT),
        Cond::Le | Cond::LeUn => (FALSE, GT),
    }
}

impl Ppc {
    fn address(&self, code: &mut Vec<u8>, base: Reg, disp: i32) -> (Reg, i32) {
        if fits_i16(disp as i64) {
            return (base, disp);
        }
        self.load_imm(code, ADDR, disp);
        word(code, x_form(ADDR, base, ADDR, 266)); // add
        (ADDR, 0)
    }

    fn index_address(&self, code: &mut Vec<u8>, kind: Mem, base: Reg, index: Reg) {
        let shift = kind.shift(Self::NATIVE_SIZE) as u32;
        word(code, rlwinm(ADDR, index, shift, 0, 31 - shift));
        word(code, x_form(ADDR, base, ADDR, 266));
    }

    fn transfer(&self, code: &mut Vec<u8>, kind: Mem, load: bool, rt: Reg, base: Reg, disp: i32) {
        let (base, disp) = self.address(code, base, disp);
        let op = match (kind, load) {
            (Mem::Sbyte | Mem::Byte, true) => 34,
            (Mem::Sbyte | Mem::Byte, false) => 38,
            (Mem::Short, true) => 42,
            (Mem::Ushort, true) => 40,
            (Mem::Short | Mem::Ushort, false) => 44,
            (Mem::Word32 | Mem::Native, true) => 32,
            (Mem::Word32 | Mem::Native, false) => 36,
        };
        word(code, d_form(op, rt, base, disp));
        if load && kind == Mem::Sbyte {
            word(code, x_form(rt, rt, R0, 954)); // extsb
        }
    }
}

impl Machine for Ppc {
    const NAME: &'static str = "ppc";
    const NATIVE_SIZE: u32 = 4;
    const FP: FpModel = FpModel::None;
    const DIVISION: Division = Division::Registers;

    fn word_regs(&self) -> &'static [Reg] {
        &WORD_REGS
    }

    fn fp_regs(&self) -> &'static [Reg] {
        &[]
    }

    fn is_callee_saved(&self, _reg: Reg) -> bool {
        false
    }

    fn stack_reg(&self) -> Reg {
        STACK
    }

    fn frame_reg(&self) -> Reg {
        FRAME
    }

    fn prologue(&self, code: &mut Vec<u8>) {
        word(code, d_form(37, SP, SP, -16)); // stwu r1, -16(r1)
        word(code, d_form(36, STATE, SP, 4));
        word(code, d_form(36, STACK, SP, 8));
        word(code, d_form(36, FRAME, SP, 12));
        self.mov(code, STATE, Reg(3));
        self.load_slot(code, STACK, true, STATE, STATE_STACK_OFFSET);
        self.load_slot(code, FRAME, true, STATE, STATE_FRAME_OFFSET);
    }

    fn push(&self, code: &mut Vec<u8>, reg: Reg) {
        word(code, d_form(37, reg, SP, -16));
    }

    fn pop(&self, code: &mut Vec<u8>, reg: Reg) {
        word(code, d_form(32, reg, SP, 0));
        word(code, d_form(14, SP, SP, 16));
    }

    fn exit(&self, code: &mut Vec<u8>, pc: u64, adjust: i32, reexecute: bool, saved: &[Reg]) {
        if adjust != 0 {
            self.lea(code, STACK, STACK, adjust);
        }
        self.store(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET + 4);
        self.load_imm(code, R0, pc as u32 as i32);
        self.store(code, Mem::Native, R0, STATE, STATE_PC_OFFSET + 4);
        self.load_imm(code, R0, (pc >> 32) as u32 as i32);
        self.store(code, Mem::Native, R0, STATE, STATE_PC_OFFSET);
        self.load_imm(code, R0, i32::from(reexecute));
        self.store(code, Mem::Native, R0, STATE, STATE_REEXECUTE_OFFSET + 4);
        self.load_imm(code, R0, 0);
        self.store(code, Mem::Native, R0, STATE, STATE_REEXECUTE_OFFSET);
        for reg in saved.iter().rev() {
            self.pop(code, *reg);
        }
        word(code, d_form(32, STATE, SP, 4));
        word(code, d_form(32, STACK, SP, 8));
        word(code, d_form(32, FRAME, SP, 12));
        word(code, d_form(14, SP, SP, 16)); // addi r1, r1, 16
        word(code, 0x4E80_0020); // blr
    }

    fn mov(&self, code: &mut Vec<u8>, dst: Reg, src: Reg) {
        // or dst, src, src
        word(code, x_form(src, dst, src, 444));
    }

    fn load_imm(&self, code: &mut Vec<u8>, dst: Reg, value: i32) {
        if fits_i16(value as i64) {
            word(code, d_form(14, dst, R0, value)); // li
        } else {
            word(code, d_form(15, dst, R0, value >> 16)); // lis
            if value & 0xFFFF != 0 {
                word(code, d_form(24, dst, dst, value & 0xFFFF)); // ori
            }
        }
    }

    fn load_imm_native(&self, code: &mut Vec<u8>, dst: Reg, value: i64) {
        self.load_imm(code, dst, value as i32);
    }

    fn load_slot(&self, code: &mut Vec<u8>, dst: Reg, _native: bool, base: Reg, disp: i32) {
        self.load(code, Mem::Word32, dst, base, disp + 4);
    }

    fn load(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, disp: i32) {
        self.transfer(code, kind, true, dst, base, disp);
    }

    fn store(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, base: Reg, disp: i32) {
        self.transfer(code, kind, false, src, base, disp);
    }

    fn load_index(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, index: Reg, disp: i32) {
        self.index_address(code, kind, base, index);
        self.transfer(code, kind, true, dst, ADDR, disp);
    }

    fn store_index(
        &self,
        code: &mut Vec<u8>,
        kind: Mem,
        src: Reg,
        base: Reg,
        index: Reg,
        disp: i32,
    ) {
        self.index_address(code, kind, base, index);
        self.transfer(code, kind, false, src, ADDR, disp);
    }

    fn store_slot(&self, code: &mut Vec<u8>, src: Reg, _native: bool, base: Reg, disp: i32) {
        self.store(code, Mem::Word32, src, base, disp + 4);
        self.load_imm(code, R0, 0);
        self.store(code, Mem::Word32, R0, base, disp);
    }

    fn lea(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        if fits_i16(disp as i64) {
            word(code, d_form(14, dst, base, disp));
        } else {
            self.load_imm(code, R0, disp);
            word(code, x_form(dst, base, R0, 266));
        }
    }

    fn lea_index(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, index: Reg, shift: u8, disp: i32) {
        let shift = shift as u32;
        word(code, rlwinm(R0, index, shift, 0, 31 - shift));
        word(code, x_form(dst, base, R0, 266));
        if disp != 0 {
            self.lea(code, dst, dst, disp);
        }
    }

    fn alu(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, src: Reg, _native: bool) {
        let insn = match op {
            Alu::Add => x_form(dst, dst, src, 266),
            Alu::Sub => x_form(dst, src, dst, 40), // subf dst, src, dst
            Alu::Mul => x_form(dst, dst, src, 235),
            Alu::And => x_form(dst, dst, src, 28),
            Alu::Or => x_form(dst, dst, src, 444),
            Alu::Xor => x_form(dst, dst, src, 316),
        };
        word(code, insn);
    }

    fn alu_imm(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, imm: i32, native: bool) {
        if op == Alu::Add && fits_i16(imm as i64) {
            word(code, d_form(14, dst, dst, imm));
            return;
        }
        self.load_imm(code, R0, imm);
        self.alu(code, op, dst, R0, native);
    }

    fn alu_mem(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, base: Reg, disp: i32) {
        self.load(code, Mem::Word32, R0, base, disp);
        self.alu(code, op, dst, R0, false);
    }

    fn unary(&self, code: &mut Vec<u8>, op: Unary, reg: Reg, _native: bool) {
        match op {
            Unary::Neg => word(code, x_form(reg, reg, R0, 104)),
            Unary::Not => word(code, x_form(reg, reg, reg, 124)), // nor
        }
    }

    fn shift(&self, code: &mut Vec<u8>, op: Shift, dst: Reg, count: Reg, _native: bool) {
        let xo = match op {
            Shift::Shl => 24,
            Shift::Shr => 536,
            Shift::Sar => 792,
        };
        word(code, rlwinm(R0, count, 0, 27, 31));
        word(code, x_form(dst, dst, R0, xo));
    }

    fn extend(&self, code: &mut Vec<u8>, kind: Extend, reg: Reg) {
        let insn = match kind {
            Extend::Sbyte => x_form(reg, reg, R0, 954),
            Extend::Short => x_form(reg, reg, R0, 922),
            Extend::Byte => rlwinm(reg, reg, 0, 24, 31),
            Extend::Ushort => rlwinm(reg, reg, 0, 16, 31),
        };
        word(code, insn);
    }

    fn widen(&self, _code: &mut Vec<u8>, _reg: Reg, _signed: bool) {}

    fn truncate(&self, _code: &mut Vec<u8>, _reg: Reg) {}

    fn divide(
        &self,
        code: &mut Vec<u8>,
        signed: bool,
        remainder: bool,
        _native: bool,
        dst: Reg,
        src: Reg,
    ) {
        let xo = if signed { 491 } else { 459 };
        if remainder {
            word(code, x_form(R0, dst, src, xo));
            word(code, x_form(R0, R0, src, 235)); // mullw
            word(code, x_form(dst, R0, dst, 40)); // subf
        } else {
            word(code, x_form(dst, dst, src, xo));
        }
    }

    fn cmp(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, b: Reg, _native: bool) {
        let xo = if cond.is_unsigned() { 32 } else { 0 };
        word(code, x_form(R0, a, b, xo));
    }

    fn cmp_imm(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, imm: i64, native: bool) {
        let fits = if cond.is_unsigned() {
            (0..=0xFFFF).contains(&imm)
        } else {
            fits_i16(imm)
        };
        if fits {
            let op = if cond.is_unsigned() { 10 } else { 11 };
            word(code, op << 26 | r(a) << 16 | (imm as u32 & 0xFFFF));
        } else {
            self.load_imm(code, R0, imm as i32);
            self.cmp(code, cond, a, R0, native);
        }
    }

    fn cmp_mem(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, base: Reg, disp: i32) {
        self.load(code, Mem::Word32, R0, base, disp);
        self.cmp(code, cond, a, R0, false);
    }

    fn jcc(&self, code: &mut Vec<u8>, cond: Cond) -> Patch {
        let (bo, bi) = branch_fields(cond);
        let at = code.len();
        word(code, 16 << 26 | bo << 21 | bi << 16);
        Patch { at, field: at }
    }

    fn jmp(&self, code: &mut Vec<u8>) -> Patch {
        let at = code.len();
        word(code, 18 << 26);
        Patch { at, field: at }
    }

    fn patch(&self, code: &mut [u8], patch: Patch, target: usize) {
        let rel = (target as i64 - patch.at as i64) as u32;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&code[patch.field..patch.field + 4]);
        let insn = u32::from_be_bytes(bytes);
        let mask = if insn >> 26 == 16 { 0x0000_FFFC } else { 0x03FF_FFFC };
        let insn = insn & !mask | rel & mask;
        code[patch.field..patch.field + 4].copy_from_slice(&insn.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn prologue_saves_specials_and_reads_low_halves() {
        let mut code = Vec::new();
        Ppc.prologue(&mut code);
        assert_eq!(
            words(&code),
            [
                0x9421_FFF0, // stwu r1, -16(r1)
                0x9241_0004, // stw r18, 4(r1)
                0x9261_0008, // stw r19, 8(r1)
                0x9281_000C, // stw r20, 12(r1)
                0x7C72_1B78, // mr r18, r3
                0x8272_000C, // lwz r19, 12(r18)
                0x8292_0014, // lwz r20, 20(r18)
            ]
        );
    }

    #[test]
    fn large_immediates_split_into_lis_ori() {
        let mut code = Vec::new();
        Ppc.load_imm(&mut code, Reg(9), 0x12345);
        assert_eq!(words(&code), [0x3D20_0001, 0x6129_2345]);
    }

    #[test]
    fn remainder_goes_through_r0() {
        let mut code = Vec::new();
        Ppc.divide(&mut code, true, true, false, Reg(9), Reg(11));
        assert_eq!(words(&code), [0x7C09_5BD6, 0x7C00_59D6, 0x7D20_4850]);
    }

    #[test]
    fn conditional_branch_patch_keeps_fields() {
        let mut code = Vec::new();
        let patch = Ppc.jcc(&mut code, Cond::Ne);
        word(&mut code, 0x6000_0000);
        Ppc.patch(&mut code, patch, 8);
        assert_eq!(words(&code)[0], 0x4082_0008);
    }

    #[test]
    fn unsigned_compares_use_logical_forms() {
        let mut code = Vec::new();
        Ppc.cmp(&mut code, Cond::LtUn, Reg(9), Reg(11), false);
        Ppc.cmp(&mut code, Cond::Lt, Reg(9), Reg(11), false);
        assert_eq!(words(&code), [0x7C09_5840, 0x7C09_5800]);
    }
}
