use super::{
    Alu, Cond, Division, Extend, FpModel, FpOp, Machine, Mem, Patch, Reg, STATE_FRAME_OFFSET,
    STATE_PC_OFFSET, STATE_REEXECUTE_OFFSET, STATE_STACK_OFFSET, Shift, Unary,
};

const STATE: Reg = Reg(4);
const STACK: Reg = Reg(5);
const FRAME: Reg = Reg(6);
const SCRATCH: Reg = Reg(12);

static WORD_REGS: [Reg; 7] = [Reg(0), Reg(1), Reg(2), Reg(3), Reg(7), Reg(8), Reg(9)];
static FP_REGS: [Reg; 8] = [
    Reg(0),
    Reg(1),
    Reg(2),
    Reg(3),
    Reg(4),
    Reg(5),
    Reg(6),
    Reg(7),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Arm;

fn word(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn r(reg: Reg) -> u32 {
    reg.0 as u32
}

fn cond_bits(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::GeUn => 0x2,
        Cond::LtUn => 0x3,
        Cond::GtUn => 0x8,
        Cond::LeUn => 0x9,
        Cond::Ge => 0xA,
        Cond::Lt => 0xB,
        Cond::Gt => 0xC,
        Cond::Le => 0xD,
    }
}

fn up_bit(disp: i32) -> u32 {
    if disp >= 0 { 1 << 23 } else { 0 }
}

impl Arm {
    fn mov32(&self, code: &mut Vec<u8>, dst: Reg, value: u32) {
        let low = value & 0xFFFF;
        word(code, 0xE300_0000 | (low >> 12) << 16 | r(dst) << 12 | (low & 0xFFF));
        let high = value >> 16;
        if high != 0 {
            word(code, 0xE340_0000 | (high >> 12) << 16 | r(dst) << 12 | (high & 0xFFF));
        }
    }

    fn dp(&self, code: &mut Vec<u8>, opcode: u32, rd: Reg, rn: Reg, rm: Reg) {
        word(code, opcode | r(rn) << 16 | r(rd) << 12 | r(rm));
    }

    fn address(&self, code: &mut Vec<u8>, base: Reg, disp: i32, limit: u32) -> (Reg, i32) {
        if disp.unsigned_abs() < limit {
            return (base, disp);
        }
        self.mov32(code, SCRATCH, disp as u32);
        self.dp(code, 0xE080_0000, SCRATCH, base, SCRATCH);
        (SCRATCH, 0)
    }

    fn transfer(&self, code: &mut Vec<u8>, kind: Mem, load: bool, rd: Reg, base: Reg, disp: i32) {
        match kind {
            Mem::Byte | Mem::Word32 | Mem::Native | Mem::Sbyte if !load || kind != Mem::Sbyte => {
                let (base, disp) = self.address(code, base, disp, 4096);
                let opcode = match (kind, load) {
                    (Mem::Byte | Mem::Sbyte, true) => 0xE5D0_0000,
                    (Mem::Byte | Mem::Sbyte, false) => 0xE5C0_0000,
                    (_, true) => 0xE590_0000,
                    (_, false) => 0xE580_0000,
                };
                word(
                    code,
                    opcode & !(1 << 23) | up_bit(disp) | r(base) << 16 | r(rd) << 12
                        | disp.unsigned_abs(),
                );
            }
            _ => {
                let (base, disp) = self.address(code, base, disp, 256);
                let opcode = match (kind, load) {
                    (Mem::Sbyte, _) => 0xE1D0_00D0,
                    (Mem::Short, true) => 0xE1D0_00F0,
                    (Mem::Ushort, true) => 0xE1D0_00B0,
                    _ => 0xE1C0_00B0,
                };
                let imm = disp.unsigned_abs();
                word(
                    code,
                    opcode & !(1 << 23) | up_bit(disp) | r(base) << 16 | r(rd) << 12
                        | (imm >> 4) << 8
                        | (imm & 0xF),
                );
            }
        }
    }

    fn index_base(&self, code: &mut Vec<u8>, kind: Mem, base: Reg, index: Reg) {
        let shift = kind.shift(Self::NATIVE_SIZE) as u32;
        word(
            code,
            0xE080_0000 | r(base) << 16 | r(SCRATCH) << 12 | shift << 7 | r(index),
        );
    }

    fn vfp_transfer(&self, code: &mut Vec<u8>, opcode: u32, reg: Reg, base: Reg, disp: i32) {
        let (base, disp) = if disp % 4 == 0 && disp.unsigned_abs() < 1024 {
            (base, disp)
        } else {
            self.mov32(code, SCRATCH, disp as u32);
            self.dp(code, 0xE080_0000, SCRATCH, base, SCRATCH);
            (SCRATCH, 0)
        };
        word(
            code,
            opcode | up_bit(disp) | r(base) << 16 | r(reg) << 12 | disp.unsigned_abs() / 4,
        );
    }
}

impl Machine for Arm {
    const NAME: &'static str = "arm";
    const NATIVE_SIZE: u32 = 4;
    const FP: FpModel = FpModel::Flat;
    const DIVISION: Division = Division::None;

    fn word_regs(&self) -> &'static [Reg] {
        &WORD_REGS
    }

    fn fp_regs(&self) -> &'static [Reg] {
        &FP_REGS
    }

    fn is_callee_saved(&self, reg: Reg) -> bool {
        (7..=9).contains(&reg.0)
    }

    fn stack_reg(&self) -> Reg {
        STACK
    }

    fn frame_reg(&self) -> Reg {
        FRAME
    }

    fn prologue(&self, code: &mut Vec<u8>) {
        word(code, 0xE92D_0070); // stmdb sp!, {r4-r6}
        word(code, 0xE1A0_4000); // mov r4, r0
        self.load(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.load(code, Mem::Native, FRAME, STATE, STATE_FRAME_OFFSET);
    }

    fn push(&self, code: &mut Vec<u8>, reg: Reg) {
        word(code, 0xE52D_0004 | r(reg) << 12);
    }

    fn pop(&self, code: &mut Vec<u8>, reg: Reg) {
        word(code, 0xE49D_0004 | r(reg) << 12);
    }

    fn exit(&self, code: &mut Vec<u8>, pc: u64, adjust: i32, reexecute: bool, saved: &[Reg]) {
        if adjust != 0 {
            self.lea(code, STACK, STACK, adjust);
        }
        self.store(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.mov32(code, SCRATCH, pc as u32);
        self.store(code, Mem::Native, SCRATCH, STATE, STATE_PC_OFFSET);
        self.mov32(code, SCRATCH, (pc >> 32) as u32);
        self.store(code, Mem::Native, SCRATCH, STATE, STATE_PC_OFFSET + 4);
        self.mov32(code, SCRATCH, u32::from(reexecute));
        self.store(code, Mem::Native, SCRATCH, STATE, STATE_REEXECUTE_OFFSET);
        self.mov32(code, SCRATCH, 0);
        self.store(code, Mem::Native, SCRATCH, STATE, STATE_REEXECUTE_OFFSET + 4);
        for reg in saved.iter().rev() {
            self.pop(code, *reg);
        }
        word(code, 0xE8BD_0070); // ldmia sp!, {r4-r6}
        word(code, 0xE12F_FF1E); // bx lr
    }

    fn mov(&self, code: &mut Vec<u8>, dst: Reg, src: Reg) {
        word(code, 0xE1A0_0000 | r(dst) << 12 | r(src));
    }

    fn load_imm(&self, code: &mut Vec<u8>, dst: Reg, value: i32) {
        self.mov32(code, dst, value as u32);
    }

    fn load_imm_native(&self, code: &mut Vec<u8>, dst: Reg, value: i64) {
        self.mov32(code, dst, value as u32);
    }

    fn load(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, disp: i32) {
        self.transfer(code, kind, true, dst, base, disp);
    }

    fn store(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, base: Reg, disp: i32) {
        self.transfer(code, kind, false, src, base, disp);
    }

    fn load_index(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, index: Reg, disp: i32) {
        self.index_base(code, kind, base, index);
        self.transfer(code, kind, true, dst, SCRATCH, disp);
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
        self.index_base(code, kind, base, index);
        self.transfer(code, kind, false, src, SCRATCH, disp);
    }

    fn store_slot(&self, code: &mut Vec<u8>, src: Reg, _native: bool, base: Reg, disp: i32) {
        self.store(code, Mem::Word32, src, base, disp);
        self.mov32(code, SCRATCH, 0);
        self.store(code, Mem::Word32, SCRATCH, base, disp + 4);
    }

    fn lea(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        match disp {
            0..=255 => word(code, 0xE280_0000 | r(base) << 16 | r(dst) << 12 | disp as u32),
            -255..=-1 => {
                word(code, 0xE240_0000 | r(base) << 16 | r(dst) << 12 | disp.unsigned_abs())
            }
            _ => {
                self.mov32(code, SCRATCH, disp as u32);
                self.dp(code, 0xE080_0000, dst, base, SCRATCH);
            }
        }
    }

    fn lea_index(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, index: Reg, shift: u8, disp: i32) {
        word(
            code,
            0xE080_0000 | r(base) << 16 | r(dst) << 12 | (shift as u32) << 7 | r(index),
        );
        if disp != 0 {
            self.lea(code, dst, dst, disp);
        }
    }

    fn alu(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, src: Reg, _native: bool) {
        match op {
            Alu::Mul => word(code, 0xE000_0090 | r(dst) << 16 | r(src) << 8 | r(dst)),
            Alu::Add => self.dp(code, 0xE080_0000, dst, dst, src),
            Alu::Sub => self.dp(code, 0xE040_0000, dst, dst, src),
            Alu::And => self.dp(code, 0xE000_0000, dst, dst, src),
            Alu::Or => self.dp(code, 0xE180_0000, dst, dst, src),
            Alu::Xor => self.dp(code, 0xE020_0000, dst, dst, src),
        }
    }

    fn alu_imm(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, imm: i32, native: bool) {
        self.mov32(code, SCRATCH, imm as u32);
        self.alu(code, op, dst, SCRATCH, native);
    }

    fn alu_mem(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, base: Reg, disp: i32) {
        self.load(code, Mem::Word32, SCRATCH, base, disp);
        self.alu(code, op, dst, SCRATCH, false);
    }

    fn unary(&self, code: &mut Vec<u8>, op: Unary, reg: Reg, _native: bool) {
        match op {
            Unary::Neg => word(code, 0xE260_0000 | r(reg) << 16 | r(reg) << 12), // rsb rd, rd, #0
            Unary::Not => word(code, 0xE1E0_0000 | r(reg) << 12 | r(reg)),
        }
    }

    fn shift(&self, code: &mut Vec<u8>, op: Shift, dst: Reg, count: Reg, _native: bool) {
        let kind = match op {
            Shift::Shl => 0,
            Shift::Shr => 1,
            Shift::Sar => 2,
        };
        word(code, 0xE200_C01F | r(count) << 16); // and r12, count, #31
        word(
            code,
            0xE1A0_0010 | r(dst) << 12 | r(SCRATCH) << 8 | kind << 5 | r(dst),
        );
    }

    fn extend(&self, code: &mut Vec<u8>, kind: Extend, reg: Reg) {
        let opcode = match kind {
            Extend::Sbyte => 0xE6AF_0070,
            Extend::Byte => 0xE6EF_0070,
            Extend::Short => 0xE6BF_0070,
            Extend::Ushort => 0xE6FF_0070,
        };
        word(code, opcode | r(reg) << 12 | r(reg));
    }

    fn widen(&self, _code: &mut Vec<u8>, _reg: Reg, _signed: bool) {}

    fn truncate(&self, _code: &mut Vec<u8>, _reg: Reg) {}

    fn divide(
        &self,
        _code: &mut Vec<u8>,
        _signed: bool,
        _remainder: bool,
        _native: bool,
        _dst: Reg,
        _src: Reg,
    ) {
    }

    fn cmp(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, b: Reg, _native: bool) {
        word(code, 0xE150_0000 | r(a) << 16 | r(b));
    }

    fn cmp_imm(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, imm: i64, native: bool) {
        if (0..=255).contains(&imm) {
            word(code, 0xE350_0000 | r(a) << 16 | imm as u32);
        } else {
            self.mov32(code, SCRATCH, imm as u32);
            self.cmp(code, cond, a, SCRATCH, native);
        }
    }

    fn cmp_mem(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, base: Reg, disp: i32) {
        self.load(code, Mem::Word32, SCRATCH, base, disp);
        self.cmp(code, cond, a, SCRATCH, false);
    }

    fn jcc(&self, code: &mut Vec<u8>, cond: Cond) -> Patch {
        let at = code.len();
        word(code, cond_bits(cond) << 28 | 0x0A00_0000);
        Patch { at, field: at }
    }

    fn jmp(&self, code: &mut Vec<u8>) -> Patch {
        let at = code.len();
        word(code, 0xEA00_0000);
        Patch { at, field: at }
    }

    fn patch(&self, code: &mut [u8], patch: Patch, target: usize) {
        let offset = ((target as i64 - (patch.at as i64 + 8)) >> 2) as u32 & 0x00FF_FFFF;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&code[patch.field..patch.field + 4]);
        let insn = u32::from_le_bytes(bytes) & 0xFF00_0000 | offset;
        code[patch.field..patch.field + 4].copy_from_slice(&insn.to_le_bytes());
    }

    fn fp_load(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        self.vfp_transfer(code, 0xED10_0B00, dst, base, disp);
    }

    fn fp_store(&self, code: &mut Vec<u8>, src: Reg, base: Reg, disp: i32) {
        self.vfp_transfer(code, 0xED00_0B00, src, base, disp);
    }

    fn fp_const(&self, code: &mut Vec<u8>, dst: Reg, value: f64) {
        word(code, 0xED9F_0B00 | r(dst) << 12); // vldr dN, [pc, #0]
        word(code, 0xEA00_0001); // b over the literal
        code.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    fn fp_op(&self, code: &mut Vec<u8>, op: FpOp, dst: Reg, src: Reg) {
        let opcode = match op {
            FpOp::Add => 0xEE30_0B00,
            FpOp::Sub => 0xEE30_0B40,
            FpOp::Mul => 0xEE20_0B00,
            FpOp::Div => 0xEE80_0B00,
            FpOp::Rem => return,
        };
        word(code, opcode | r(dst) << 16 | r(dst) << 12 | r(src));
    }

    fn fp_neg(&self, code: &mut Vec<u8>, reg: Reg) {
        word(code, 0xEEB1_0B40 | r(reg) << 12 | r(reg));
    }
}
