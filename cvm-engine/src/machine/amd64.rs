use super::{
    Alu, Cond, Division, Extend, FpModel, FpOp, Machine, Mem, Patch, Reg, STATE_FRAME_OFFSET,
    STATE_PC_OFFSET, STATE_REEXECUTE_OFFSET, STATE_STACK_OFFSET, Shift, Unary, fits_i8, fits_i32,
    patch_rel32,
};

pub const RAX: Reg = Reg(0);
pub const RCX: Reg = Reg(1);
pub const RDX: Reg = Reg(2);
pub const RBX: Reg = Reg(3);
pub const RSI: Reg = Reg(6);
pub const RDI: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
const R11: Reg = Reg(11);
const R12: Reg = Reg(12);
const R14: Reg = Reg(14);
const R15: Reg = Reg(15);

const STATE: Reg = R12;
const STACK: Reg = R14;
const FRAME: Reg = R15;
const SCRATCH: Reg = R11;
const FP_SCRATCH: Reg = Reg(5);

static WORD_REGS: [Reg; 8] = [RAX, RCX, RDX, RBX, RSI, RDI, R8, R9];
static FP_REGS: [Reg; 5] = [Reg(0), Reg(1), Reg(2), Reg(3), Reg(4)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Amd64 {
    pub win64: bool,
}

impl Amd64 {
    pub const fn sysv() -> Self {
        Self { win64: false }
    }

    pub const fn win64() -> Self {
        Self { win64: true }
    }

    pub const fn host() -> Self {
        Self {
            win64: cfg!(windows),
        }
    }
}

#[derive(Clone, Copy)]
enum Rm {
    Reg(Reg),
    Mem { base: Reg, disp: i32 },
    Index { base: Reg, index: Reg, scale: u8, disp: i32 },
}

pub(super) fn cc(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
        Cond::Ge => 0xD,
        Cond::LtUn => 0x2,
        Cond::LeUn => 0x6,
        Cond::GtUn => 0x7,
        Cond::GeUn => 0x3,
    }
}

fn low(reg: Reg) -> u8 {
    reg.0 & 7
}

fn high(reg: Reg) -> u8 {
    (reg.0 >> 3) & 1
}

fn needs_byte_rex(reg: Reg) -> bool {
    (4..8).contains(&reg.0)
}

pub(super) fn mem_operand(code: &mut Vec<u8>, reg: u8, base: Reg, disp: i32) {
    let rm = low(base);
    let (mode, disp_len) = if disp == 0 && rm != 5 {
        (0x00, 0)
    } else if fits_i8(disp as i64) {
        (0x40, 1)
    } else {
        (0x80, 4)
    };
    code.push(mode | (reg & 7) << 3 | rm);
    if rm == 4 {
        code.push(0x24);
    }
    match disp_len {
        1 => code.push(disp as i8 as u8),
        4 => code.extend_from_slice(&disp.to_le_bytes()),
        _ => {}
    }
}

pub(super) fn index_operand(code: &mut Vec<u8>, reg: u8, base: Reg, index: Reg, scale: u8, disp: i32) {
    let (mode, disp_len) = if disp == 0 && low(base) != 5 {
        (0x00, 0)
    } else if fits_i8(disp as i64) {
        (0x40, 1)
    } else {
        (0x80, 4)
    };
    code.push(mode | (reg & 7) << 3 | 4);
    code.push(scale << 6 | low(index) << 3 | low(base));
    match disp_len {
        1 => code.push(disp as i8 as u8),
        4 => code.extend_from_slice(&disp.to_le_bytes()),
        _ => {}
    }
}

fn encode(
    code: &mut Vec<u8>,
    prefix: Option<u8>,
    wide: bool,
    byte: bool,
    opcode: &[u8],
    reg: u8,
    rm: Rm,
) {
    if let Some(prefix) = prefix {
        code.push(prefix);
    }
    let (index_bit, base_bit, rm_byte) = match rm {
        Rm::Reg(r) => (0, high(r), needs_byte_rex(r)),
        Rm::Mem { base, .. } => (0, high(base), false),
        Rm::Index { base, index, .. } => (high(index), high(base), false),
    };
    let rex = 0x40 | u8::from(wide) << 3 | ((reg >> 3) & 1) << 2 | index_bit << 1 | base_bit;
    let reg_byte = byte && (4..8).contains(&reg);
    if rex != 0x40 || (byte && (rm_byte || reg_byte)) {
        code.push(rex);
    }
    code.extend_from_slice(opcode);
    match rm {
        Rm::Reg(r) => code.push(0xC0 | (reg & 7) << 3 | low(r)),
        Rm::Mem { base, disp } => mem_operand(code, reg, base, disp),
        Rm::Index {
            base,
            index,
            scale,
            disp,
        } => index_operand(code, reg, base, index, scale, disp),
    }
}

fn group1_ext(op: Alu) -> Option<u8> {
    match op {
        Alu::Add => Some(0),
        Alu::Or => Some(1),
        Alu::And => Some(4),
        Alu::Sub => Some(5),
        Alu::Xor => Some(6),
        Alu::Mul => None,
    }
}

impl Amd64 {
    fn mov_imm64(&self, code: &mut Vec<u8>, dst: Reg, value: i64) {
        code.push(0x48 | high(dst));
        code.push(0xB8 + low(dst));
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn mov_native(&self, code: &mut Vec<u8>, dst: Reg, src: Reg) {
        encode(code, None, true, false, &[0x89], src.0, Rm::Reg(dst));
    }

    fn xchg_native(&self, code: &mut Vec<u8>, a: Reg, b: Reg) {
        encode(code, None, true, false, &[0x87], a.0, Rm::Reg(b));
    }

    fn shift_cl(&self, code: &mut Vec<u8>, op: Shift, reg: Reg, native: bool) {
        let ext = match op {
            Shift::Shl => 4,
            Shift::Shr => 5,
            Shift::Sar => 7,
        };
        encode(code, None, native, false, &[0xD3], ext, Rm::Reg(reg));
    }

    fn load_rm(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, rm: Rm) {
        match kind {
            Mem::Sbyte => encode(code, None, false, false, &[0x0F, 0xBE], dst.0, rm),
            Mem::Byte => encode(code, None, false, false, &[0x0F, 0xB6], dst.0, rm),
            Mem::Short => encode(code, None, false, false, &[0x0F, 0xBF], dst.0, rm),
            Mem::Ushort => encode(code, None, false, false, &[0x0F, 0xB7], dst.0, rm),
            Mem::Word32 => encode(code, None, false, false, &[0x8B], dst.0, rm),
            Mem::Native => encode(code, None, true, false, &[0x8B], dst.0, rm),
        }
    }

    fn store_rm(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, rm: Rm) {
        match kind {
            Mem::Sbyte | Mem::Byte => encode(code, None, false, true, &[0x88], src.0, rm),
            Mem::Short | Mem::Ushort => encode(code, Some(0x66), false, false, &[0x89], src.0, rm),
            Mem::Word32 => encode(code, None, false, false, &[0x89], src.0, rm),
            Mem::Native => encode(code, None, true, false, &[0x89], src.0, rm),
        }
    }
}

impl Machine for Amd64 {
    const NAME: &'static str = "amd64";
    const NATIVE_SIZE: u32 = 8;
    const FP: FpModel = FpModel::Flat;
    const DIVISION: Division = Division::Fixed {
        dividend: RAX,
        divisor: RCX,
        remainder: RDX,
    };

    fn word_regs(&self) -> &'static [Reg] {
        &WORD_REGS
    }

    fn fp_regs(&self) -> &'static [Reg] {
        &FP_REGS
    }

    fn is_callee_saved(&self, reg: Reg) -> bool {
        reg == RBX || (self.win64 && (reg == RSI || reg == RDI))
    }

    fn stack_reg(&self) -> Reg {
        STACK
    }

    fn frame_reg(&self) -> Reg {
        FRAME
    }

    fn prologue(&self, code: &mut Vec<u8>) {
        self.push(code, STATE);
        self.push(code, STACK);
        self.push(code, FRAME);
        let arg = if self.win64 { RCX } else { RDI };
        self.mov_native(code, STATE, arg);
        self.load(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.load(code, Mem::Native, FRAME, STATE, STATE_FRAME_OFFSET);
    }

    fn push(&self, code: &mut Vec<u8>, reg: Reg) {
        if high(reg) != 0 {
            code.push(0x41);
        }
        code.push(0x50 + low(reg));
    }

    fn pop(&self, code: &mut Vec<u8>, reg: Reg) {
        if high(reg) != 0 {
            code.push(0x41);
        }
        code.push(0x58 + low(reg));
    }

    fn exit(&self, code: &mut Vec<u8>, pc: u64, adjust: i32, reexecute: bool, saved: &[Reg]) {
        if adjust != 0 {
            self.lea(code, STACK, STACK, adjust);
        }
        self.store(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.mov_imm64(code, SCRATCH, pc as i64);
        self.store(code, Mem::Native, SCRATCH, STATE, STATE_PC_OFFSET);
        // mov qword [r12 + 24], imm32
        encode(
            code,
            None,
            true,
            false,
            &[0xC7],
            0,
            Rm::Mem {
                base: STATE,
                disp: STATE_REEXECUTE_OFFSET,
            },
        );
        code.extend_from_slice(&u32::from(reexecute).to_le_bytes());
        for reg in saved.iter().rev() {
            self.pop(code, *reg);
        }
        self.pop(code, FRAME);
        self.pop(code, STACK);
        self.pop(code, STATE);
        code.push(0xC3); // ret
    }

    fn mov(&self, code: &mut Vec<u8>, dst: Reg, src: Reg) {
        self.mov_native(code, dst, src);
    }

    fn load_imm(&self, code: &mut Vec<u8>, dst: Reg, value: i32) {
        if high(dst) != 0 {
            code.push(0x41);
        }
        code.push(0xB8 + low(dst));
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn load_imm_native(&self, code: &mut Vec<u8>, dst: Reg, value: i64) {
        if fits_i32(value) {
            encode(code, None, true, false, &[0xC7], 0, Rm::Reg(dst));
            code.extend_from_slice(&(value as i32).to_le_bytes());
        } else {
            self.mov_imm64(code, dst, value);
        }
    }

    fn load(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, disp: i32) {
        self.load_rm(code, kind, dst, Rm::Mem { base, disp });
    }

    fn store(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, base: Reg, disp: i32) {
        self.store_rm(code, kind, src, Rm::Mem { base, disp });
    }

    fn load_index(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, index: Reg, disp: i32) {
        let scale = kind.shift(Self::NATIVE_SIZE);
        self.load_rm(
            code,
            kind,
            dst,
            Rm::Index {
                base,
                index,
                scale,
                disp,
            },
        );
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
        let scale = kind.shift(Self::NATIVE_SIZE);
        self.store_rm(
            code,
            kind,
            src,
            Rm::Index {
                base,
                index,
                scale,
                disp,
            },
        );
    }

    fn store_slot(&self, code: &mut Vec<u8>, src: Reg, _native: bool, base: Reg, disp: i32) {
        // 32-bit values are already zero-extended.
        self.store(code, Mem::Native, src, base, disp);
    }

    fn lea(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        encode(code, None, true, false, &[0x8D], dst.0, Rm::Mem { base, disp });
    }

    fn lea_index(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, index: Reg, shift: u8, disp: i32) {
        encode(
            code,
            None,
            true,
            false,
            &[0x8D],
            dst.0,
            Rm::Index {
                base,
                index,
                scale: shift,
                disp,
            },
        );
    }

    fn alu(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, src: Reg, native: bool) {
        match op {
            Alu::Mul => encode(code, None, native, false, &[0x0F, 0xAF], dst.0, Rm::Reg(src)),
            Alu::Add => encode(code, None, native, false, &[0x01], src.0, Rm::Reg(dst)),
            Alu::Or => encode(code, None, native, false, &[0x09], src.0, Rm::Reg(dst)),
            Alu::And => encode(code, None, native, false, &[0x21], src.0, Rm::Reg(dst)),
            Alu::Sub => encode(code, None, native, false, &[0x29], src.0, Rm::Reg(dst)),
            Alu::Xor => encode(code, None, native, false, &[0x31], src.0, Rm::Reg(dst)),
        }
    }

    fn alu_imm(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, imm: i32, native: bool) {
        let short = fits_i8(imm as i64);
        match group1_ext(op) {
            Some(ext) => {
                let opcode = if short { 0x83 } else { 0x81 };
                encode(code, None, native, false, &[opcode], ext, Rm::Reg(dst));
            }
            None => {
                let opcode = if short { 0x6B } else { 0x69 };
                encode(code, None, native, false, &[opcode], dst.0, Rm::Reg(dst));
            }
        }
        if short {
            code.push(imm as i8 as u8);
        } else {
            code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    fn alu_mem(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, base: Reg, disp: i32) {
        let opcode: &[u8] = match op {
            Alu::Add => &[0x03],
            Alu::Sub => &[0x2B],
            Alu::Mul => &[0x0F, 0xAF],
            Alu::And => &[0x23],
            Alu::Or => &[0x0B],
            Alu::Xor => &[0x33],
        };
        encode(code, None, false, false, opcode, dst.0, Rm::Mem { base, disp });
    }

    fn unary(&self, code: &mut Vec<u8>, op: Unary, reg: Reg, native: bool) {
        let ext = match op {
            Unary::Neg => 3,
            Unary::Not => 2,
        };
        encode(code, None, native, false, &[0xF7], ext, Rm::Reg(reg));
    }

    fn shift(&self, code: &mut Vec<u8>, op: Shift, dst: Reg, count: Reg, native: bool) {
        if count == RCX {
            self.shift_cl(code, op, dst, native);
        } else if dst == RCX {
            self.xchg_native(code, RCX, count);
            self.shift_cl(code, op, count, native);
            self.mov_native(code, RCX, count);
        } else {
            self.mov_native(code, SCRATCH, RCX);
            self.mov_native(code, RCX, count);
            self.shift_cl(code, op, dst, native);
            self.mov_native(code, RCX, SCRATCH);
        }
    }

    fn extend(&self, code: &mut Vec<u8>, kind: Extend, reg: Reg) {
        let (opcode, byte): ([u8; 2], bool) = match kind {
            Extend::Sbyte => ([0x0F, 0xBE], true),
            Extend::Byte => ([0x0F, 0xB6], true),
            Extend::Short => ([0x0F, 0xBF], false),
            Extend::Ushort => ([0x0F, 0xB7], false),
        };
        encode(code, None, false, byte, &opcode, reg.0, Rm::Reg(reg));
    }

    fn widen(&self, code: &mut Vec<u8>, reg: Reg, signed: bool) {
        if signed {
            // movsxd
            encode(code, None, true, false, &[0x63], reg.0, Rm::Reg(reg));
        } else {
            self.truncate(code, reg);
        }
    }

    fn truncate(&self, code: &mut Vec<u8>, reg: Reg) {
        encode(code, None, false, false, &[0x89], reg.0, Rm::Reg(reg));
    }

    fn divide(
        &self,
        code: &mut Vec<u8>,
        signed: bool,
        _remainder: bool,
        native: bool,
        _dst: Reg,
        _src: Reg,
    ) {
        if signed {
            if native {
                code.extend_from_slice(&[0x48, 0x99]); // cqo
            } else {
                code.push(0x99); // cdq
            }
            encode(code, None, native, false, &[0xF7], 7, Rm::Reg(RCX));
        } else {
            code.extend_from_slice(&[0x31, 0xD2]); // xor edx, edx
            encode(code, None, native, false, &[0xF7], 6, Rm::Reg(RCX));
        }
    }

    fn cmp(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, b: Reg, native: bool) {
        encode(code, None, native, false, &[0x39], b.0, Rm::Reg(a));
    }

    fn cmp_imm(&self, code: &mut Vec<u8>, cond: Cond, a: Reg, imm: i64, native: bool) {
        if native && !fits_i32(imm) {
            self.mov_imm64(code, SCRATCH, imm);
            self.cmp(code, cond, a, SCRATCH, true);
            return;
        }
        let imm = imm as i32;
        if fits_i8(imm as i64) {
            encode(code, None, native, false, &[0x83], 7, Rm::Reg(a));
            code.push(imm as i8 as u8);
        } else {
            encode(code, None, native, false, &[0x81], 7, Rm::Reg(a));
            code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    fn cmp_mem(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, base: Reg, disp: i32) {
        encode(code, None, false, false, &[0x3B], a.0, Rm::Mem { base, disp });
    }

    fn jcc(&self, code: &mut Vec<u8>, cond: Cond) -> Patch {
        let at = code.len();
        code.extend_from_slice(&[0x0F, 0x80 | cc(cond), 0, 0, 0, 0]);
        Patch { at, field: at + 2 }
    }

    fn jmp(&self, code: &mut Vec<u8>) -> Patch {
        let at = code.len();
        code.extend_from_slice(&[0xE9, 0, 0, 0, 0]);
        Patch { at, field: at + 1 }
    }

    fn patch(&self, code: &mut [u8], patch: Patch, target: usize) {
        patch_rel32(code, patch, target);
    }

    fn fp_load(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        encode(code, Some(0xF2), false, false, &[0x0F, 0x10], dst.0, Rm::Mem { base, disp });
    }

    fn fp_store(&self, code: &mut Vec<u8>, src: Reg, base: Reg, disp: i32) {
        encode(code, Some(0xF2), false, false, &[0x0F, 0x11], src.0, Rm::Mem { base, disp });
    }

    fn fp_const(&self, code: &mut Vec<u8>, dst: Reg, value: f64) {
        self.mov_imm64(code, SCRATCH, value.to_bits() as i64);
        // movq xmm, r11
        encode(code, Some(0x66), true, false, &[0x0F, 0x6E], dst.0, Rm::Reg(SCRATCH));
    }

    fn fp_op(&self, code: &mut Vec<u8>, op: FpOp, dst: Reg, src: Reg) {
        let opcode = match op {
            FpOp::Add => 0x58,
            FpOp::Mul => 0x59,
            FpOp::Sub => 0x5C,
            FpOp::Div => 0x5E,
            FpOp::Rem => return,
        };
        encode(code, Some(0xF2), false, false, &[0x0F, opcode], dst.0, Rm::Reg(src));
    }

    fn fp_neg(&self, code: &mut Vec<u8>, reg: Reg) {
        self.fp_const(code, FP_SCRATCH, -0.0);
        // xorpd
        encode(code, Some(0x66), false, false, &[0x0F, 0x57], reg.0, Rm::Reg(FP_SCRATCH));
    }

    fn fp_cmp(&self, code: &mut Vec<u8>, dst: Reg, a: Reg, b: Reg, unordered: i32) {
        // ucomisd a, b
        encode(code, Some(0x66), false, false, &[0x0F, 0x2E], a.0, Rm::Reg(b));
        self.load_imm(code, dst, unordered);
        let at = code.len();
        code.extend_from_slice(&[0x0F, 0x8A, 0, 0, 0, 0]); // jp
        let nan = Patch { at, field: at + 2 };
        self.load_imm(code, dst, 0);
        let equal = self.jcc(code, Cond::Eq);
        self.load_imm(code, dst, -1);
        let below = self.jcc(code, Cond::LtUn);
        self.load_imm(code, dst, 1);
        let done = code.len();
        for patch in [nan, equal, below] {
            patch_rel32(code, patch, done);
        }
    }

    fn fp_cmp_supported(&self) -> bool {
        true
    }
}
