use super::amd64::{cc, index_operand, mem_operand};
use super::{
    Alu, Cond, Division, Extend, FpModel, FpOp, Machine, Mem, Patch, Reg, STATE_FRAME_OFFSET,
    STATE_PC_OFFSET, STATE_REEXECUTE_OFFSET, STATE_STACK_OFFSET, Shift, Unary, fits_i8,
    patch_rel32,
};

pub const EAX: Reg = Reg(0);
pub const ECX: Reg = Reg(1);
pub const EDX: Reg = Reg(2);
pub const EBX: Reg = Reg(3);
pub const EBP: Reg = Reg(5);
pub const ESI: Reg = Reg(6);
pub const EDI: Reg = Reg(7);

const STATE: Reg = ESI;
const STACK: Reg = EDI;
const FRAME: Reg = EBX;

static WORD_REGS: [Reg; 4] = [EAX, ECX, EDX, EBP];
static FP_REGS: [Reg; 1] = [Reg(0)];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct X86;

fn modrm_reg(code: &mut Vec<u8>, reg: u8, rm: Reg) {
    code.push(0xC0 | (reg & 7) << 3 | rm.0 & 7);
}

fn is_byte_capable(reg: Reg) -> bool {
    reg.0 < 4
}

impl X86 {
    fn op_mem(&self, code: &mut Vec<u8>, opcode: &[u8], reg: u8, base: Reg, disp: i32) {
        code.extend_from_slice(opcode);
        mem_operand(code, reg, base, disp);
    }

    fn op_index(
        &self,
        code: &mut Vec<u8>,
        opcode: &[u8],
        reg: u8,
        base: Reg,
        index: Reg,
        scale: u8,
        disp: i32,
    ) {
        code.extend_from_slice(opcode);
        index_operand(code, reg, base, index, scale, disp);
    }

    fn store_imm32(&self, code: &mut Vec<u8>, base: Reg, disp: i32, value: u32) {
        self.op_mem(code, &[0xC7], 0, base, disp);
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn xchg(&self, code: &mut Vec<u8>, a: Reg, b: Reg) {
        code.push(0x87);
        modrm_reg(code, a.0, b);
    }

    fn shift_imm(&self, code: &mut Vec<u8>, ext: u8, reg: Reg, count: u8) {
        code.push(0xC1);
        modrm_reg(code, ext, reg);
        code.push(count);
    }

    fn byte_temp(busy: &[Reg]) -> Reg {
        [EAX, ECX, EDX]
            .into_iter()
            .find(|reg| !busy.contains(reg))
            .unwrap_or(EAX)
    }

    fn load_opcode(kind: Mem) -> &'static [u8] {
        match kind {
            Mem::Sbyte => &[0x0F, 0xBE],
            Mem::Byte => &[0x0F, 0xB6],
            Mem::Short => &[0x0F, 0xBF],
            Mem::Ushort => &[0x0F, 0xB7],
            Mem::Word32 | Mem::Native => &[0x8B],
        }
    }

    fn store_with(
        &self,
        code: &mut Vec<u8>,
        kind: Mem,
        src: Reg,
        busy: &[Reg],
        emit: impl Fn(&mut Vec<u8>, &[u8], u8),
    ) {
        match kind {
            Mem::Sbyte | Mem::Byte if !is_byte_capable(src) => {
                let temp = Self::byte_temp(busy);
                self.xchg(code, temp, src);
                emit(code, &[0x88], temp.0);
                self.xchg(code, temp, src);
            }
            Mem::Sbyte | Mem::Byte => emit(code, &[0x88], src.0),
            Mem::Short | Mem::Ushort => emit(code, &[0x66, 0x89], src.0),
            Mem::Word32 | Mem::Native => emit(code, &[0x89], src.0),
        }
    }
}

impl Machine for X86 {
    const NAME: &'static str = "x86";
    const NATIVE_SIZE: u32 = 4;
    const FP: FpModel = FpModel::Stack { depth: 8 };
    const DIVISION: Division = Division::Fixed {
        dividend: EAX,
        divisor: ECX,
        remainder: EDX,
    };

    fn word_regs(&self) -> &'static [Reg] {
        &WORD_REGS
    }

    fn fp_regs(&self) -> &'static [Reg] {
        &FP_REGS
    }

    fn is_callee_saved(&self, reg: Reg) -> bool {
        reg == EBP
    }

    fn stack_reg(&self) -> Reg {
        STACK
    }

    fn frame_reg(&self) -> Reg {
        FRAME
    }

    fn prologue(&self, code: &mut Vec<u8>) {
        self.push(code, FRAME);
        self.push(code, STATE);
        self.push(code, STACK);
        code.extend_from_slice(&[0x8B, 0x74, 0x24, 0x10]); // mov esi, [esp + 16]
        self.load(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.load(code, Mem::Native, FRAME, STATE, STATE_FRAME_OFFSET);
    }

    fn push(&self, code: &mut Vec<u8>, reg: Reg) {
        code.push(0x50 + reg.0);
    }

    fn pop(&self, code: &mut Vec<u8>, reg: Reg) {
        code.push(0x58 + reg.0);
    }

    fn exit(&self, code: &mut Vec<u8>, pc: u64, adjust: i32, reexecute: bool, saved: &[Reg]) {
        if adjust != 0 {
            self.lea(code, STACK, STACK, adjust);
        }
        self.store(code, Mem::Native, STACK, STATE, STATE_STACK_OFFSET);
        self.store_imm32(code, STATE, STATE_PC_OFFSET, pc as u32);
        self.store_imm32(code, STATE, STATE_PC_OFFSET + 4, (pc >> 32) as u32);
        self.store_imm32(code, STATE, STATE_REEXECUTE_OFFSET, u32::from(reexecute));
        self.store_imm32(code, STATE, STATE_REEXECUTE_OFFSET + 4, 0);
        for reg in saved.iter().rev() {
            self.pop(code, *reg);
        }
        self.pop(code, STACK);
        self.pop(code, STATE);
        self.pop(code, FRAME);
        code.push(0xC3); // ret
    }

    fn mov(&self, code: &mut Vec<u8>, dst: Reg, src: Reg) {
        code.push(0x89);
        modrm_reg(code, src.0, dst);
    }

    fn load_imm(&self, code: &mut Vec<u8>, dst: Reg, value: i32) {
        code.push(0xB8 + dst.0);
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn load_imm_native(&self, code: &mut Vec<u8>, dst: Reg, value: i64) {
        self.load_imm(code, dst, value as i32);
    }

    fn load(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, disp: i32) {
        self.op_mem(code, Self::load_opcode(kind), dst.0, base, disp);
    }

    fn store(&self, code: &mut Vec<u8>, kind: Mem, src: Reg, base: Reg, disp: i32) {
        self.store_with(code, kind, src, &[base], |code, opcode, reg| {
            code.extend_from_slice(opcode);
            mem_operand(code, reg, base, disp);
        });
    }

    fn load_index(&self, code: &mut Vec<u8>, kind: Mem, dst: Reg, base: Reg, index: Reg, disp: i32) {
        let scale = kind.shift(Self::NATIVE_SIZE);
        self.op_index(code, Self::load_opcode(kind), dst.0, base, index, scale, disp);
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
        self.store_with(code, kind, src, &[base, index], |code, opcode, reg| {
            code.extend_from_slice(opcode);
            index_operand(code, reg, base, index, scale, disp);
        });
    }

    fn store_slot(&self, code: &mut Vec<u8>, src: Reg, _native: bool, base: Reg, disp: i32) {
        self.store(code, Mem::Word32, src, base, disp);
        self.store_imm32(code, base, disp + 4, 0);
    }

    fn lea(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, disp: i32) {
        self.op_mem(code, &[0x8D], dst.0, base, disp);
    }

    fn lea_index(&self, code: &mut Vec<u8>, dst: Reg, base: Reg, index: Reg, shift: u8, disp: i32) {
        self.op_index(code, &[0x8D], dst.0, base, index, shift, disp);
    }

    fn alu(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, src: Reg, _native: bool) {
        match op {
            Alu::Mul => {
                code.extend_from_slice(&[0x0F, 0xAF]);
                modrm_reg(code, dst.0, src);
            }
            Alu::Add | Alu::Or | Alu::And | Alu::Sub | Alu::Xor => {
                let opcode = match op {
                    Alu::Add => 0x01,
                    Alu::Or => 0x09,
                    Alu::And => 0x21,
                    Alu::Sub => 0x29,
                    _ => 0x31,
                };
                code.push(opcode);
                modrm_reg(code, src.0, dst);
            }
        }
    }

    fn alu_imm(&self, code: &mut Vec<u8>, op: Alu, dst: Reg, imm: i32, _native: bool) {
        let short = fits_i8(imm as i64);
        let (opcode, reg) = match op {
            Alu::Add => (0x81, 0),
            Alu::Or => (0x81, 1),
            Alu::And => (0x81, 4),
            Alu::Sub => (0x81, 5),
            Alu::Xor => (0x81, 6),
            Alu::Mul => (0x69, dst.0),
        };
        code.push(if short { opcode + 2 } else { opcode });
        modrm_reg(code, reg, dst);
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
        self.op_mem(code, opcode, dst.0, base, disp);
    }

    fn unary(&self, code: &mut Vec<u8>, op: Unary, reg: Reg, _native: bool) {
        code.push(0xF7);
        modrm_reg(code, if op == Unary::Neg { 3 } else { 2 }, reg);
    }

    fn shift(&self, code: &mut Vec<u8>, op: Shift, dst: Reg, count: Reg, _native: bool) {
        let ext = match op {
            Shift::Shl => 4,
            Shift::Shr => 5,
            Shift::Sar => 7,
        };
        if count == ECX {
            code.push(0xD3);
            modrm_reg(code, ext, dst);
        } else if dst == ECX {
            self.xchg(code, ECX, count);
            code.push(0xD3);
            modrm_reg(code, ext, count);
            self.mov(code, ECX, count);
        } else {
            code.push(0x51); // push ecx
            self.mov(code, ECX, count);
            code.push(0xD3);
            modrm_reg(code, ext, dst);
            code.push(0x59); // pop ecx
        }
    }

    fn extend(&self, code: &mut Vec<u8>, kind: Extend, reg: Reg) {
        match kind {
            Extend::Sbyte => {
                self.shift_imm(code, 4, reg, 24);
                self.shift_imm(code, 7, reg, 24);
            }
            Extend::Short => {
                self.shift_imm(code, 4, reg, 16);
                self.shift_imm(code, 7, reg, 16);
            }
            Extend::Byte => self.alu_imm(code, Alu::And, reg, 0xFF, false),
            Extend::Ushort => self.alu_imm(code, Alu::And, reg, 0xFFFF, false),
        }
    }

    fn widen(&self, _code: &mut Vec<u8>, _reg: Reg, _signed: bool) {}

    fn truncate(&self, _code: &mut Vec<u8>, _reg: Reg) {}

    fn divide(
        &self,
        code: &mut Vec<u8>,
        signed: bool,
        _remainder: bool,
        _native: bool,
        _dst: Reg,
        _src: Reg,
    ) {
        if signed {
            code.extend_from_slice(&[0x99, 0xF7, 0xF9]); // cdq; idiv ecx
        } else {
            code.extend_from_slice(&[0x31, 0xD2, 0xF7, 0xF1]); // xor edx, edx; div ecx
        }
    }

    fn cmp(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, b: Reg, _native: bool) {
        code.push(0x39);
        modrm_reg(code, b.0, a);
    }

    fn cmp_imm(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, imm: i64, _native: bool) {
        let imm = imm as i32;
        if fits_i8(imm as i64) {
            code.push(0x83);
            modrm_reg(code, 7, a);
            code.push(imm as i8 as u8);
        } else {
            code.push(0x81);
            modrm_reg(code, 7, a);
            code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    fn cmp_mem(&self, code: &mut Vec<u8>, _cond: Cond, a: Reg, base: Reg, disp: i32) {
        self.op_mem(code, &[0x3B], a.0, base, disp);
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

    fn fp_load(&self, code: &mut Vec<u8>, _dst: Reg, base: Reg, disp: i32) {
        self.op_mem(code, &[0xDD], 0, base, disp); // fld qword
    }

    fn fp_store(&self, code: &mut Vec<u8>, _src: Reg, base: Reg, disp: i32) {
        self.op_mem(code, &[0xDD], 3, base, disp); // fstp qword
    }

    fn fp_const(&self, code: &mut Vec<u8>, _dst: Reg, value: f64) {
        if value.to_bits() == 0 {
            code.extend_from_slice(&[0xD9, 0xEE]); // fldz
        } else if value == 1.0 {
            code.extend_from_slice(&[0xD9, 0xE8]); // fld1
        } else {
            let bits = value.to_bits();
            code.push(0x68);
            code.extend_from_slice(&((bits >> 32) as u32).to_le_bytes());
            code.push(0x68);
            code.extend_from_slice(&(bits as u32).to_le_bytes());
            code.extend_from_slice(&[0xDD, 0x04, 0x24]); // fld qword [esp]
            code.extend_from_slice(&[0x8D, 0x64, 0x24, 0x08]); // lea esp, [esp + 8]
        }
    }

    fn fp_op(&self, code: &mut Vec<u8>, op: FpOp, _dst: Reg, _src: Reg) {
        match op {
            FpOp::Add => code.extend_from_slice(&[0xDE, 0xC1]),
            FpOp::Sub => code.extend_from_slice(&[0xDE, 0xE9]),
            FpOp::Mul => code.extend_from_slice(&[0xDE, 0xC9]),
            FpOp::Div => code.extend_from_slice(&[0xDE, 0xF9]),
            FpOp::Rem => {
                // EAX is clobbered by fnstsw.
                self.fp_swap(code);
                code.extend_from_slice(&[
                    0xD9, 0xF8, // fprem
                    0xDF, 0xE0, // fnstsw ax
                    0xF6, 0xC4, 0x04, // test ah, 4
                    0x75, 0xF7, // jnz fprem
                    0xDD, 0xD9, // fstp st1
                ]);
            }
        }
    }

    fn fp_neg(&self, code: &mut Vec<u8>, _reg: Reg) {
        code.extend_from_slice(&[0xD9, 0xE0]); // fchs
    }

    fn fp_swap(&self, code: &mut Vec<u8>) {
        code.extend_from_slice(&[0xD9, 0xC9]); // fxch st1
    }

    fn fp_rem_supported(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_reads_state_from_the_stack() {
        let mut code = Vec::new();
        X86.prologue(&mut code);
        assert_eq!(
            code,
            [
                0x53, 0x56, 0x57, // push ebx, esi, edi
                0x8B, 0x74, 0x24, 0x10, // mov esi, [esp + 16]
                0x8B, 0x7E, 0x08, // mov edi, [esi + 8]
                0x8B, 0x5E, 0x10, // mov ebx, [esi + 16]
            ]
        );
    }

    #[test]
    fn exit_writes_both_halves() {
        let mut code = Vec::new();
        X86.exit(&mut code, 7, -8, true, &[EBP]);
        let expected = [
            0x8D, 0x7F, 0xF8, // lea edi, [edi - 8]
            0x89, 0x7E, 0x08, // mov [esi + 8], edi
            0xC7, 0x06, 7, 0, 0, 0, // mov dword [esi], 7
            0xC7, 0x46, 0x04, 0, 0, 0, 0, // mov dword [esi + 4], 0
            0xC7, 0x46, 0x18, 1, 0, 0, 0, // mov dword [esi + 24], 1
            0xC7, 0x46, 0x1C, 0, 0, 0, 0, // mov dword [esi + 28], 0
            0x5D, 0x5F, 0x5E, 0x5B, 0xC3,
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn byte_store_from_ebp_swaps_through_a_byte_register() {
        let mut code = Vec::new();
        X86.store(&mut code, Mem::Byte, EBP, EAX, 8);
        assert_eq!(
            code,
            [
                0x87, 0xCD, // xchg ebp, ecx
                0x88, 0x48, 0x08, // mov [eax + 8], cl
                0x87, 0xCD,
            ]
        );
    }

    #[test]
    fn sign_extension_uses_shifts() {
        let mut code = Vec::new();
        X86.extend(&mut code, Extend::Sbyte, EBP);
        assert_eq!(code, [0xC1, 0xE5, 0x18, 0xC1, 0xFD, 0x18]);
    }

    #[test]
    fn slot_store_clears_high_half() {
        let mut code = Vec::new();
        X86.store_slot(&mut code, EAX, false, EDI, 16);
        assert_eq!(
            code,
            [0x89, 0x47, 0x10, 0xC7, 0x47, 0x14, 0, 0, 0, 0]
        );
    }
}
