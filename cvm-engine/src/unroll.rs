mod arith;
mod branch;
mod conv;
mod ptr;
mod regs;
mod var;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::cache::MethodCache;
use crate::converter::MethodCode;
use crate::format::{CodeView, Decoded, Encoding, Insn, WORD_SIZE, Word, label_for_opcode};
use crate::machine::{
    Alu, Amd64, Arm, Cond, Division, Extend, FpModel, FpOp, Machine, Mem, Ppc, Shift, Unary, X86,
};
use crate::opcodes::Opcode;
use branch::Test;
use regs::{ThisState, Unroller};

pub const UNROLL_BUFMIN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnrollOutcome {
    Unrolled { blocks: usize },
    NotPossible,
    CacheExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub pc: usize,
    pub end: usize,
    pub offset: usize,
    pub len: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Generated {
    pub code: Vec<u8>,
    pub blocks: Vec<Block>,
}

static LABELS: OnceLock<HashMap<Word, Opcode>> = OnceLock::new();

fn label_table() -> &'static HashMap<Word, Opcode> {
    LABELS.get_or_init(|| {
        Opcode::ALL
            .iter()
            .map(|op| (label_for_opcode(*op as u16), *op))
            .collect()
    })
}

pub fn init() {
    label_table();
}

pub fn possible() -> bool {
    cfg!(all(
        target_arch = "x86_64",
        any(target_os = "linux", target_os = "windows", target_os = "macos")
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Next,
    EndBlock,
}

fn translates<M: Machine>(machine: &M, opcode: Opcode) -> bool {
    use Opcode::*;
    let long = machine.has_long();
    let fp = M::FP != FpModel::None;
    let divide = M::DIVISION != Division::None;
    match opcode {
        Iload0 | Iload1 | Iload2 | Iload3 | Iload | Pload0 | Pload1 | Pload2 | Pload3 | Pload
        | Istore0 | Istore1 | Istore2 | Istore3 | Istore | Pstore0 | Pstore1 | Pstore2
        | Pstore3 | Pstore | Waddr => true,
        LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
        | LdcI48 | LdcI4S | LdcI4 | Ldnull => true,
        Dup | Dup2 | Pop | Pop2 => true,
        Iadd | Isub | Imul | Iand | Ior | Ixor | Ineg | Inot | Ishl | Ishr | IshrUn => true,
        Idiv | IdivUn | Irem | IremUn => divide,
        LdcI8 | Ladd | Lsub | Lmul | Land | Lor | Lxor | Lneg | Lnot | Lshl | Lshr | LshrUn
        | I2l | Iu2l | L2i | Lcmp | LcmpUn | LreadElem | LwriteElem => long,
        Ldiv | LdivUn | Lrem | LremUn => long && divide,
        LdcR4 | LdcR8 | Fadd | Fsub | Fmul | Fdiv | Fneg => fp,
        Frem => fp && machine.fp_rem_supported(),
        Dread | Dwrite | DwriteR | DreadElem | DwriteElem => fp,
        Fcmpl | Fcmpg => fp && machine.fp_cmp_supported(),
        I2b | I2ub | I2s | I2us | PaddI4 | Cknull => true,
        PaddOffset | PaddI4R | Psub | PsubI4 | ElemAddrShiftI4 | ElemAddrMulI4 => true,
        BwriteR | SwriteR | IwriteR | PwriteR => true,
        Icmp | IcmpUn | Pcmp | Seteq | Setne | Setlt | Setle | Setgt | Setge => true,
        Br | Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn | Brtrue
        | Brfalse | Brnull | Brnonnull | BrPeq | BrPne => true,
        BreadElem | UbreadElem | SreadElem | UsreadElem | IreadElem | PreadElem | BwriteElem
        | SwriteElem | IwriteElem | PwriteElem | ArrayLen => true,
        Bread | Ubread | Sread | Usread | Iread | Pread | Bwrite | Swrite | Iwrite | Pwrite => {
            true
        }
        BreadField | UbreadField | SreadField | UsreadField | IreadField | PreadField
        | BwriteField | SwriteField | IwriteField | PwriteField | IreadThis | PreadThis => true,
        Get2d | Set2d => true,
        _ => false,
    }
}

impl<M: Machine> Unroller<'_, M> {
    fn translate(&mut self, insn: &Insn) -> Step {
        use Opcode::*;
        let cached = self.cached.take();
        let pc = insn.pc;
        let offset = insn.operand.int() as i32;
        let target = insn.operand.target();
        let next = insn.next_pc();
        match insn.opcode {
            Iload0 | Iload1 | Iload2 | Iload3 | Iload => self.load_local(insn, cached, false),
            Pload0 | Pload1 | Pload2 | Pload3 | Pload => self.load_local(insn, cached, true),
            Istore0 | Istore1 | Istore2 | Istore3 | Istore => self.store_local(insn, false),
            Pstore0 | Pstore1 | Pstore2 | Pstore3 | Pstore => self.store_local(insn, true),
            Waddr => self.local_address(insn),
            LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 | LdcI4S | LdcI4 | LdcI8 | Ldnull | LdcR4 | LdcR8 => self.constant(insn),

            Dup => self.dup(),
            Dup2 => self.dup2(),
            Pop => self.pop(1),
            Pop2 => self.pop(2),

            Iadd => self.binary(Alu::Add, false),
            Isub => self.binary(Alu::Sub, false),
            Imul => self.binary(Alu::Mul, false),
            Iand => self.binary(Alu::And, false),
            Ior => self.binary(Alu::Or, false),
            Ixor => self.binary(Alu::Xor, false),
            Ladd => self.binary(Alu::Add, true),
            Lsub => self.binary(Alu::Sub, true),
            Lmul => self.binary(Alu::Mul, true),
            Land => self.binary(Alu::And, true),
            Lor => self.binary(Alu::Or, true),
            Lxor => self.binary(Alu::Xor, true),
            Ineg => self.unary_op(Unary::Neg, false),
            Inot => self.unary_op(Unary::Not, false),
            Lneg => self.unary_op(Unary::Neg, true),
            Lnot => self.unary_op(Unary::Not, true),
            Ishl => self.shift_op(Shift::Shl, false),
            Ishr => self.shift_op(Shift::Sar, false),
            IshrUn => self.shift_op(Shift::Shr, false),
            Lshl => self.shift_op(Shift::Shl, true),
            Lshr => self.shift_op(Shift::Sar, true),
            LshrUn => self.shift_op(Shift::Shr, true),
            Idiv => self.divide_op(true, false, false, pc),
            IdivUn => self.divide_op(false, false, false, pc),
            Irem => self.divide_op(true, true, false, pc),
            IremUn => self.divide_op(false, true, false, pc),
            Ldiv => self.divide_op(true, false, true, pc),
            LdivUn => self.divide_op(false, false, true, pc),
            Lrem => self.divide_op(true, true, true, pc),
            LremUn => self.divide_op(false, true, true, pc),

            Fadd => self.float_op(FpOp::Add),
            Fsub => self.float_op(FpOp::Sub),
            Fmul => self.float_op(FpOp::Mul),
            Fdiv => self.float_op(FpOp::Div),
            Frem => self.float_op(FpOp::Rem),
            Fneg => self.float_neg(),

            I2b => self.narrow(Extend::Sbyte),
            I2ub => self.narrow(Extend::Byte),
            I2s => self.narrow(Extend::Short),
            I2us => self.narrow(Extend::Ushort),
            I2l => self.widen_top(true),
            Iu2l => self.widen_top(false),
            L2i => self.truncate_top(),

            PaddI4 => self.padd_i4(),
            PaddI4R => self.padd_i4_reversed(),
            PaddOffset => self.padd_offset(offset as u8),
            Psub => self.psub(),
            PsubI4 => self.psub_i4(),
            Cknull => self.cknull(pc),

            Icmp => self.compare(false, false),
            IcmpUn => self.compare(false, true),
            Lcmp => self.compare(true, false),
            LcmpUn => self.compare(true, true),
            Pcmp => self.compare(true, true),
            Fcmpl => self.float_compare(-1),
            Fcmpg => self.float_compare(1),
            Seteq => self.set_cond(Cond::Eq),
            Setne => self.set_cond(Cond::Ne),
            Setlt => self.set_cond(Cond::Lt),
            Setle => self.set_cond(Cond::Le),
            Setgt => self.set_cond(Cond::Gt),
            Setge => self.set_cond(Cond::Ge),

            Br => {
                self.branch(target);
                return Step::EndBlock;
            }
            Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn | Brtrue
            | Brfalse | Brnull | Brnonnull | BrPeq | BrPne => {
                let test = match insn.opcode {
                    Beq => Test::Int(Cond::Eq),
                    Bne => Test::Int(Cond::Ne),
                    Blt => Test::Int(Cond::Lt),
                    BltUn => Test::Int(Cond::LtUn),
                    Ble => Test::Int(Cond::Le),
                    BleUn => Test::Int(Cond::LeUn),
                    Bgt => Test::Int(Cond::Gt),
                    BgtUn => Test::Int(Cond::GtUn),
                    Bge => Test::Int(Cond::Ge),
                    BgeUn => Test::Int(Cond::GeUn),
                    BrPeq => Test::Native(Cond::Eq),
                    BrPne => Test::Native(Cond::Ne),
                    Brfalse | Brnull => Test::Zero(Cond::Eq),
                    _ => Test::Zero(Cond::Ne),
                };
                self.branch_if(test, target, next);
                return Step::EndBlock;
            }

            BreadElem => self.read_elem(Mem::Sbyte, pc),
            UbreadElem => self.read_elem(Mem::Byte, pc),
            SreadElem => self.read_elem(Mem::Short, pc),
            UsreadElem => self.read_elem(Mem::Ushort, pc),
            IreadElem => self.read_elem(Mem::Word32, pc),
            PreadElem | LreadElem => self.read_elem(Mem::Native, pc),
            BwriteElem => self.write_elem(Mem::Byte, pc),
            SwriteElem => self.write_elem(Mem::Short, pc),
            IwriteElem => self.write_elem(Mem::Word32, pc),
            PwriteElem | LwriteElem => self.write_elem(Mem::Native, pc),
            DreadElem => self.read_float_elem(pc),
            DwriteElem => self.write_float_elem(pc),
            ElemAddrShiftI4 => self.element_address(1 << (offset & 31), pc),
            ElemAddrMulI4 => self.element_address(offset as u32, pc),
            ArrayLen => self.array_len(pc),

            Bread => self.read_at(Mem::Sbyte, 0, pc),
            Ubread => self.read_at(Mem::Byte, 0, pc),
            Sread => self.read_at(Mem::Short, 0, pc),
            Usread => self.read_at(Mem::Ushort, 0, pc),
            Iread => self.read_at(Mem::Word32, 0, pc),
            Pread => self.read_at(Mem::Native, 0, pc),
            Bwrite => self.write_at(Mem::Byte, 0, pc),
            Swrite => self.write_at(Mem::Short, 0, pc),
            Iwrite => self.write_at(Mem::Word32, 0, pc),
            Pwrite => self.write_at(Mem::Native, 0, pc),
            Dread => self.read_float(pc),
            Dwrite => self.write_float(false, pc),
            BwriteR => self.write_reversed(Mem::Byte, pc),
            SwriteR => self.write_reversed(Mem::Short, pc),
            IwriteR => self.write_reversed(Mem::Word32, pc),
            PwriteR => self.write_reversed(Mem::Native, pc),
            DwriteR => self.write_float(true, pc),
            BreadField => self.read_at(Mem::Sbyte, offset, pc),
            UbreadField => self.read_at(Mem::Byte, offset, pc),
            SreadField => self.read_at(Mem::Short, offset, pc),
            UsreadField => self.read_at(Mem::Ushort, offset, pc),
            IreadField => self.read_at(Mem::Word32, offset, pc),
            PreadField => self.read_at(Mem::Native, offset, pc),
            BwriteField => self.write_at(Mem::Byte, offset, pc),
            SwriteField => self.write_at(Mem::Short, offset, pc),
            IwriteField => self.write_at(Mem::Word32, offset, pc),
            PwriteField => self.write_at(Mem::Native, offset, pc),
            IreadThis => self.read_this(Mem::Word32, offset, pc),
            PreadThis => self.read_this(Mem::Native, offset, pc),

            Get2d => self.get2d(pc),
            Set2d => self.set2d(offset as u32, pc),

            _ => {}
        }
        Step::Next
    }
}

/// Generates blocks for the code from `start_pc`. `labels` are the sorted
/// branch and handler targets; a block never runs across one. No new
/// instruction is translated once fewer than [`UNROLL_BUFMIN`] bytes remain
/// under `limit`.
pub fn generate<M: Machine>(
    machine: &M,
    view: CodeView<'_>,
    start_pc: usize,
    labels: &[usize],
    limit: usize,
) -> Generated {
    let mut unroller = Unroller::new(machine);
    if var::this_escapes(&view) {
        unroller.this_state = ThisState::Escaped;
    }
    let mut blocks = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    let mut pc = start_pc;

    let close = |unroller: &mut Unroller<'_, M>,
                 blocks: &mut Vec<Block>,
                 start: (usize, usize),
                 end: usize| {
        blocks.push(Block {
            pc: start.0,
            end,
            offset: start.1,
            len: unroller.code.len() - start.1,
        });
    };

    while pc < view.bytes.len() {
        if view.encoding == Encoding::DirectThreaded {
            match view.read_word(pc) {
                Ok(word) if !label_table().contains_key(&word) => {
                    pc += WORD_SIZE;
                    continue;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let insn = match view.decode(pc) {
            Ok(Decoded::Insn(insn)) => insn,
            Ok(Decoded::End) | Err(_) => break,
        };

        if let Some(start) = open {
            if labels.binary_search(&pc).is_ok() {
                unroller.branch_to_pc(pc);
                close(&mut unroller, &mut blocks, start, pc);
                open = None;
            }
        }
        if unroller.code.len() + UNROLL_BUFMIN > limit {
            break;
        }
        if matches!(insn.opcode, Opcode::Nop | Opcode::UnrollMethod) {
            pc = insn.next_pc();
            continue;
        }
        if !translates(machine, insn.opcode) {
            if let Some(start) = open.take() {
                unroller.branch_to_pc(pc);
                close(&mut unroller, &mut blocks, start, pc);
            }
            pc = insn.next_pc();
            continue;
        }

        let start = match open {
            Some(start) => start,
            None => {
                let start = (pc, unroller.code.len());
                unroller.start_block();
                open = Some(start);
                start
            }
        };
        let step = unroller.translate(&insn);
        pc = insn.next_pc();
        if step == Step::EndBlock {
            close(&mut unroller, &mut blocks, start, pc);
            open = None;
        }
    }

    if let Some(start) = open {
        unroller.branch_to_pc(pc);
        close(&mut unroller, &mut blocks, start, pc);
    }
    Generated {
        code: unroller.code,
        blocks,
    }
}

pub fn unroll_method(cache: &MethodCache, method: &MethodCode, start_pc: usize) -> UnrollOutcome {
    if !possible() {
        return UnrollOutcome::NotPossible;
    }
    #[cfg(target_arch = "x86_64")]
    {
        install(&Amd64::host(), cache, method, start_pc)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (cache, method, start_pc);
        UnrollOutcome::NotPossible
    }
}

#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
fn install<M: Machine>(
    machine: &M,
    cache: &MethodCache,
    method: &MethodCode,
    start_pc: usize,
) -> UnrollOutcome {
    let remaining = cache.remaining();
    if remaining < UNROLL_BUFMIN {
        tracing::warn!(method = %method.name, remaining, "method cache exhausted, not unrolling");
        return UnrollOutcome::CacheExhausted;
    }
    let generated = generate(machine, method.view(), start_pc, &method.labels, remaining);
    if generated.blocks.is_empty() {
        return UnrollOutcome::Unrolled { blocks: 0 };
    }
    let reservation = match cache.reserve(generated.code.len()) {
        Ok(reservation) => reservation,
        Err(err) => {
            tracing::warn!(method = %method.name, "{err}");
            return UnrollOutcome::CacheExhausted;
        }
    };
    let base = match cache.commit(reservation, &generated.code) {
        Ok(base) => base,
        Err(err) => {
            tracing::warn!(method = %method.name, "{err}");
            return UnrollOutcome::CacheExhausted;
        }
    };
    for block in &generated.blocks {
        if let Some(slot) = method.slot(block.pc) {
            slot.install(base + block.offset);
        }
    }
    tracing::debug!(
        method = %method.name,
        machine = M::NAME,
        blocks = generated.blocks.len(),
        bytes = generated.code.len(),
        cache_used = cache.used(),
        "unrolled"
    );
    UnrollOutcome::Unrolled {
        blocks: generated.blocks.len(),
    }
}

pub const MACHINES: [&str; 4] = [Amd64::NAME, X86::NAME, Arm::NAME, Ppc::NAME];

pub fn dump_method(machine: &str, method: &MethodCode) -> Option<String> {
    let view = method.view();
    let limit = usize::MAX / 2;
    let labels = &method.labels;
    let generated = if machine == Amd64::NAME {
        generate(&Amd64::host(), view, 0, labels, limit)
    } else if machine == X86::NAME {
        generate(&X86, view, 0, labels, limit)
    } else if machine == Arm::NAME {
        generate(&Arm, view, 0, labels, limit)
    } else if machine == Ppc::NAME {
        generate(&Ppc, view, 0, labels, limit)
    } else {
        return None;
    };
    Some(dump(&generated, view))
}

pub fn dump(generated: &Generated, view: CodeView<'_>) -> String {
    let mut out = String::new();
    for (index, block) in generated.blocks.iter().enumerate() {
        let _ = writeln!(
            out,
            "block {index}: pc {:#06x}..{:#06x} at +{:#x}, {} bytes",
            block.pc, block.end, block.offset, block.len
        );
        let mut pc = block.pc;
        while pc < block.end {
            match view.decode(pc) {
                Ok(Decoded::Insn(insn)) => {
                    let _ = writeln!(out, "  {pc:04x}  {}", insn.opcode.mnemonic());
                    pc = insn.next_pc();
                }
                Ok(Decoded::End) | Err(_) => break,
            }
        }
        let end = (block.offset + block.len).min(generated.code.len());
        for chunk in generated.code[block.offset..end].chunks(16) {
            let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
            let _ = writeln!(out, "    {}", hex.join(" "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CodeBuilder, reencode};

    fn assemble(build: impl FnOnce(&mut CodeBuilder)) -> Vec<u8> {
        let mut builder = CodeBuilder::new();
        build(&mut builder);
        builder.finish().expect("assemble")
    }

    fn generate_bytecode<M: Machine>(machine: &M, code: &[u8], labels: &[usize]) -> Generated {
        generate(machine, CodeView::new(code, Encoding::Bytecode), 0, labels, usize::MAX / 2)
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let code = assemble(|b| {
            b.local(Opcode::Iload, 0);
            b.local(Opcode::Iload, 1);
            b.op(Opcode::Iadd);
            b.local(Opcode::Istore, 2);
            b.op(Opcode::Return);
        });
        let generated = generate_bytecode(&Amd64::sysv(), &code, &[]);
        assert_eq!(generated.blocks.len(), 1);
        assert_eq!(generated.blocks[0].pc, 0);
        assert_eq!(generated.blocks[0].end, 4);
        assert_eq!(generated.blocks[0].len, generated.code.len());
    }

    #[test]
    fn labels_split_blocks() {
        let code = assemble(|b| {
            b.ldc_i4(1);
            b.ldc_i4(2);
            b.op(Opcode::Iadd);
            b.op(Opcode::Pop);
            b.op(Opcode::Return);
        });
        let generated = generate_bytecode(&Amd64::sysv(), &code, &[2]);
        let starts: Vec<usize> = generated.blocks.iter().map(|block| block.pc).collect();
        assert_eq!(starts, vec![0, 2]);
    }

    #[test]
    fn unsupported_instructions_are_skipped() {
        let code = assemble(|b| {
            b.ldc_i4(1);
            b.ptr(Opcode::Call, 0);
            b.ldc_i4(2);
            b.op(Opcode::Return);
        });
        let generated = generate_bytecode(&Amd64::sysv(), &code, &[]);
        let starts: Vec<usize> = generated.blocks.iter().map(|block| block.pc).collect();
        assert_eq!(starts, vec![0, 6]);
        assert_eq!(generated.blocks[0].end, 1);
    }

    #[test]
    fn branches_end_the_block() {
        let code = assemble(|b| {
            let top = b.new_label();
            b.bind(top);
            b.local(Opcode::Iload, 0);
            b.branch(Opcode::Brtrue, top);
            b.ldc_i4(0);
            b.op(Opcode::Return1);
        });
        let generated = generate_bytecode(&Amd64::sysv(), &code, &[0]);
        assert_eq!(generated.blocks.len(), 2);
        assert_eq!(generated.blocks[0].end, 6);
        assert_eq!(generated.blocks[1].pc, 6);
    }

    #[test]
    fn limit_stops_the_scan() {
        let code = assemble(|b| {
            for _ in 0..64 {
                b.ldc_i4(1);
                b.op(Opcode::Pop);
            }
            b.op(Opcode::Return);
        });
        let view = CodeView::new(&code, Encoding::Bytecode);
        let generated = generate(&Amd64::sysv(), view, 0, &[], UNROLL_BUFMIN + 64);
        assert_eq!(generated.blocks.len(), 1);
        assert!(generated.blocks[0].end < 128);
        assert!(generated.code.len() <= UNROLL_BUFMIN + 64);
    }

    #[test]
    fn machines_without_division_leave_it_to_the_interpreter() {
        let code = assemble(|b| {
            b.local(Opcode::Iload, 0);
            b.local(Opcode::Iload, 1);
            b.op(Opcode::Idiv);
            b.op(Opcode::Return1);
        });
        let arm = generate_bytecode(&Arm, &code, &[]);
        assert_eq!(arm.blocks[0].end, 2);
        let ppc = generate_bytecode(&Ppc, &code, &[]);
        assert_eq!(ppc.blocks[0].end, 3);
    }

    #[test]
    fn threaded_code_scans_the_same_blocks() {
        let code = assemble(|b| {
            b.local(Opcode::Iload, 0);
            b.ldc_i4(3);
            b.op(Opcode::Imul);
            b.op(Opcode::Return1);
        });
        let source = CodeView::new(&code, Encoding::Bytecode);
        let insns = source.instructions().expect("decode");
        let threaded = reencode(&source, &insns, Encoding::DirectThreaded, &[Opcode::UnrollMethod])
            .expect("reencode");
        init();
        let view = CodeView::new(&threaded.code, Encoding::DirectThreaded);
        let generated = generate(&Amd64::sysv(), view, 0, &[], usize::MAX / 2);
        assert_eq!(generated.blocks.len(), 1);
        assert_eq!(generated.blocks[0].pc, threaded.body_start);
        let rendered = dump(&generated, view);
        assert!(rendered.contains("imul"));
        assert!(!rendered.contains("return_1"));
    }

    #[test]
    fn address_of_this_behind_a_back_edge_keeps_every_check() {
        let body = |local: u32| {
            assemble(|b| {
                let top = b.new_label();
                b.bind(top);
                b.word(Opcode::IreadThis, 0);
                b.op(Opcode::Pop);
                b.word(Opcode::IreadThis, 4);
                b.op(Opcode::Pop);
                b.local(Opcode::Waddr, local);
                b.op(Opcode::Pop);
                b.branch(Opcode::Br, top);
            })
        };
        let escaping = generate_bytecode(&Amd64::sysv(), &body(0), &[0]);
        let plain = generate_bytecode(&Amd64::sysv(), &body(1), &[0]);
        assert_eq!(escaping.blocks.len(), 1);
        assert!(escaping.blocks[0].len > plain.blocks[0].len + 16);
    }

    #[test]
    fn float_memory_and_compares_stay_in_one_block() {
        let code = assemble(|b| {
            b.local(Opcode::Pload, 0);
            b.op(Opcode::Dread);
            b.local(Opcode::Pload, 1);
            b.op(Opcode::Dread);
            b.op(Opcode::Fcmpg);
            b.op(Opcode::Pop);
            b.local(Opcode::Pload, 2);
            b.local(Opcode::Iload, 3);
            b.op(Opcode::DreadElem);
            b.local(Opcode::Pload, 0);
            b.op(Opcode::DwriteR);
            b.op(Opcode::Return);
        });
        let amd64 = generate_bytecode(&Amd64::sysv(), &code, &[]);
        assert_eq!(amd64.blocks.len(), 1);
        assert_eq!(amd64.blocks[0].end, code.len() - 1);
        let ppc = generate_bytecode(&Ppc, &code, &[]);
        assert_eq!(ppc.blocks[0].end, 1);
    }

    #[test]
    fn every_machine_generates_the_2d_sequence() {
        let code = assemble(|b| {
            b.local(Opcode::Pload, 0);
            b.ldc_i4(2);
            b.ldc_i4(3);
            b.op(Opcode::Get2d);
            b.op(Opcode::Iread);
            b.op(Opcode::Return1);
        });
        for generated in [
            generate_bytecode(&Amd64::sysv(), &code, &[]),
            generate_bytecode(&X86, &code, &[]),
            generate_bytecode(&Arm, &code, &[]),
            generate_bytecode(&Ppc, &code, &[]),
        ] {
            assert_eq!(generated.blocks.len(), 1);
            assert_eq!(generated.blocks[0].end, 6);
        }
    }
}
