use std::collections::{BTreeSet, HashMap};

use crate::format::{CodeView, Encoding, Insn, Operand};
use crate::image::{ExceptionRegion, Image, MethodDef, MethodId, TypeId};
use crate::opcodes::Opcode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyError {
    pub pc: usize,
    pub reason: String,
}

impl VerifyError {
    fn new(pc: usize, reason: impl Into<String>) -> Self {
        Self {
            pc,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at {}: {}", self.pc, self.reason)
    }
}

impl std::error::Error for VerifyError {}

#[derive(Debug)]
pub struct Verified {
    pub insns: Vec<Insn>,
    pub max_stack: u32,
    pub labels: BTreeSet<usize>,
}

pub struct Scope<'a> {
    pub image: &'a Image,
    pub def: &'a MethodDef,
    pub locals: u32,
    pub thunks: usize,
}

fn stack_effect(scope: &Scope<'_>, insn: &Insn) -> Result<(u32, u32), VerifyError> {
    use Opcode::*;
    let effect = match insn.opcode {
        Nop | UnrollMethod | Br => (0, 0),
        Iload0 | Iload1 | Iload2 | Iload3 | Iload | Pload0 | Pload1 | Pload2 | Pload3 | Pload
        | Waddr | Ldnull | LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45
        | LdcI46 | LdcI47 | LdcI48 | LdcI4S | LdcI4 | LdcI8 | LdcR4 | LdcR8 | PreadThis
        | IreadThis => (0, 1),
        Istore0 | Istore1 | Istore2 | Istore3 | Istore | Pstore0 | Pstore1 | Pstore2
        | Pstore3 | Pstore | Pop => (1, 0),
        Bread | Ubread | Sread | Usread | Iread | Dread | Pread => (1, 1),
        Bwrite | Swrite | Iwrite | Dwrite | Pwrite | BwriteR | SwriteR | IwriteR | DwriteR
        | PwriteR => (2, 0),
        Dup => (1, 2),
        Dup2 => (2, 4),
        Pop2 => (2, 0),
        Iadd | Isub | Imul | Idiv | IdivUn | Irem | IremUn | Ladd | Lsub | Lmul | Ldiv
        | LdivUn | Lrem | LremUn | Fadd | Fsub | Fmul | Fdiv | Frem | Iand | Ior | Ixor
        | Ishl | Ishr | IshrUn | Land | Lor | Lxor | Lshl | Lshr | LshrUn | PaddI4 | PaddI4R | Psub | PsubI4 => (2, 1),
        Ineg | Lneg | Fneg | Inot | Lnot | I2b | I2ub | I2s | I2us | I2l | Iu2l | I2f | Iu2f
        | L2i | L2f | Lu2f | F2i | F2iu | F2l | F2lu | F2f | F2d | Cknull | PaddOffset => (1, 1),
        Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn | BrPeq | BrPne => {
            (2, 0)
        }
        Brtrue | Brfalse | Brnull | Brnonnull | Switch => (1, 0),
        BreadElem | UbreadElem | SreadElem | UsreadElem | IreadElem | PreadElem | LreadElem
        | DreadElem | ElemAddrShiftI4 | ElemAddrMulI4 => (2, 1),
        BwriteElem | SwriteElem | IwriteElem | PwriteElem | LwriteElem | DwriteElem => (3, 0),
        ArrayLen => (1, 1),
        BreadField | UbreadField | SreadField | UsreadField | IreadField | PreadField => (1, 1),
        BwriteField | SwriteField | IwriteField | PwriteField => (2, 0),
        Call | CallCtor => {
            let id = MethodId(insn.operand.int() as u32);
            let callee = scope
                .image
                .method(id)
                .ok_or_else(|| VerifyError::new(insn.pc, format!("no method {}", id.0)))?;
            let ret = u32::from(callee.def.ret.is_some());
            if insn.opcode == CallCtor {
                if !callee.def.is_ctor {
                    return Err(VerifyError::new(insn.pc, "call_ctor of a non-constructor"));
                }
                (callee.def.arg_words() - 1, 1)
            } else {
                (callee.def.arg_words(), ret)
            }
        }
        CallNative | CallNativeRaw => (0, 1),
        CallNativeVoid | CallNativeVoidRaw => (0, 0),
        Return => (0, 0),
        Return1 => (1, 0),
        Return2 => (2, 0),
        ReturnN => (insn.operand.int() as u32, 0),
        New => (0, 1),
        Icmp | IcmpUn | Lcmp | LcmpUn | Fcmpl | Fcmpg | Pcmp => (2, 1),
        Seteq | Setne | Setlt | Setle | Setgt | Setge => (1, 1),
        Get2d => (3, 1),
        Set2d => {
            let words = insn.operand.int() as u32;
            (words + 3, words + 1)
        }
        Throw => (1, 0),
        Wide | Prefix => return Err(VerifyError::new(insn.pc, "escape byte as instruction")),
    };
    Ok(effect)
}

fn check_operands(scope: &Scope<'_>, insn: &Insn) -> Result<(), VerifyError> {
    use Opcode::*;
    let frame_words = scope.def.arg_words() + scope.locals;
    let fail = |reason: String| Err(VerifyError::new(insn.pc, reason));
    match insn.opcode {
        Iload0 | Iload1 | Iload2 | Iload3 | Iload | Pload0 | Pload1 | Pload2 | Pload3 | Pload
        | Istore0 | Istore1 | Istore2 | Istore3 | Istore | Pstore0 | Pstore1 | Pstore2
        | Pstore3 | Pstore | Waddr => {
            let index = insn
                .opcode
                .implied_local()
                .unwrap_or(insn.operand.int() as u32);
            if index >= frame_words {
                return fail(format!("local {index} out of range ({frame_words} words)"));
            }
        }
        PreadThis | IreadThis if !scope.def.has_this => {
            return fail("this access in a static method".to_string());
        }
        BreadField | UbreadField | SreadField | UsreadField | IreadField | PreadField
        | BwriteField | SwriteField | IwriteField | PwriteField | PreadThis | IreadThis => {
            if insn.operand.int() < 0 {
                return fail(format!("negative field offset {}", insn.operand.int()));
            }
        }
        CallNative | CallNativeVoid | CallNativeRaw | CallNativeVoidRaw => {
            let (thunk, words) = match insn.operand {
                Operand::Pair(thunk, words) => (thunk, words),
                _ => (u32::MAX, 0),
            };
            if thunk as usize >= scope.thunks {
                return fail(format!("no thunk {thunk}"));
            }
            if words > scope.def.arg_words() {
                return fail(format!("native call passes {words} of {} words", scope.def.arg_words()));
            }
        }
        New => {
            let ty = TypeId(insn.operand.int() as u32);
            if scope.image.ty(ty).is_none() {
                return fail(format!("no type {}", ty.0));
            }
        }
        ReturnN | Set2d if insn.operand.int() < 0 => {
            return fail("negative word count".to_string());
        }
        ElemAddrShiftI4 if !(0..31).contains(&insn.operand.int()) => {
            return fail(format!("element shift {} out of range", insn.operand.int()));
        }
        ElemAddrMulI4 if insn.operand.int() <= 0 => {
            return fail(format!("element size {} is not positive", insn.operand.int()));
        }
        _ => {}
    }
    Ok(())
}

fn successors(view: &CodeView<'_>, insn: &Insn) -> Result<Vec<usize>, VerifyError> {
    let mut out = Vec::new();
    if !insn.opcode.ends_flow() {
        out.push(insn.next_pc());
    }
    match insn.operand {
        Operand::Target(target) => out.push(target),
        Operand::Switch { count, default } => {
            out.push(default);
            for index in 0..count {
                let target = view
                    .switch_target(insn, index)
                    .map_err(|err| VerifyError::new(insn.pc, err.to_string()))?;
                out.push(target);
            }
        }
        _ => {}
    }
    Ok(out)
}

pub fn verify(
    scope: &Scope<'_>,
    code: &[u8],
    regions: &[ExceptionRegion],
) -> Result<Verified, VerifyError> {
    let view = CodeView::new(code, Encoding::Bytecode);
    let insns = view
        .instructions()
        .map_err(|err| VerifyError::new(0, err.to_string()))?;
    if insns.is_empty() {
        return Err(VerifyError::new(0, "empty method body"));
    }
    let index: HashMap<usize, usize> = insns
        .iter()
        .enumerate()
        .map(|(position, insn)| (insn.pc, position))
        .collect();
    let end = insns.last().map(Insn::next_pc).unwrap_or(0);

    let mut labels = BTreeSet::new();
    let mut heights: Vec<Option<u32>> = vec![None; insns.len()];
    let mut pending = vec![(0usize, 0u32)];

    for region in regions {
        for pc in [region.try_start, region.handler] {
            if !index.contains_key(&pc) {
                return Err(VerifyError::new(pc, "exception region boundary inside an instruction"));
            }
        }
        if region.try_end != end && !index.contains_key(&region.try_end) {
            return Err(VerifyError::new(region.try_end, "exception region end inside an instruction"));
        }
        if region.try_start >= region.try_end {
            return Err(VerifyError::new(region.try_start, "empty exception region"));
        }
        labels.extend([region.try_start, region.try_end, region.handler]);
        pending.push((region.handler, 1));
    }

    let mut max_stack = 0u32;
    while let Some((pc, height)) = pending.pop() {
        let Some(&position) = index.get(&pc) else {
            if pc == end {
                return Err(VerifyError::new(pc, "control falls off the end of the method"));
            }
            return Err(VerifyError::new(pc, "branch into the middle of an instruction"));
        };
        match heights[position] {
            Some(known) if known == height => continue,
            Some(known) => {
                return Err(VerifyError::new(
                    pc,
                    format!("stack height {height} does not match {known}"),
                ));
            }
            None => heights[position] = Some(height),
        }

        let insn = &insns[position];
        check_operands(scope, insn)?;
        let (pops, pushes) = stack_effect(scope, insn)?;
        if height < pops {
            return Err(VerifyError::new(
                pc,
                format!("{} needs {pops} words, stack has {height}", insn.opcode.mnemonic()),
            ));
        }
        let after = height - pops + pushes;
        max_stack = max_stack.max(after).max(height);

        for target in successors(&view, insn)? {
            if target != insn.next_pc() || insn.opcode.is_branch() {
                labels.insert(target);
            }
            pending.push((target, after));
        }
    }

    Ok(Verified {
        insns,
        max_stack,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CodeBuilder;
    use crate::image::{TypeDef, ValueType};

    fn scope_for<'a>(image: &'a Image, def: &'a MethodDef) -> Scope<'a> {
        Scope {
            image,
            def,
            locals: 1,
            thunks: 0,
        }
    }

    fn method(params: usize) -> MethodDef {
        MethodDef::bytecode(
            "m",
            TypeId(0),
            vec![ValueType::I32; params],
            Some(ValueType::I32),
            1,
            Vec::new(),
        )
    }

    fn image() -> Image {
        let mut image = Image::new("test");
        image.add_type(TypeDef::new("T", 8));
        image
    }

    #[test]
    fn computes_max_stack_and_labels() {
        let mut b = CodeBuilder::new();
        let done = b.new_label();
        b.local(Opcode::Iload, 0);
        b.local(Opcode::Iload, 1);
        b.op(Opcode::Iadd);
        b.op(Opcode::Dup);
        b.branch(Opcode::Brtrue, done);
        b.op(Opcode::Pop);
        b.ldc_i4(0);
        b.bind(done);
        b.op(Opcode::Return1);
        let code = b.finish().expect("assemble");

        let image = image();
        let def = method(2);
        let verified = verify(&scope_for(&image, &def), &code, &[]).expect("verifies");
        assert_eq!(verified.max_stack, 2);
        assert!(verified.labels.contains(&11));
    }

    #[test]
    fn rejects_underflow() {
        let mut b = CodeBuilder::new();
        b.op(Opcode::Iadd);
        b.op(Opcode::Return1);
        let code = b.finish().expect("assemble");
        let image = image();
        let def = method(0);
        let err = verify(&scope_for(&image, &def), &code, &[]).expect_err("underflow");
        assert_eq!(err.pc, 0);
    }

    #[test]
    fn rejects_mismatched_heights() {
        let mut b = CodeBuilder::new();
        let join = b.new_label();
        b.local(Opcode::Iload, 0);
        b.branch(Opcode::Brfalse, join);
        b.ldc_i4(1);
        b.bind(join);
        b.ldc_i4(2);
        b.op(Opcode::Return1);
        let code = b.finish().expect("assemble");
        let image = image();
        let def = method(1);
        let err = verify(&scope_for(&image, &def), &code, &[]).expect_err("mismatch");
        assert!(err.reason.contains("does not match"), "{err}");
    }

    #[test]
    fn rejects_falling_off_the_end() {
        let mut b = CodeBuilder::new();
        b.ldc_i4(1);
        b.op(Opcode::Pop);
        let code = b.finish().expect("assemble");
        let image = image();
        let def = method(0);
        let err = verify(&scope_for(&image, &def), &code, &[]).expect_err("falls off");
        assert!(err.reason.contains("falls off"), "{err}");
    }

    #[test]
    fn rejects_out_of_range_locals() {
        let mut b = CodeBuilder::new();
        b.local(Opcode::Iload, 5);
        b.op(Opcode::Return1);
        let code = b.finish().expect("assemble");
        let image = image();
        let def = method(1);
        let err = verify(&scope_for(&image, &def), &code, &[]).expect_err("bad local");
        assert!(err.reason.contains("local 5"), "{err}");
    }

    #[test]
    fn handlers_start_with_the_exception_object() {
        let mut b = CodeBuilder::new();
        b.ldc_i4(1);
        b.ldc_i4(0);
        b.op(Opcode::Idiv);
        b.op(Opcode::Return1);
        let handler = b.position();
        b.op(Opcode::Pop);
        b.ldc_i4(-1);
        b.op(Opcode::Return1);
        let code = b.finish().expect("assemble");
        let regions = [ExceptionRegion {
            try_start: 0,
            try_end: handler,
            handler,
            catch: None,
        }];
        let image = image();
        let def = method(0);
        let verified = verify(&scope_for(&image, &def), &code, &regions).expect("verifies");
        assert!(verified.labels.contains(&handler));
    }
}
