use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::cache::CodeSlot;
use crate::converter::{self, MethodCode};
use crate::engine::Engine;
use crate::exception::{EngineError, EngineResult, ExceptionKind, ManagedException};
use crate::format::{Decoded, Insn, Operand, WORD_SIZE, Word};
use crate::heap::{
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, MARRAY_DATA_OFFSET, MARRAY_ELEM_SIZE_OFFSET,
    MARRAY_LOWER_OFFSET, MARRAY_MULT_OFFSET, MARRAY_SIZE_OFFSET, exception_kind, marray_bound,
    read_raw, write_raw,
};
use crate::image::{ExceptionRegion, MethodId, TypeDef, TypeId};
use crate::machine::{BlockFn, Mem, NativeState};
use crate::opcodes::Opcode;
use crate::unroll::{self, UnrollOutcome};

struct Frame {
    code: Arc<MethodCode>,
    pc: usize,
    base: usize,
    stack_base: usize,
    return_to: usize,
    ctor_object: Option<Word>,
}

enum Raise {
    Managed(ManagedException),
    Thrown(Word, ManagedException),
    Fatal(EngineError),
}

impl From<ExceptionKind> for Raise {
    fn from(kind: ExceptionKind) -> Self {
        Raise::Managed(ManagedException::new(kind))
    }
}

impl From<ManagedException> for Raise {
    fn from(exception: ManagedException) -> Self {
        Raise::Managed(exception)
    }
}

enum Control {
    Next,
    Jump(usize),
    Entered,
    Returned(Option<Vec<Word>>),
}

fn int(value: Word) -> i32 {
    value as u32 as i32
}

fn word(value: i32) -> Word {
    value as u32 as Word
}

fn float(value: Word) -> f64 {
    f64::from_bits(value)
}

fn three_way<T: PartialOrd>(a: T, b: T) -> i32 {
    if a < b {
        -1
    } else if a == b {
        0
    } else {
        1
    }
}

fn float_compare(a: f64, b: f64, nan: i32) -> i32 {
    if a.is_nan() || b.is_nan() {
        nan
    } else {
        three_way(a, b)
    }
}

fn int_branch_taken(opcode: Opcode, a: Word, b: Word) -> bool {
    let (sa, sb) = (int(a), int(b));
    let (ua, ub) = (a as u32, b as u32);
    match opcode {
        Opcode::Beq => sa == sb,
        Opcode::Bne => sa != sb,
        Opcode::Blt => sa < sb,
        Opcode::BltUn => ua < ub,
        Opcode::Ble => sa <= sb,
        Opcode::BleUn => ua <= ub,
        Opcode::Bgt => sa > sb,
        Opcode::BgtUn => ua > ub,
        Opcode::Bge => sa >= sb,
        Opcode::BgeUn => ua >= ub,
        _ => false,
    }
}

fn local_index(insn: &Insn) -> usize {
    insn.opcode
        .implied_local()
        .unwrap_or(insn.operand.int() as u32) as usize
}

fn handler_for(regions: &[ExceptionRegion], pc: usize, kind: ExceptionKind) -> Option<usize> {
    regions
        .iter()
        .filter(|region| region.covers(pc) && region.catches(kind))
        .min_by_key(|region| region.try_end - region.try_start)
        .map(|region| region.handler)
}

/// # Safety
/// `addr` must be readable for `kind`.
unsafe fn read_mem(kind: Mem, addr: Word) -> Word {
    unsafe {
        match kind {
            Mem::Sbyte => word(read_raw::<i8>(addr) as i32),
            Mem::Byte => read_raw::<u8>(addr) as Word,
            Mem::Short => word(read_raw::<i16>(addr) as i32),
            Mem::Ushort => read_raw::<u16>(addr) as Word,
            Mem::Word32 => read_raw::<u32>(addr) as Word,
            Mem::Native => read_raw::<u64>(addr),
        }
    }
}

/// # Safety
/// `addr` must be writable for `kind`.
unsafe fn write_mem(kind: Mem, addr: Word, value: Word) {
    unsafe {
        match kind {
            Mem::Sbyte | Mem::Byte => write_raw(addr, value as u8),
            Mem::Short | Mem::Ushort => write_raw(addr, value as u16),
            Mem::Word32 => write_raw(addr, value as u32),
            Mem::Native => write_raw(addr, value),
        }
    }
}

fn element_address(array: Word, index: Word, kind: Mem) -> Result<Word, Raise> {
    sized_element_address(array, index, kind.size(WORD_SIZE as u32) as Word)
}

fn sized_element_address(array: Word, index: Word, size: Word) -> Result<Word, Raise> {
    if array == 0 {
        return Err(ExceptionKind::NullReference.into());
    }
    // SAFETY: non-null array references point at an array header.
    let length = unsafe { read_raw::<u32>(array + ARRAY_LENGTH_OFFSET as Word) };
    let index = index as u32;
    if index >= length {
        return Err(ExceptionKind::IndexOutOfRange.into());
    }
    Ok(array + ARRAY_DATA_OFFSET as Word + (index as Word).wrapping_mul(size))
}

fn field_address(object: Word, offset: i64) -> Result<Word, Raise> {
    if object == 0 {
        return Err(ExceptionKind::NullReference.into());
    }
    Ok(object.wrapping_add(offset as Word))
}

fn element_address_2d(array: Word, i: Word, j: Word) -> Result<Word, Raise> {
    if array == 0 {
        return Err(ExceptionKind::NullReference.into());
    }
    // SAFETY: non-null 2-D array references point at a full header.
    let bound = |dim: i32, field: i32| unsafe {
        read_raw::<i32>(array + marray_bound(dim, field) as Word)
    };
    let i = int(i).wrapping_sub(bound(0, MARRAY_LOWER_OFFSET));
    if i as u32 >= bound(0, MARRAY_SIZE_OFFSET) as u32 {
        return Err(ExceptionKind::IndexOutOfRange.into());
    }
    let j = int(j).wrapping_sub(bound(1, MARRAY_LOWER_OFFSET));
    if j as u32 >= bound(1, MARRAY_SIZE_OFFSET) as u32 {
        return Err(ExceptionKind::IndexOutOfRange.into());
    }
    // SAFETY: as above.
    let (elem_size, data) = unsafe {
        (
            read_raw::<i32>(array + MARRAY_ELEM_SIZE_OFFSET as Word),
            read_raw::<Word>(array + MARRAY_DATA_OFFSET as Word),
        )
    };
    let offset = i
        .wrapping_mul(bound(0, MARRAY_MULT_OFFSET))
        .wrapping_add(j.wrapping_mul(bound(1, MARRAY_MULT_OFFSET)))
        .wrapping_mul(elem_size);
    Ok(data.wrapping_add(offset as u32 as Word))
}

pub struct Thread<'e> {
    engine: &'e Engine,
    /// Never reallocated; unrolled blocks hold addresses into it.
    stack: Box<[Word]>,
    sp: usize,
    frames: Vec<Frame>,
    reexecute: bool,
    native_entries: u64,
}

impl<'e> Thread<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            stack: vec![0; engine.config().stack_words].into_boxed_slice(),
            sp: 0,
            frames: Vec::new(),
            reexecute: false,
            native_entries: 0,
        }
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    pub fn native_entries(&self) -> u64 {
        self.native_entries
    }

    pub fn convert(&mut self, id: MethodId) -> EngineResult<Arc<MethodCode>> {
        converter::convert(self, id).map_err(|err| EngineError::Uncaught(err.into()))
    }

    pub fn invoke(&mut self, id: MethodId, args: &[Word]) -> EngineResult<Vec<Word>> {
        let code = self.convert(id)?;
        if args.len() != code.args as usize {
            return Err(EngineError::InvalidProgram {
                method: code.name.clone(),
                pc: 0,
                reason: format!("expected {} argument words, got {}", code.args, args.len()),
            });
        }
        let floor = self.frames.len();
        let base = self.sp;
        let end = base + args.len();
        if end > self.stack.len() {
            return Err(EngineError::Uncaught(ManagedException::new(
                ExceptionKind::StackOverflow,
            )));
        }
        self.stack[base..end].copy_from_slice(args);
        self.sp = end;
        let reexecute = std::mem::take(&mut self.reexecute);

        let result = match self.enter(code, base, 0, None) {
            Ok(()) => self.run(floor),
            Err(Raise::Fatal(err)) => Err(err),
            Err(Raise::Managed(exception) | Raise::Thrown(_, exception)) => {
                Err(EngineError::Uncaught(exception))
            }
        };
        self.frames.truncate(floor);
        self.sp = base;
        self.reexecute = reexecute;
        result
    }

    fn run(&mut self, floor: usize) -> EngineResult<Vec<Word>> {
        loop {
            match self.step(floor) {
                Ok(Some(values)) => return Ok(values),
                Ok(None) => {}
                Err(Raise::Fatal(err)) => return Err(err),
                Err(Raise::Managed(exception)) => self.unwind(floor, exception, None)?,
                Err(Raise::Thrown(object, exception)) => {
                    self.unwind(floor, exception, Some(object))?
                }
            }
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Raise {
        let (method, pc) = match self.frames.last() {
            Some(frame) => (frame.code.name.clone(), frame.pc),
            None => (String::new(), 0),
        };
        Raise::Fatal(EngineError::InvalidProgram {
            method,
            pc,
            reason: reason.into(),
        })
    }

    fn step(&mut self, floor: usize) -> Result<Option<Vec<Word>>, Raise> {
        let Some(frame) = self.frames.last() else {
            return Err(self.invalid("no active frame"));
        };
        let code = Arc::clone(&frame.code);
        let (pc, base) = (frame.pc, frame.base);

        if !std::mem::take(&mut self.reexecute) {
            let addr = code.slot(pc).map_or(0, CodeSlot::load);
            if addr != 0 {
                self.enter_block(addr, pc, base)?;
                return Ok(None);
            }
        }

        let insn = match code.view().decode(pc) {
            Ok(Decoded::Insn(insn)) => insn,
            Ok(Decoded::End) => return Err(self.invalid("ran off the end of the method")),
            Err(err) => return Err(self.invalid(err.to_string())),
        };
        let next = match self.execute(&code, &insn, base, floor)? {
            Control::Next => insn.next_pc(),
            Control::Jump(target) => target,
            Control::Entered => return Ok(None),
            Control::Returned(values) => return Ok(values),
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = next;
        }
        Ok(None)
    }

    fn enter_block(&mut self, addr: usize, pc: usize, base: usize) -> Result<(), Raise> {
        let origin = self.stack.as_mut_ptr();
        let mut state = NativeState {
            pc: pc as u64,
            stack: origin.wrapping_add(self.sp) as usize as u64,
            frame: origin.wrapping_add(base) as usize as u64,
            reexecute: 0,
        };
        // SAFETY: slots only ever hold entry points of blocks committed to
        // the method cache for this method's code. A block touches the
        // current frame's locals and at most `max_stack` operand slots.
        unsafe {
            let block = std::mem::transmute::<usize, BlockFn>(addr);
            block(&mut state);
        }
        self.native_entries += 1;

        let offset = state.stack.wrapping_sub(origin as usize as u64) as usize;
        let sp = offset / WORD_SIZE;
        if offset % WORD_SIZE != 0 || sp > self.stack.len() {
            return Err(self.invalid("unrolled block left a corrupt stack pointer"));
        }
        self.sp = sp;
        self.reexecute = state.reexecute != 0;
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = state.pc as usize;
        }
        Ok(())
    }

    fn unroll_trigger(&self, code: &MethodCode, start: usize) {
        let Some(cache) = self.engine.cache() else {
            return;
        };
        let threshold = self.engine.config().unroll.threshold.max(1);
        let counted = code
            .unroll_counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                (count < threshold).then_some(count + 1)
            });
        if counted != Ok(threshold - 1) {
            return;
        }
        match unroll::unroll_method(cache, code, start) {
            UnrollOutcome::Unrolled { blocks } => {
                tracing::trace!(method = %code.name, blocks, "unroll trigger fired");
            }
            outcome => {
                tracing::debug!(method = %code.name, ?outcome, "method stays interpreted");
            }
        }
    }

    fn push(&mut self, value: Word) -> Result<(), Raise> {
        let slot = self
            .stack
            .get_mut(self.sp)
            .ok_or(Raise::from(ExceptionKind::StackOverflow))?;
        *slot = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Word, Raise> {
        match self.sp.checked_sub(1) {
            Some(sp) => {
                self.sp = sp;
                Ok(self.stack[sp])
            }
            None => Err(self.invalid("operand stack underflow")),
        }
    }

    fn pop2(&mut self) -> Result<(Word, Word), Raise> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn peek(&self) -> Result<Word, Raise> {
        self.sp
            .checked_sub(1)
            .map(|top| self.stack[top])
            .ok_or_else(|| self.invalid("operand stack underflow"))
    }

    fn local(&self, base: usize, index: usize) -> Result<Word, Raise> {
        self.stack
            .get(base + index)
            .copied()
            .ok_or_else(|| self.invalid(format!("local {index} out of range")))
    }

    fn set_local(&mut self, base: usize, index: usize, value: Word) -> Result<(), Raise> {
        match self.stack.get_mut(base + index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.invalid(format!("local {index} out of range"))),
        }
    }

    fn binary_int(&mut self, op: impl FnOnce(i32, i32) -> Result<i32, Raise>) -> Result<(), Raise> {
        let (a, b) = self.pop2()?;
        let result = op(int(a), int(b))?;
        self.push(word(result))
    }

    fn binary_long(
        &mut self,
        op: impl FnOnce(i64, i64) -> Result<i64, Raise>,
    ) -> Result<(), Raise> {
        let (a, b) = self.pop2()?;
        let result = op(a as i64, b as i64)?;
        self.push(result as Word)
    }

    fn binary_float(&mut self, op: impl FnOnce(f64, f64) -> f64) -> Result<(), Raise> {
        let (a, b) = self.pop2()?;
        self.push(op(float(a), float(b)).to_bits())
    }

    fn unary(&mut self, op: impl FnOnce(Word) -> Word) -> Result<(), Raise> {
        let value = self.pop()?;
        self.push(op(value))
    }

    fn read(&mut self, kind: Mem, offset: i64) -> Result<(), Raise> {
        let object = self.pop()?;
        let addr = field_address(object, offset)?;
        // SAFETY: verified code only dereferences object, array and local
        // addresses it was handed.
        let value = unsafe { read_mem(kind, addr) };
        self.push(value)
    }

    fn write(&mut self, kind: Mem, offset: i64) -> Result<(), Raise> {
        let (object, value) = self.pop2()?;
        let addr = field_address(object, offset)?;
        // SAFETY: as in `read`.
        unsafe { write_mem(kind, addr, value) };
        Ok(())
    }

    fn write_reversed(&mut self, kind: Mem) -> Result<(), Raise> {
        let (value, ptr) = self.pop2()?;
        let addr = field_address(ptr, 0)?;
        // SAFETY: as in `read`.
        unsafe { write_mem(kind, addr, value) };
        Ok(())
    }

    fn read_elem(&mut self, kind: Mem) -> Result<(), Raise> {
        let (array, index) = self.pop2()?;
        let addr = element_address(array, index, kind)?;
        // SAFETY: the index was checked against the array length.
        let value = unsafe { read_mem(kind, addr) };
        self.push(value)
    }

    fn write_elem(&mut self, kind: Mem) -> Result<(), Raise> {
        let value = self.pop()?;
        let (array, index) = self.pop2()?;
        let addr = element_address(array, index, kind)?;
        // SAFETY: the index was checked against the array length.
        unsafe { write_mem(kind, addr, value) };
        Ok(())
    }

    fn read_this(&mut self, base: usize, kind: Mem, offset: i64) -> Result<(), Raise> {
        let this = self.local(base, 0)?;
        let addr = field_address(this, offset)?;
        // SAFETY: as in `read`.
        let value = unsafe { read_mem(kind, addr) };
        self.push(value)
    }

    fn set2d(&mut self, words: usize) -> Result<(), Raise> {
        let at = self
            .sp
            .checked_sub(words + 3)
            .ok_or_else(|| self.invalid("operand stack underflow"))?;
        let addr =
            element_address_2d(self.stack[at], self.stack[at + 1], self.stack[at + 2])?;
        self.stack[at] = addr;
        self.stack.copy_within(at + 3..self.sp, at + 1);
        self.sp -= 2;
        Ok(())
    }

    fn instance_size(&self, ty: TypeId) -> Result<u32, Raise> {
        self.engine
            .image()
            .ty(ty)
            .and_then(TypeDef::instance_size)
            .ok_or_else(|| Raise::from(ExceptionKind::TypeInitialization))
    }

    fn call(&mut self, id: MethodId, ctor: bool, return_to: usize) -> Result<(), Raise> {
        let code = converter::convert(self, id).map_err(|err| Raise::Managed(err.into()))?;
        let mut object = None;
        if ctor && !code.alloc_ctor {
            let instance = self.engine.heap().new_object(self.instance_size(code.owner)?)?;
            let params = (code.args as usize).saturating_sub(1);
            let start = self
                .sp
                .checked_sub(params)
                .ok_or_else(|| self.invalid("constructor arguments missing"))?;
            if self.sp >= self.stack.len() {
                return Err(ExceptionKind::StackOverflow.into());
            }
            self.stack.copy_within(start..self.sp, start + 1);
            self.stack[start] = instance;
            self.sp += 1;
            object = Some(instance);
        }
        let base = self
            .sp
            .checked_sub(code.args as usize)
            .ok_or_else(|| self.invalid("call arguments missing"))?;
        self.enter(code, base, return_to, object)
    }

    fn enter(
        &mut self,
        code: Arc<MethodCode>,
        base: usize,
        return_to: usize,
        ctor_object: Option<Word>,
    ) -> Result<(), Raise> {
        let stack_base = base + code.frame_words as usize;
        let limit = stack_base + code.max_stack as usize;
        if self.frames.len() >= self.engine.config().max_call_depth || limit > self.stack.len() {
            return Err(ExceptionKind::StackOverflow.into());
        }
        self.stack[base + code.args as usize..stack_base].fill(0);
        self.sp = stack_base;
        self.frames.push(Frame {
            code,
            pc: 0,
            base,
            stack_base,
            return_to,
            ctor_object,
        });
        Ok(())
    }

    fn ret(&mut self, words: usize, floor: usize) -> Result<Option<Vec<Word>>, Raise> {
        let start = self
            .sp
            .checked_sub(words)
            .ok_or_else(|| self.invalid("operand stack underflow"))?;
        let mut values = self.stack[start..self.sp].to_vec();
        let Some(frame) = self.frames.pop() else {
            return Err(self.invalid("return without a frame"));
        };
        self.sp = frame.base;
        values.extend(frame.ctor_object);
        if self.frames.len() <= floor {
            return Ok(Some(values));
        }
        for value in values {
            self.push(value)?;
        }
        if let Some(caller) = self.frames.last_mut() {
            caller.pc = frame.return_to;
        }
        Ok(None)
    }

    fn unwind(
        &mut self,
        floor: usize,
        exception: ManagedException,
        object: Option<Word>,
    ) -> EngineResult<()> {
        self.reexecute = false;
        let object = match object {
            Some(object) => object,
            None => self
                .engine
                .heap()
                .new_exception(exception.kind)
                .map_err(EngineError::Uncaught)?,
        };
        while self.frames.len() > floor {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            if let Some(handler) = handler_for(&frame.code.regions, frame.pc, exception.kind) {
                tracing::trace!(
                    method = %frame.code.name,
                    pc = frame.pc,
                    handler,
                    kind = exception.kind.type_name(),
                    "exception caught"
                );
                frame.pc = handler;
                self.sp = frame.stack_base;
                return self.push(object).map_err(|_| {
                    EngineError::Uncaught(ManagedException::new(ExceptionKind::StackOverflow))
                });
            }
            if let Some(frame) = self.frames.pop() {
                self.sp = frame.base;
            }
        }
        Err(EngineError::Uncaught(exception))
    }

    fn execute(
        &mut self,
        code: &Arc<MethodCode>,
        insn: &Insn,
        base: usize,
        floor: usize,
    ) -> Result<Control, Raise> {
        use Opcode::*;
        let offset = insn.operand.int();
        match insn.opcode {
            Nop => {}
            UnrollMethod => self.unroll_trigger(code, insn.next_pc()),

            Iload0 | Iload1 | Iload2 | Iload3 | Iload => {
                let value = self.local(base, local_index(insn))?;
                self.push(value as u32 as Word)?;
            }
            Pload0 | Pload1 | Pload2 | Pload3 | Pload => {
                let value = self.local(base, local_index(insn))?;
                self.push(value)?;
            }
            Istore0 | Istore1 | Istore2 | Istore3 | Istore => {
                let value = self.pop()?;
                self.set_local(base, local_index(insn), value as u32 as Word)?;
            }
            Pstore0 | Pstore1 | Pstore2 | Pstore3 | Pstore => {
                let value = self.pop()?;
                self.set_local(base, local_index(insn), value)?;
            }
            Waddr => {
                let index = base + local_index(insn);
                if index >= self.stack.len() {
                    return Err(self.invalid("local out of range"));
                }
                let addr = self.stack.as_ptr().wrapping_add(index) as usize as Word;
                self.push(addr)?;
            }

            Bread => self.read(Mem::Sbyte, 0)?,
            Ubread => self.read(Mem::Byte, 0)?,
            Sread => self.read(Mem::Short, 0)?,
            Usread => self.read(Mem::Ushort, 0)?,
            Iread => self.read(Mem::Word32, 0)?,
            Dread | Pread => self.read(Mem::Native, 0)?,
            Bwrite => self.write(Mem::Byte, 0)?,
            Swrite => self.write(Mem::Short, 0)?,
            Iwrite => self.write(Mem::Word32, 0)?,
            Dwrite | Pwrite => self.write(Mem::Native, 0)?,
            BwriteR => self.write_reversed(Mem::Byte)?,
            SwriteR => self.write_reversed(Mem::Short)?,
            IwriteR => self.write_reversed(Mem::Word32)?,
            DwriteR | PwriteR => self.write_reversed(Mem::Native)?,

            Dup => {
                let value = self.peek()?;
                self.push(value)?;
            }
            Dup2 => {
                let (a, b) = self.pop2()?;
                for value in [a, b, a, b] {
                    self.push(value)?;
                }
            }
            Pop => {
                self.pop()?;
            }
            Pop2 => {
                self.pop2()?;
            }

            Iadd => self.binary_int(|a, b| Ok(a.wrapping_add(b)))?,
            Isub => self.binary_int(|a, b| Ok(a.wrapping_sub(b)))?,
            Imul => self.binary_int(|a, b| Ok(a.wrapping_mul(b)))?,
            Idiv | Irem => {
                let remainder = insn.opcode == Irem;
                self.binary_int(|a, b| {
                    if b == 0 {
                        return Err(ExceptionKind::DivideByZero.into());
                    }
                    if a == i32::MIN && b == -1 {
                        return Err(ExceptionKind::Arithmetic.into());
                    }
                    Ok(if remainder { a % b } else { a / b })
                })?
            }
            IdivUn | IremUn => {
                let remainder = insn.opcode == IremUn;
                self.binary_int(|a, b| {
                    let (a, b) = (a as u32, b as u32);
                    if b == 0 {
                        return Err(ExceptionKind::DivideByZero.into());
                    }
                    Ok((if remainder { a % b } else { a / b }) as i32)
                })?
            }
            Ineg => self.unary(|value| word(int(value).wrapping_neg()))?,
            Inot => self.unary(|value| word(!int(value)))?,
            Iand => self.binary_int(|a, b| Ok(a & b))?,
            Ior => self.binary_int(|a, b| Ok(a | b))?,
            Ixor => self.binary_int(|a, b| Ok(a ^ b))?,
            Ishl => self.binary_int(|a, b| Ok(a.wrapping_shl(b as u32)))?,
            Ishr => self.binary_int(|a, b| Ok(a.wrapping_shr(b as u32)))?,
            IshrUn => self.binary_int(|a, b| Ok((a as u32).wrapping_shr(b as u32) as i32))?,

            Ladd => self.binary_long(|a, b| Ok(a.wrapping_add(b)))?,
            Lsub => self.binary_long(|a, b| Ok(a.wrapping_sub(b)))?,
            Lmul => self.binary_long(|a, b| Ok(a.wrapping_mul(b)))?,
            Ldiv | Lrem => {
                let remainder = insn.opcode == Lrem;
                self.binary_long(|a, b| {
                    if b == 0 {
                        return Err(ExceptionKind::DivideByZero.into());
                    }
                    if a == i64::MIN && b == -1 {
                        return Err(ExceptionKind::Arithmetic.into());
                    }
                    Ok(if remainder { a % b } else { a / b })
                })?
            }
            LdivUn | LremUn => {
                let remainder = insn.opcode == LremUn;
                self.binary_long(|a, b| {
                    let (a, b) = (a as u64, b as u64);
                    if b == 0 {
                        return Err(ExceptionKind::DivideByZero.into());
                    }
                    Ok((if remainder { a % b } else { a / b }) as i64)
                })?
            }
            Lneg => self.unary(|value| (value as i64).wrapping_neg() as Word)?,
            Lnot => self.unary(|value| !value)?,
            Land => self.binary_long(|a, b| Ok(a & b))?,
            Lor => self.binary_long(|a, b| Ok(a | b))?,
            Lxor => self.binary_long(|a, b| Ok(a ^ b))?,
            Lshl | Lshr | LshrUn => {
                let (value, count) = self.pop2()?;
                let count = count as u32;
                let result = match insn.opcode {
                    Lshl => value.wrapping_shl(count),
                    Lshr => (value as i64).wrapping_shr(count) as Word,
                    _ => value.wrapping_shr(count),
                };
                self.push(result)?;
            }

            Fadd => self.binary_float(|a, b| a + b)?,
            Fsub => self.binary_float(|a, b| a - b)?,
            Fmul => self.binary_float(|a, b| a * b)?,
            Fdiv => self.binary_float(|a, b| a / b)?,
            Frem => self.binary_float(|a, b| a % b)?,
            Fneg => self.unary(|value| (-float(value)).to_bits())?,

            I2b => self.unary(|value| word(value as i8 as i32))?,
            I2ub => self.unary(|value| value as u8 as Word)?,
            I2s => self.unary(|value| word(value as i16 as i32))?,
            I2us => self.unary(|value| value as u16 as Word)?,
            I2l => self.unary(|value| int(value) as i64 as Word)?,
            Iu2l => self.unary(|value| value as u32 as Word)?,
            I2f => self.unary(|value| (int(value) as f64).to_bits())?,
            Iu2f => self.unary(|value| (value as u32 as f64).to_bits())?,
            L2i => self.unary(|value| value as u32 as Word)?,
            L2f => self.unary(|value| (value as i64 as f64).to_bits())?,
            Lu2f => self.unary(|value| (value as f64).to_bits())?,
            F2i => self.unary(|value| word(float(value) as i32))?,
            F2iu => self.unary(|value| float(value) as u32 as Word)?,
            F2l => self.unary(|value| float(value) as i64 as Word)?,
            F2lu => self.unary(|value| float(value) as u64)?,
            F2f => self.unary(|value| (float(value) as f32 as f64).to_bits())?,
            F2d => {}

            PaddOffset => {
                let ptr = self.pop()?;
                self.push(ptr.wrapping_add(offset as u8 as Word))?;
            }
            PaddI4 => {
                let (ptr, offset) = self.pop2()?;
                self.push(ptr.wrapping_add(int(offset) as i64 as Word))?;
            }
            PaddI4R => {
                let (offset, ptr) = self.pop2()?;
                self.push(ptr.wrapping_add(int(offset) as i64 as Word))?;
            }
            Psub => {
                let (a, b) = self.pop2()?;
                self.push(a.wrapping_sub(b))?;
            }
            PsubI4 => {
                let (ptr, offset) = self.pop2()?;
                self.push(ptr.wrapping_sub(int(offset) as i64 as Word))?;
            }
            Cknull => {
                if self.peek()? == 0 {
                    return Err(ExceptionKind::NullReference.into());
                }
            }

            Ldnull => self.push(0)?,
            LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 | LdcI4S | LdcI4 => {
                let value = insn.opcode.implied_constant().unwrap_or(offset as i32);
                self.push(word(value))?;
            }
            LdcI8 => self.push(offset as Word)?,
            LdcR4 | LdcR8 => {
                let value = match insn.operand {
                    Operand::Float(value) => value,
                    _ => 0.0,
                };
                self.push(value.to_bits())?;
            }

            Br => return Ok(Control::Jump(insn.operand.target())),
            Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn | BrPeq | BrPne => {
                let (a, b) = self.pop2()?;
                let taken = match insn.opcode {
                    BrPeq => a == b,
                    BrPne => a != b,
                    opcode => int_branch_taken(opcode, a, b),
                };
                if taken {
                    return Ok(Control::Jump(insn.operand.target()));
                }
            }
            Brtrue | Brfalse | Brnull | Brnonnull => {
                let value = self.pop()?;
                let zero = matches!(insn.opcode, Brfalse | Brnull);
                if (value == 0) == zero {
                    return Ok(Control::Jump(insn.operand.target()));
                }
            }
            Switch => {
                let index = self.pop()? as u32;
                let count = match insn.operand {
                    Operand::Switch { count, .. } => count,
                    _ => 0,
                };
                let target = if index < count {
                    code.view()
                        .switch_target(insn, index)
                        .map_err(|err| self.invalid(err.to_string()))?
                } else {
                    insn.operand.target()
                };
                return Ok(Control::Jump(target));
            }

            BreadElem => self.read_elem(Mem::Sbyte)?,
            UbreadElem => self.read_elem(Mem::Byte)?,
            SreadElem => self.read_elem(Mem::Short)?,
            UsreadElem => self.read_elem(Mem::Ushort)?,
            IreadElem => self.read_elem(Mem::Word32)?,
            PreadElem | LreadElem | DreadElem => self.read_elem(Mem::Native)?,
            BwriteElem => self.write_elem(Mem::Byte)?,
            SwriteElem => self.write_elem(Mem::Short)?,
            IwriteElem => self.write_elem(Mem::Word32)?,
            PwriteElem | LwriteElem | DwriteElem => self.write_elem(Mem::Native)?,
            ElemAddrShiftI4 | ElemAddrMulI4 => {
                let (array, index) = self.pop2()?;
                let size = match insn.opcode {
                    ElemAddrShiftI4 => 1 << (offset as u32 & 31),
                    _ => offset as u32 as Word,
                };
                self.push(sized_element_address(array, index, size)?)?;
            }
            ArrayLen => {
                let array = self.pop()?;
                if array == 0 {
                    return Err(ExceptionKind::NullReference.into());
                }
                // SAFETY: non-null array references point at an array header.
                let length = unsafe { read_raw::<u32>(array + ARRAY_LENGTH_OFFSET as Word) };
                self.push(length as Word)?;
            }

            BreadField => self.read(Mem::Sbyte, offset)?,
            UbreadField => self.read(Mem::Byte, offset)?,
            SreadField => self.read(Mem::Short, offset)?,
            UsreadField => self.read(Mem::Ushort, offset)?,
            IreadField => self.read(Mem::Word32, offset)?,
            PreadField => self.read(Mem::Native, offset)?,
            BwriteField => self.write(Mem::Byte, offset)?,
            SwriteField => self.write(Mem::Short, offset)?,
            IwriteField => self.write(Mem::Word32, offset)?,
            PwriteField => self.write(Mem::Native, offset)?,
            IreadThis => self.read_this(base, Mem::Word32, offset)?,
            PreadThis => self.read_this(base, Mem::Native, offset)?,

            Call | CallCtor => {
                let id = MethodId(offset as u32);
                self.call(id, insn.opcode == CallCtor, insn.next_pc())?;
                return Ok(Control::Entered);
            }
            CallNative | CallNativeVoid | CallNativeRaw | CallNativeVoidRaw => {
                let (index, words) = match insn.operand {
                    Operand::Pair(index, words) => (index, words as usize),
                    _ => (u32::MAX, 0),
                };
                let thunk = self
                    .engine
                    .thunk(index)
                    .ok_or_else(|| self.invalid(format!("no thunk {index}")))?;
                let args = self
                    .stack
                    .get(base..base + words)
                    .ok_or_else(|| self.invalid("native call arguments out of range"))?;
                let result = thunk.invoke(self.engine.heap(), args)?;
                if matches!(insn.opcode, CallNative | CallNativeRaw) {
                    self.push(result)?;
                }
            }
            Return => return self.ret(0, floor).map(Control::Returned),
            Return1 => return self.ret(1, floor).map(Control::Returned),
            Return2 => return self.ret(2, floor).map(Control::Returned),
            ReturnN => return self.ret(offset as usize, floor).map(Control::Returned),
            New => {
                let size = self.instance_size(TypeId(offset as u32))?;
                let object = self.engine.heap().new_object(size)?;
                self.push(object)?;
            }

            Icmp => {
                let (a, b) = self.pop2()?;
                self.push(word(three_way(int(a), int(b))))?;
            }
            IcmpUn => {
                let (a, b) = self.pop2()?;
                self.push(word(three_way(a as u32, b as u32)))?;
            }
            Lcmp => {
                let (a, b) = self.pop2()?;
                self.push(word(three_way(a as i64, b as i64)))?;
            }
            LcmpUn | Pcmp => {
                let (a, b) = self.pop2()?;
                self.push(word(three_way(a, b)))?;
            }
            Fcmpl | Fcmpg => {
                let (a, b) = self.pop2()?;
                let nan = if insn.opcode == Fcmpl { -1 } else { 1 };
                self.push(word(float_compare(float(a), float(b), nan)))?;
            }
            Seteq | Setne | Setlt | Setle | Setgt | Setge => {
                let value = int(self.pop()?);
                let set = match insn.opcode {
                    Seteq => value == 0,
                    Setne => value != 0,
                    Setlt => value < 0,
                    Setle => value <= 0,
                    Setgt => value > 0,
                    _ => value >= 0,
                };
                self.push(Word::from(set))?;
            }

            Get2d => {
                let j = self.pop()?;
                let (array, i) = self.pop2()?;
                self.push(element_address_2d(array, i, j)?)?;
            }
            Set2d => self.set2d(offset as usize)?,

            Throw => {
                let object = self.pop()?;
                if object == 0 {
                    return Err(ExceptionKind::NullReference.into());
                }
                // SAFETY: thrown references are exception objects.
                let kind = unsafe { exception_kind(object) };
                return Err(Raise::Thrown(object, ManagedException::new(kind)));
            }

            Wide | Prefix => return Err(self.invalid("escape byte decoded as an instruction")),
        }
        Ok(Control::Next)
    }
}
