mod cctor;
mod internal;
mod pinvoke;
mod thunk;
mod verify;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};

pub use cctor::{CctorManager, CctorStatus};
pub use internal::{InternalCalls, InternalFn};
pub use pinvoke::ModuleList;
pub use thunk::{CallClass, MAX_FLOAT_ARGS, MAX_INT_ARGS, Thunk};
pub use verify::{Scope, Verified, VerifyError, verify};

use crate::cache::CodeSlot;
use crate::engine::Engine;
use crate::exception::{ExceptionKind, ManagedException};
use crate::format::{CodeBuilder, CodeView, Encoding, FormatError, reencode};
use crate::image::{
    CallConv, ExceptionRegion, ImplKind, Layout, Method, MethodBody, MethodDef, MethodId,
    PInvokeRecord, TypeId,
};
use crate::interp::Thread;
use crate::opcodes::Opcode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConvertError {
    Verify {
        method: String,
        pc: usize,
        reason: String,
    },
    EntryPoint(String),
    NotImplemented(String),
    OutOfMemory,
    TypeInit(String),
    DllNotFound(String),
}

impl ConvertError {
    pub fn kind(&self) -> ExceptionKind {
        match self {
            ConvertError::Verify { .. } => ExceptionKind::Verification,
            ConvertError::EntryPoint(_) => ExceptionKind::EntryPointNotFound,
            ConvertError::NotImplemented(_) => ExceptionKind::NotImplemented,
            ConvertError::OutOfMemory => ExceptionKind::OutOfMemory,
            ConvertError::TypeInit(_) => ExceptionKind::TypeInitialization,
            ConvertError::DllNotFound(_) => ExceptionKind::DllNotFound,
        }
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::Verify { method, pc, reason } => {
                write!(f, "verification of '{method}' failed at {pc}: {reason}")
            }
            ConvertError::EntryPoint(name) => write!(f, "entry point '{name}' not found"),
            ConvertError::NotImplemented(what) => write!(f, "not implemented: {what}"),
            ConvertError::OutOfMemory => write!(f, "out of memory during conversion"),
            ConvertError::TypeInit(ty) => write!(f, "type '{ty}' failed to initialize"),
            ConvertError::DllNotFound(module) => write!(f, "unable to load module '{module}'"),
        }
    }
}

impl std::error::Error for ConvertError {}

impl From<ConvertError> for ManagedException {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::DllNotFound(module) => ManagedException::dll_not_found(&module),
            other => ManagedException::new(other.kind()),
        }
    }
}

#[derive(Debug)]
pub struct MethodCode {
    pub id: MethodId,
    pub name: String,
    pub owner: TypeId,
    pub encoding: Encoding,
    pub code: Vec<u8>,
    slots: Box<[CodeSlot]>,
    pub labels: Vec<usize>,
    pub regions: Vec<ExceptionRegion>,
    pub args: u32,
    pub frame_words: u32,
    pub max_stack: u32,
    pub alloc_ctor: bool,
    pub(crate) unroll_counter: AtomicU32,
    pub(crate) cctor_ready: AtomicBool,
}

impl MethodCode {
    pub fn view(&self) -> CodeView<'_> {
        CodeView::new(&self.code, self.encoding)
    }

    pub fn slot(&self, pc: usize) -> Option<&CodeSlot> {
        if pc % self.encoding.unit() != 0 {
            return None;
        }
        self.slots.get(pc / self.encoding.unit())
    }

    pub fn unrolled_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_installed()).count()
    }
}

struct Body {
    code: Vec<u8>,
    labels: Vec<usize>,
    regions: Vec<ExceptionRegion>,
    frame_words: u32,
    max_stack: u32,
    args: u32,
    alloc_ctor: bool,
}

fn format_error(method: &str, err: FormatError) -> ConvertError {
    ConvertError::Verify {
        method: method.to_string(),
        pc: 0,
        reason: err.to_string(),
    }
}

pub fn convert(thread: &mut Thread<'_>, id: MethodId) -> Result<Arc<MethodCode>, ConvertError> {
    let engine = thread.engine();
    let method = engine
        .image()
        .method(id)
        .ok_or_else(|| ConvertError::EntryPoint(format!("<method {}>", id.0)))?;
    let code = match method.entry.get() {
        Some(code) => Arc::clone(code),
        None => publish(engine, method)?,
    };
    if !code.cctor_ready.load(Ordering::Acquire) {
        run_cctor(thread, &code)?;
    }
    Ok(code)
}

fn publish(engine: &Engine, method: &Method) -> Result<Arc<MethodCode>, ConvertError> {
    let _guard = engine
        .image()
        .metadata
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(code) = method.entry.get() {
        return Ok(Arc::clone(code));
    }
    let name = engine.image().qualified_name(method.id);
    let body = build(engine, method, &name).inspect_err(|err| {
        tracing::debug!(method = %name, "conversion failed: {err}");
    })?;

    let unit = engine.config().encoding.unit();
    let count = body.code.len() / unit + 1;
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(count)
        .map_err(|_| ConvertError::OutOfMemory)?;
    slots.extend((0..count).map(|_| CodeSlot::new()));

    let has_cctor = engine
        .image()
        .ty(method.def.owner)
        .is_some_and(|ty| ty.cctor.is_some());
    let code = Arc::new(MethodCode {
        id: method.id,
        name: name.clone(),
        owner: method.def.owner,
        encoding: engine.config().encoding,
        code: body.code,
        slots: slots.into_boxed_slice(),
        labels: body.labels,
        regions: body.regions,
        args: body.args,
        frame_words: body.frame_words,
        max_stack: body.max_stack,
        alloc_ctor: body.alloc_ctor,
        unroll_counter: AtomicU32::new(0),
        cctor_ready: AtomicBool::new(!has_cctor),
    });
    tracing::debug!(
        method = %name,
        bytes = code.code.len(),
        max_stack = code.max_stack,
        "converted"
    );
    let _ = method.entry.set(Arc::clone(&code));
    Ok(code)
}

fn run_cctor(thread: &mut Thread<'_>, code: &MethodCode) -> Result<(), ConvertError> {
    let engine = thread.engine();
    let Some(ty) = engine.image().ty(code.owner) else {
        return Err(ConvertError::TypeInit(format!("<type {}>", code.owner.0)));
    };
    let Some(cctor) = ty.cctor else {
        code.cctor_ready.store(true, Ordering::Release);
        return Ok(());
    };
    let status = engine.cctors().run_once(code.owner, || {
        match thread.invoke(cctor, &[]) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(ty = %ty.name, "static constructor failed: {err}");
                false
            }
        }
    });
    match status {
        CctorStatus::Done => {
            code.cctor_ready.store(true, Ordering::Release);
            Ok(())
        }
        CctorStatus::Reentered => Ok(()),
        CctorStatus::Failed => Err(ConvertError::TypeInit(ty.name.clone())),
    }
}

fn build(engine: &Engine, method: &Method, name: &str) -> Result<Body, ConvertError> {
    let def = &method.def;
    if def.call_conv == CallConv::VarArg {
        return Err(ConvertError::NotImplemented(format!("varargs method {name}")));
    }
    let owner = engine
        .image()
        .ty(def.owner)
        .ok_or_else(|| ConvertError::TypeInit(format!("<type {}>", def.owner.0)))?;
    if let Layout::Unresolved(member) = &owner.layout {
        return Err(ConvertError::TypeInit(format!("{} ({member})", owner.name)));
    }
    match &def.body {
        MethodBody::Bytecode {
            code,
            regions,
            locals,
        } => bytecode(engine, def, name, code, regions, *locals),
        MethodBody::External {
            kind,
            internal_call,
            pinvoke,
        } => external(engine, def, name, *kind, *internal_call, pinvoke.as_ref()),
    }
}

fn bytecode(
    engine: &Engine,
    def: &MethodDef,
    name: &str,
    code: &[u8],
    regions: &[ExceptionRegion],
    locals: u32,
) -> Result<Body, ConvertError> {
    let scope = Scope {
        image: engine.image(),
        def,
        locals,
        thunks: engine.thunk_count(),
    };
    let verified = verify(&scope, code, regions).map_err(|err| ConvertError::Verify {
        method: name.to_string(),
        pc: err.pc,
        reason: err.reason,
    })?;

    let prologue: &[Opcode] = if engine.unrolling() {
        &[Opcode::UnrollMethod]
    } else {
        &[]
    };
    let source = CodeView::new(code, Encoding::Bytecode);
    let encoded = reencode(&source, &verified.insns, engine.config().encoding, prologue)
        .map_err(|err| format_error(name, err))?;
    let map = |pc: usize| {
        encoded
            .pc_map
            .get(&pc)
            .copied()
            .ok_or_else(|| format_error(name, FormatError::InvalidTarget { pc, target: pc as i64 }))
    };

    let mut labels = verified
        .labels
        .iter()
        .map(|pc| map(*pc))
        .collect::<Result<Vec<_>, _>>()?;
    labels.sort_unstable();
    labels.dedup();
    let regions = regions
        .iter()
        .map(|region| {
            Ok(ExceptionRegion {
                try_start: map(region.try_start)?,
                try_end: map(region.try_end)?,
                handler: map(region.handler)?,
                catch: region.catch,
            })
        })
        .collect::<Result<Vec<_>, ConvertError>>()?;

    Ok(Body {
        code: encoded.code,
        labels,
        regions,
        frame_words: def.arg_words() + locals,
        max_stack: verified.max_stack,
        args: def.arg_words(),
        alloc_ctor: false,
    })
}

fn external(
    engine: &Engine,
    def: &MethodDef,
    name: &str,
    kind: ImplKind,
    internal_call: bool,
    pinvoke: Option<&PInvokeRecord>,
) -> Result<Body, ConvertError> {
    let (thunk, alloc_ctor) = match kind {
        ImplKind::Runtime => internal(engine, def, name)?,
        ImplKind::Il | ImplKind::OptIl if internal_call => internal(engine, def, name)?,
        ImplKind::Il | ImplKind::OptIl => (bind_pinvoke(engine, def, name, pinvoke)?, false),
        ImplKind::Native => {
            return Err(ConvertError::NotImplemented(format!("native code body of {name}")));
        }
    };
    let raw = thunk.is_raw();
    let index = engine.add_thunk(thunk);

    let args = if alloc_ctor {
        def.params.len() as u32
    } else {
        def.arg_words()
    };
    let returns = alloc_ctor || def.ret.is_some();
    let call = match (raw, returns) {
        (true, true) => Opcode::CallNativeRaw,
        (true, false) => Opcode::CallNativeVoidRaw,
        (false, true) => Opcode::CallNative,
        (false, false) => Opcode::CallNativeVoid,
    };
    let mut builder = CodeBuilder::new();
    builder.ptr2(call, index, args);
    builder.op(if returns {
        Opcode::Return1
    } else {
        Opcode::Return
    });
    let stub = builder.finish().map_err(|err| format_error(name, err))?;
    let source = CodeView::new(&stub, Encoding::Bytecode);
    let insns = source
        .instructions()
        .map_err(|err| format_error(name, err))?;
    let encoded = reencode(&source, &insns, engine.config().encoding, &[])
        .map_err(|err| format_error(name, err))?;

    Ok(Body {
        code: encoded.code,
        labels: Vec::new(),
        regions: Vec::new(),
        frame_words: args,
        max_stack: 1,
        args,
        alloc_ctor,
    })
}

fn internal(engine: &Engine, def: &MethodDef, name: &str) -> Result<(Thunk, bool), ConvertError> {
    let calls = engine.internals();
    if def.is_ctor {
        if let Some(func) = calls.lookup_ctor(name) {
            return Ok((Thunk::internal(name, func), true));
        }
    }
    calls
        .lookup(name)
        .map(|func| (Thunk::internal(name, func), false))
        .ok_or_else(|| ConvertError::EntryPoint(name.to_string()))
}

fn bind_pinvoke(
    engine: &Engine,
    def: &MethodDef,
    name: &str,
    record: Option<&PInvokeRecord>,
) -> Result<Thunk, ConvertError> {
    let record = record.ok_or_else(|| ConvertError::EntryPoint(name.to_string()))?;
    let handle = engine
        .modules()
        .load(&record.module)
        .ok_or_else(|| ConvertError::DllNotFound(record.module.clone()))?;
    let addr = engine
        .modules()
        .resolve(handle, record, &def.name)
        .ok_or_else(|| ConvertError::EntryPoint(name.to_string()))?;
    Thunk::native(name, addr, &def.params, def.ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_its_exception() {
        let cases = [
            (
                ConvertError::Verify {
                    method: "m".into(),
                    pc: 0,
                    reason: "r".into(),
                },
                ExceptionKind::Verification,
            ),
            (ConvertError::EntryPoint("e".into()), ExceptionKind::EntryPointNotFound),
            (ConvertError::NotImplemented("n".into()), ExceptionKind::NotImplemented),
            (ConvertError::OutOfMemory, ExceptionKind::OutOfMemory),
            (ConvertError::TypeInit("t".into()), ExceptionKind::TypeInitialization),
            (ConvertError::DllNotFound("d".into()), ExceptionKind::DllNotFound),
        ];
        for (err, kind) in cases {
            assert_eq!(ManagedException::from(err).kind, kind);
        }
    }

    #[test]
    fn missing_module_name_is_carried() {
        let exception = ManagedException::from(ConvertError::DllNotFound("libgone".into()));
        assert_eq!(exception.message, "Unable to load DLL 'libgone'.");
    }
}
