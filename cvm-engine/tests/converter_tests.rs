mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{arg, engine, int_result, interpreted_config, uncaught, unrolled_config};
use cvm::converter::InternalCalls;
use cvm::heap::Heap;
use cvm::image::Layout;
use cvm::{
    Engine, EngineConfig, ExceptionKind, Image, ManagedException, MethodDef, TypeDef, ValueType,
    Word, assemble_image,
};

static CCTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

fn bump(_heap: &Heap, _args: &[Word]) -> Result<Word, ManagedException> {
    CCTOR_RUNS.fetch_add(1, Ordering::SeqCst);
    Ok(0)
}

#[test]
fn concurrent_conversion_publishes_one_code_object() {
    let source = "
        .type Counter 0
        .cctor Counter Counter::.cctor
        .internal Hooks::bump()
        .method Counter::.cctor()
            call Hooks::bump
            return
        .method Counter::get() -> i32
            ldc_i4 42
            return_1
    ";
    for config in [interpreted_config(), unrolled_config()] {
        CCTOR_RUNS.store(0, Ordering::SeqCst);
        let image = assemble_image("cctor", source).expect("program should assemble");
        let mut internals = InternalCalls::runtime();
        internals.register("Hooks::bump", bump);
        let engine = Engine::with_internals(image, config, internals);
        let get = engine.image().find_method("Counter::get").expect("get");

        let codes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let mut thread = engine.thread();
                        let code = thread.convert(get).expect("conversion should succeed");
                        let result = thread.invoke(get, &[]);
                        (code, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker should not panic"))
                .collect()
        });

        let first = &codes[0].0;
        for (code, result) in &codes {
            assert!(Arc::ptr_eq(first, code), "every thread sees the same code");
            assert_eq!(result.as_deref(), Ok(&[42][..]));
        }
        assert_eq!(CCTOR_RUNS.load(Ordering::SeqCst), 1);
        let published = engine.converted(get).expect("get should be published");
        assert!(Arc::ptr_eq(first, &published));
    }
}

#[test]
fn verification_failure_raises_verification_exception() {
    let source = "
        .method bad() -> i32
            iadd
            return_1
        .method main() -> i32
            call bad
            return_1
    ";
    let engine = engine(source, interpreted_config());
    assert_eq!(uncaught(engine.run("bad", &[])).kind, ExceptionKind::Verification);
    assert_eq!(uncaught(engine.run_main()).kind, ExceptionKind::Verification);
    assert!(engine.converted(engine.image().find_method("bad").expect("bad")).is_none());
}

#[test]
fn missing_internal_call_is_catchable() {
    let source = "
        .internal Nowhere::missing() -> i32
        .method main() -> i32
        try:
            call Nowhere::missing
            return_1
        handler:
            pop
            ldc_i4_7
            return_1
        .catch try handler handler EntryPointNotFound
        .method direct() -> i32
            call Nowhere::missing
            return_1
    ";
    let engine = engine(source, unrolled_config());
    assert_eq!(int_result(engine.run_main()), 7);
    assert_eq!(uncaught(engine.run("direct", &[])).kind, ExceptionKind::EntryPointNotFound);
}

#[test]
fn vararg_methods_are_not_implemented() {
    let source = "
        .method spread(i32) -> i32 vararg
            iload_0
            return_1
    ";
    let engine = engine(source, interpreted_config());
    let exception = uncaught(engine.run("spread", &[arg(1)]));
    assert_eq!(exception.kind, ExceptionKind::NotImplemented);
}

#[test]
fn unresolved_layout_fails_type_initialization() {
    let mut image = Image::new("layout");
    let broken = image.add_type(TypeDef {
        name: "Broken".to_string(),
        layout: Layout::Unresolved("field 'next' of unknown type".to_string()),
        cctor: None,
    });
    let mut body = cvm::CodeBuilder::new();
    body.op(cvm::Opcode::LdcI41);
    body.op(cvm::Opcode::Return1);
    let code = body.finish().expect("body should assemble");
    image.add_method(MethodDef::bytecode(
        "value",
        broken,
        Vec::new(),
        Some(ValueType::I32),
        0,
        code,
    ));
    let engine = Engine::new(image, interpreted_config());
    let exception = uncaught(engine.run("Broken::value", &[]));
    assert_eq!(exception.kind, ExceptionKind::TypeInitialization);
}

#[test]
fn failing_static_constructor_stays_failed() {
    let source = "
        .type Config 0
        .cctor Config Config::.cctor
        .method Config::.cctor() locals 1
            ldc_i4_1
            ldc_i4_0
            idiv
            istore_0
            return
        .method Config::get() -> i32
            ldc_i4_3
            return_1
    ";
    let engine = engine(source, interpreted_config());
    for _ in 0..2 {
        let exception = uncaught(engine.run("Config::get", &[]));
        assert_eq!(exception.kind, ExceptionKind::TypeInitialization);
    }
}

#[test]
fn missing_module_raises_dll_not_found_once_loaded() {
    let source = "
        .pinvoke cvm-no-such-module first() -> i32
        .pinvoke cvm-no-such-module second(i32) -> i32
    ";
    let engine = engine(source, interpreted_config());
    let exception = uncaught(engine.run("first", &[]));
    assert_eq!(exception.kind, ExceptionKind::DllNotFound);
    assert_eq!(exception.message, "Unable to load DLL 'cvm-no-such-module'.");
    assert_eq!(engine.modules().len(), 1);

    let exception = uncaught(engine.run("second", &[arg(1)]));
    assert_eq!(exception.kind, ExceptionKind::DllNotFound);
    assert_eq!(engine.modules().len(), 1);
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn pinvoke_calls_into_libc() {
    let source = "
        .pinvoke libc.so.6 abs(i32) -> i32
        .method main(i32) -> i32
            iload_0
            call abs
            ldc_i4_1
            iadd
            return_1
    ";
    for config in [interpreted_config(), unrolled_config()] {
        let engine = engine(source, config);
        assert_eq!(int_result(engine.run("main", &[arg(-41)])), 42);
    }
}

#[test]
fn converted_code_carries_the_engine_encoding() {
    let source = "
        .method main() -> i32 locals 1
            ldc_i4_5
            istore_0
            iload_0
            return_1
    ";
    for config in [interpreted_config(), unrolled_config()] {
        let encoding = config.encoding;
        let engine = engine(source, config);
        let unrolling = engine.unrolling();
        let id = engine.image().find_method("main").expect("main");
        let code = engine.thread().convert(id).expect("main should convert");
        assert_eq!(code.encoding, encoding);
        let first = code
            .view()
            .instructions()
            .expect("converted code should decode")[0]
            .opcode;
        assert_eq!(first == cvm::Opcode::UnrollMethod, unrolling);
        assert_eq!(code.frame_words, 1);
    }
}

#[test]
fn default_config_is_usable() {
    let engine = engine(
        ".method main() -> i32\n ldc_i4_2\n return_1\n",
        EngineConfig::default(),
    );
    assert_eq!(int_result(engine.run_main()), 2);
}
