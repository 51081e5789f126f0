mod common;

use common::{arg, engine, int_result, interpreted_config, run_agreeing, uncaught, unrolled_config};
use cvm::converter::InternalCalls;
use cvm::heap::{Heap, read_raw};
use cvm::{Engine, EngineConfig, ExceptionKind, ManagedException, Word, assemble_image};

#[test]
fn recursive_calls_return_through_frames() {
    let source = "
        .method fib(i32) -> i32
            iload_0
            ldc_i4_2
            bge recurse
            iload_0
            return_1
        recurse:
            iload_0
            ldc_i4_1
            isub
            call fib
            iload_0
            ldc_i4_2
            isub
            call fib
            iadd
            return_1
    ";
    assert_eq!(int_result(run_agreeing(source, "fib", &[arg(15)])), 610);
    assert_eq!(int_result(run_agreeing(source, "fib", &[arg(1)])), 1);
}

#[test]
fn bytecode_constructors_receive_a_fresh_instance() {
    let source = "
        .type Pair 8
        .method Pair::.ctor(i32, i32) ctor
            pload_0
            iload_1
            iwrite_field 0
            pload_0
            iload_2
            iwrite_field 4
            return
        .method Pair::product() -> i32 this
            iread_this 0
            iread_this 4
            imul
            return_1
        .method main() -> i32
            ldc_i4_6
            ldc_i4_7
            call_ctor Pair::.ctor
            call Pair::product
            return_1
    ";
    assert_eq!(int_result(run_agreeing(source, "main", &[])), 42);
}

fn new_boxed(heap: &Heap, args: &[Word]) -> Result<Word, ManagedException> {
    let object = heap.new_object(8)?;
    // SAFETY: freshly allocated eight-byte object.
    unsafe { cvm::heap::write_raw::<u32>(object, args[0] as u32 * 10) };
    Ok(object)
}

#[test]
fn external_constructors_allocate_their_own_instance() {
    let source = "
        .type Boxed 8
        .internal Boxed::.ctor(i32) ctor
        .method main() -> i32
            ldc_i4_4
            call_ctor Boxed::.ctor
            iread_field 0
            return_1
    ";
    let image = assemble_image("boxed", source).expect("program should assemble");
    let mut internals = InternalCalls::runtime();
    internals.register_ctor("Boxed::.ctor", new_boxed);
    let engine = Engine::with_internals(image, interpreted_config(), internals);
    assert_eq!(int_result(engine.run_main()), 40);
}

#[test]
fn runtime_allocates_arrays() {
    let source = "
        .internal Runtime::NewArray(i32, i32) -> ptr
        .method make(i32) -> ptr
            ldc_i4_4
            iload_0
            call Runtime::NewArray
            return_1
    ";
    let engine = engine(source, interpreted_config());
    let values = engine.run("make", &[arg(6)]).expect("make should return");
    // SAFETY: the engine heap keeps the array alive as long as `engine`.
    let length = unsafe { read_raw::<i32>(values[0]) };
    assert_eq!(length, 6);

    let exception = uncaught(engine.run("make", &[arg(-1)]));
    assert_eq!(exception.kind, ExceptionKind::Arithmetic);
}

#[test]
fn thrown_objects_unwind_to_matching_handlers() {
    let source = "
        .type Failure 8
        .method fail(i32)
            iload_0
            brfalse quiet
            new Failure
            throw
        quiet:
            return
        .method outer(i32) -> i32
        try:
            iload_0
            call fail
            ldc_i4_1
            return_1
        handler:
            pop
            ldc_i4_2
            return_1
        .catch try handler handler User
    ";
    assert_eq!(int_result(run_agreeing(source, "outer", &[arg(0)])), 1);
    assert_eq!(int_result(run_agreeing(source, "outer", &[arg(1)])), 2);

    let exception = uncaught(engine(source, interpreted_config()).run("fail", &[arg(1)]));
    assert_eq!(exception.kind, ExceptionKind::User);
}

#[test]
fn rethrown_exceptions_keep_their_kind() {
    let source = "
        .method inner() -> i32
        try:
            ldc_i4_1
            ldc_i4_0
            idiv
            return_1
        handler:
            throw
        .catch try handler handler
        .method outer() -> i32
        try:
            call inner
            return_1
        handler:
            pop
            ldc_i4 99
            return_1
        .catch try handler handler DivideByZero
    ";
    assert_eq!(int_result(run_agreeing(source, "outer", &[])), 99);
    assert_eq!(
        uncaught(engine(source, unrolled_config()).run("inner", &[])).kind,
        ExceptionKind::DivideByZero
    );
}

#[test]
fn throwing_null_raises_null_reference() {
    let source = "
        .method main()
            ldnull
            throw
    ";
    let exception = uncaught(engine(source, interpreted_config()).run_main());
    assert_eq!(exception.kind, ExceptionKind::NullReference);
}

#[test]
fn switch_dispatches_cases_and_default() {
    let source = "
        .method pick(i32) -> i32
            iload_0
            switch zero, one, two, other
        zero:
            ldc_i4 10
            return_1
        one:
            ldc_i4 11
            return_1
        two:
            ldc_i4 12
            return_1
        other:
            ldc_i4_m1
            return_1
    ";
    let expected = [(0, 10), (1, 11), (2, 12), (3, -1), (-1, -1), (1000, -1)];
    for (input, output) in expected {
        assert_eq!(int_result(run_agreeing(source, "pick", &[arg(input)])), output);
    }
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let source = "
        .method down(i32) -> i32
            iload_0
            ldc_i4_1
            iadd
            call down
            return_1
    ";
    let config = EngineConfig {
        max_call_depth: 256,
        ..interpreted_config()
    };
    let exception = uncaught(engine(source, config).run("down", &[arg(0)]));
    assert_eq!(exception.kind, ExceptionKind::StackOverflow);
}

#[test]
fn float_conversions_and_nan_compares() {
    let source = "
        .method convert(i32) -> i32
            iload_0
            i2f
            ldc_r8 0.5
            fadd
            ldc_r8 3.0
            fmul
            f2i
            return_1
        .method nan_less() -> i32
            ldc_r8 0.0
            ldc_r8 0.0
            fdiv
            ldc_r8 1.0
            fcmpl
            return_1
        .method nan_greater() -> i32
            ldc_r8 0.0
            ldc_r8 0.0
            fdiv
            ldc_r8 1.0
            fcmpg
            return_1
    ";
    assert_eq!(int_result(run_agreeing(source, "convert", &[arg(4)])), 13);
    assert_eq!(int_result(run_agreeing(source, "convert", &[arg(-4)])), -10);
    assert_eq!(int_result(run_agreeing(source, "nan_less", &[])), -1);
    assert_eq!(int_result(run_agreeing(source, "nan_greater", &[])), 1);
}

#[test]
fn two_word_returns_are_returned_in_order() {
    let source = "
        .method pair(i32) -> i64
            iload_0
            iload_0
            ldc_i4_1
            iadd
            return_2
    ";
    let engine = engine(source, interpreted_config());
    let values = engine.run("pair", &[arg(8)]).expect("pair should return");
    assert_eq!(values, vec![8, 9]);
}

#[test]
fn argument_count_is_checked_at_entry() {
    let source = "
        .method one(i32) -> i32
            iload_0
            return_1
    ";
    let engine = engine(source, interpreted_config());
    assert!(matches!(
        engine.run("one", &[]),
        Err(cvm::EngineError::InvalidProgram { .. })
    ));
}
