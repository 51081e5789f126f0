mod common;

use common::{
    arg, engine, int_result, interpreted_config, native_unroll_supported, run_both, uncaught,
    unrolled_config,
};
use cvm::{ExceptionKind, ManagedException, Word};

fn fault(source: &str, entry: &str, args: &[Word]) -> ManagedException {
    let both = run_both(source, entry, args);
    let interpreted = uncaught(both.interpreted);
    let unrolled = uncaught(both.unrolled);
    assert_eq!(interpreted, unrolled, "{entry} raised differently once unrolled");
    interpreted
}

const DIVISION: &str = "
    .method div(i32, i32) -> i32
        iload_0
        ldc_i4_1
        iadd
        iload_1
        idiv
        return_1
    .method rem(i32, i32) -> i32
        iload_0
        ldc_i4_1
        iadd
        iload_1
        irem
        return_1
    .method quotient(i64, i64) -> i64
        pload_0
        pload_1
        ldiv
        return_1
";

#[test]
fn division_by_zero_raises_in_both_modes() {
    for entry in ["div", "rem"] {
        let exception = fault(DIVISION, entry, &[arg(41), arg(0)]);
        assert_eq!(exception.kind, ExceptionKind::DivideByZero);
        assert_eq!(exception.message, ExceptionKind::DivideByZero.default_message());
    }
    let exception = fault(DIVISION, "quotient", &[5, 0]);
    assert_eq!(exception.kind, ExceptionKind::DivideByZero);
}

#[test]
fn minimum_divided_by_minus_one_is_arithmetic() {
    // the body adds one first
    let min_minus_one = arg(i32::MAX);
    for entry in ["div", "rem"] {
        let exception = fault(DIVISION, entry, &[min_minus_one, arg(-1)]);
        assert_eq!(exception.kind, ExceptionKind::Arithmetic, "{entry}");
    }
    let exception = fault(DIVISION, "quotient", &[i64::MIN as Word, u64::MAX]);
    assert_eq!(exception.kind, ExceptionKind::Arithmetic);
}

#[test]
fn ordinary_division_still_succeeds() {
    let both = run_both(DIVISION, "div", &[arg(-8), arg(2)]);
    assert_eq!(int_result(both.interpreted), -7 / 2);
    assert_eq!(int_result(both.unrolled), -7 / 2);
    let both = run_both(DIVISION, "rem", &[arg(-8), arg(2)]);
    assert_eq!(int_result(both.unrolled), -7 % 2);
}

#[test]
fn null_field_access_raises_null_reference() {
    let source = "
        .method read(ptr) -> i32
            ldc_i4_1
            pload_0
            iread_field 4
            iadd
            return_1
        .method write(ptr) -> i32
            pload_0
            ldc_i4_5
            iwrite_field 8
            ldc_i4_0
            return_1
    ";
    for entry in ["read", "write"] {
        let exception = fault(source, entry, &[0]);
        assert_eq!(exception.kind, ExceptionKind::NullReference, "{entry}");
    }
}

#[test]
fn out_of_range_store_raises_index_out_of_range() {
    let source = "
        .internal Runtime::NewArray(i32, i32) -> ptr
        .method store(i32) -> i32 locals 1
            ldc_i4_4
            ldc_i4_3
            call Runtime::NewArray
            pstore_1
            pload_1
            iload_0
            ldc_i4_1
            iwrite_elem
            pload_1
            iload_0
            iread_elem
            return_1
    ";
    assert_eq!(fault(source, "store", &[arg(5)]).kind, ExceptionKind::IndexOutOfRange);
    assert_eq!(fault(source, "store", &[arg(3)]).kind, ExceptionKind::IndexOutOfRange);
    assert_eq!(fault(source, "store", &[arg(-1)]).kind, ExceptionKind::IndexOutOfRange);

    let both = run_both(source, "store", &[arg(2)]);
    assert_eq!(int_result(both.interpreted), 1);
    assert_eq!(int_result(both.unrolled), 1);
}

#[test]
fn null_array_raises_null_reference_before_bounds() {
    let source = "
        .method load(ptr, i32) -> i32
            pload_0
            iload_1
            iread_elem
            return_1
        .method length(ptr) -> i32
            pload_0
            array_len
            return_1
    ";
    assert_eq!(fault(source, "load", &[0, arg(99)]).kind, ExceptionKind::NullReference);
    assert_eq!(fault(source, "length", &[0]).kind, ExceptionKind::NullReference);
}

#[test]
fn each_dimension_of_a_2d_array_is_checked() {
    let source = "
        .internal Runtime::NewArray2D(i32, i32, i32) -> ptr
        .method peek(i32, i32) -> i32
            ldc_i4_4
            ldc_i4_4
            ldc_i4_5
            call Runtime::NewArray2D
            iload_0
            iload_1
            get2d
            iread
            return_1
        .method poke(i32, i32) -> i32
            ldc_i4_4
            ldc_i4_4
            ldc_i4_5
            call Runtime::NewArray2D
            iload_0
            iload_1
            ldc_i4_1
            set2d 1
            iwrite
            ldc_i4_0
            return_1
    ";
    for entry in ["peek", "poke"] {
        for (i, j) in [(4, 0), (0, 5), (-1, 0), (0, -1), (4, 5)] {
            assert_eq!(
                fault(source, entry, &[arg(i), arg(j)]).kind,
                ExceptionKind::IndexOutOfRange,
                "{entry}({i}, {j})"
            );
        }
        let both = run_both(source, entry, &[arg(3), arg(4)]);
        assert_eq!(int_result(both.interpreted), 0);
        assert_eq!(int_result(both.unrolled), 0);
    }
}

#[test]
fn this_check_is_repeated_after_its_local_is_overwritten() {
    let source = "
        .type Node 8
        .method Node::twice() -> i32 this
            iread_this 0
            pop
            waddr 0
            ldnull
            pwrite
            iread_this 4
            return_1
    ";
    let exception_for = |config| {
        let engine = engine(source, config);
        let node = engine.heap().new_object(8).expect("object");
        let id = engine.image().find_method("Node::twice").expect("method");
        uncaught(engine.thread().invoke(id, &[node]))
    };
    let interpreted = exception_for(interpreted_config());
    let unrolled = exception_for(unrolled_config());
    assert_eq!(interpreted.kind, ExceptionKind::NullReference);
    assert_eq!(interpreted, unrolled);
}

#[test]
fn address_of_this_taken_later_in_a_loop_still_forces_checks() {
    let source = "
        .type Node 8
        .method Node::clear() -> i32 this locals 2
            waddr 2
            pstore_1
        top:
            iread_this 0
            pop
            pload_1
            ldnull
            pwrite
            iread_this 4
            pop
            waddr 0
            pstore_1
            br top
    ";
    let exception_for = |config| {
        let engine = engine(source, config);
        let node = engine.heap().new_object(8).expect("object");
        let id = engine.image().find_method("Node::clear").expect("method");
        uncaught(engine.thread().invoke(id, &[node]))
    };
    let interpreted = exception_for(interpreted_config());
    let unrolled = exception_for(unrolled_config());
    assert_eq!(interpreted.kind, ExceptionKind::NullReference);
    assert_eq!(interpreted, unrolled);
}

#[test]
fn faults_inside_unrolled_code_reach_handlers() {
    let source = "
        .method guarded(i32) -> i32 locals 1
            ldc_i4_0
            istore_1
        try:
            ldc_i4 100
            iload_0
            idiv
            istore_1
            iload_1
            return_1
        handler:
            pop
            ldc_i4_m1
            return_1
        .catch try handler handler DivideByZero
    ";
    let both = run_both(source, "guarded", &[arg(0)]);
    assert_eq!(int_result(both.interpreted), -1);
    assert_eq!(int_result(both.unrolled), -1);
    if native_unroll_supported() {
        assert!(both.native_entries > 0);
    }

    let both = run_both(source, "guarded", &[arg(7)]);
    assert_eq!(int_result(both.unrolled), 14);
}

#[test]
fn handlers_only_catch_their_kind() {
    let source = "
        .type Cell 8
        .method narrow(i32) -> i32 locals 1
            ldnull
            pstore_1
            iload_0
            brfalse try
            new Cell
            pstore_1
        try:
            pload_1
            iread_field 0
            ldc_i4_0
            idiv
            return_1
        handler:
            pop
            ldc_i4_2
            return_1
        .catch try handler handler NullReference
    ";
    let both = run_both(source, "narrow", &[arg(0)]);
    assert_eq!(int_result(both.interpreted), 2);
    assert_eq!(int_result(both.unrolled), 2);
    assert_eq!(fault(source, "narrow", &[arg(1)]).kind, ExceptionKind::DivideByZero);
}
