use cvm::format::{WORD_SIZE, reencode};
use cvm::lengths;
use cvm::opcodes::OperandFormat;
use cvm::{CodeBuilder, CodeView, Encoding, Opcode, assemble, disassemble};

fn every_opcode() -> Vec<u8> {
    let mut builder = CodeBuilder::new();
    let end = builder.new_label();
    for &op in Opcode::ALL {
        match op.format() {
            OperandFormat::None | OperandFormat::PrefixNone => builder.op(op),
            OperandFormat::Byte => builder.byte(op, 100),
            OperandFormat::Word | OperandFormat::PrefixWord => builder.word(op, 12),
            OperandFormat::Long => builder.ldc_i8(-1 << 40),
            OperandFormat::Float => builder.ldc_r4(2.5),
            OperandFormat::Double => builder.ldc_r8(-0.125),
            OperandFormat::Branch => builder.branch(op, end),
            OperandFormat::Ptr => builder.ptr(op, 3),
            OperandFormat::Ptr2 => builder.ptr2(op, 1, 2),
            OperandFormat::WideSmall => builder.local(op, 9),
            OperandFormat::Switch | OperandFormat::Escape => {}
        }
    }
    builder.bind(end);
    builder.op(Opcode::Return);
    builder.finish().expect("every opcode should encode")
}

#[test]
fn length_table_matches_bytecode_encoding() {
    let code = every_opcode();
    let view = CodeView::new(&code, Encoding::Bytecode);
    let insns = view.instructions().expect("bytecode should decode");
    let mut seen = 0;
    for insn in &insns {
        assert_eq!(
            insn.len,
            lengths::length(insn.opcode as u16, Encoding::Bytecode),
            "{} at {}",
            insn.opcode.mnemonic(),
            insn.pc
        );
        seen += 1;
    }
    let skipped = Opcode::ALL
        .iter()
        .filter(|op| matches!(op.format(), OperandFormat::Switch | OperandFormat::Escape))
        .count();
    assert_eq!(seen, Opcode::ALL.len() - skipped + 1);
}

#[test]
fn length_table_matches_threaded_encoding() {
    let code = every_opcode();
    let source = CodeView::new(&code, Encoding::Bytecode);
    let insns = source.instructions().expect("bytecode should decode");
    let threaded = reencode(&source, &insns, Encoding::DirectThreaded, &[Opcode::UnrollMethod])
        .expect("reencode should succeed");
    let view = CodeView::new(&threaded.code, Encoding::DirectThreaded);
    let decoded = view.instructions().expect("threaded code should decode");
    assert_eq!(decoded.len(), insns.len() + 1);
    for (insn, original) in decoded[1..].iter().zip(&insns) {
        assert_eq!(insn.opcode, original.opcode);
        assert_eq!(
            insn.len,
            lengths::length(insn.opcode as u16, Encoding::DirectThreaded) * WORD_SIZE,
            "{}",
            insn.opcode.mnemonic()
        );
        if original.opcode.format() == OperandFormat::Branch {
            assert_eq!(
                threaded.pc_map.get(&original.operand.target()),
                Some(&insn.operand.target())
            );
        } else {
            assert_eq!(insn.operand, original.operand, "{}", insn.opcode.mnemonic());
        }
    }
}

#[test]
fn wide_locals_are_six_bytes() {
    let code = assemble("iload 300\nistore 70000\nreturn").expect("wide locals should assemble");
    let view = CodeView::new(&code, Encoding::Bytecode);
    let insns = view.instructions().expect("decode");
    assert!(insns[0].wide && insns[1].wide);
    assert_eq!(insns[0].len, lengths::WIDE_SMALL_BYTES);
    assert_eq!(insns[1].next_pc(), 2 * lengths::WIDE_SMALL_BYTES);
}

#[test]
fn listings_reassemble_to_the_same_bytes() {
    let text = "
        ldc_i4_s 100
        ldc_i4 -70000
        ldc_i8 1099511627776
        ldc_i8 -9223372036854775808
        padd_offset 200
        elem_addr_shift_i4 3
        elem_addr_mul_i4 12
        ldc_r4 1.5
        ldc_r8 0.1
        iload 4
        pstore 300
    top:
        iload_1
        switch one, top, done
    one:
        set2d 2
        get2d
        iread_field 16
        call_native 3, 2
        brfalse top
    done:
        call 7
        return_1
    ";
    let code = assemble(text).expect("program should assemble");
    let listing = disassemble(&code, Encoding::Bytecode).expect("listing");
    let again = assemble(&cvm::assembler::listing_source(&listing)).expect("listing reassembles");
    assert_eq!(again, code, "listing:\n{listing}");
    assert!(listing.contains("ldc_r8 0.1"), "{listing}");
    assert!(listing.contains("call_native 3, 2"), "{listing}");
}

#[test]
fn integer_operands_cover_the_full_signed_range() {
    let code = assemble("ldc_i8 -9223372036854775808\nldc_i8 0x7fffffffffffffff\nreturn")
        .expect("extreme constants should assemble");
    let insns = CodeView::new(&code, Encoding::Bytecode)
        .instructions()
        .expect("decode");
    assert_eq!(insns[0].operand.int(), i64::MIN);
    assert_eq!(insns[1].operand.int(), i64::MAX);
    assert!(assemble("ldc_i8 -9223372036854775809\nreturn").is_err());
}

#[test]
fn byte_operands_keep_their_unsigned_value() {
    let code = assemble("padd_offset 200\nelem_addr_shift_i4 -1\nreturn").expect("assemble");
    assert_eq!(&code[..4], &[Opcode::PaddOffset as u8, 200, Opcode::ElemAddrShiftI4 as u8, 0xFF]);
    assert!(assemble("padd_offset 256\nreturn").is_err());
}
