use crate::format::Encoding;
use crate::opcodes::{Opcode, OperandFormat};

pub const fn format_length(format: OperandFormat, encoding: Encoding) -> usize {
    match encoding {
        Encoding::Bytecode => match format {
            OperandFormat::None => 1,
            OperandFormat::Byte | OperandFormat::WideSmall => 2,
            OperandFormat::Word
            | OperandFormat::Float
            | OperandFormat::Branch
            | OperandFormat::Ptr => 5,
            OperandFormat::Long | OperandFormat::Double | OperandFormat::Ptr2 => 9,
            OperandFormat::PrefixNone => 2,
            OperandFormat::PrefixWord => 6,
            OperandFormat::Switch | OperandFormat::Escape => 0,
        },
        Encoding::DirectThreaded => match format {
            OperandFormat::None | OperandFormat::PrefixNone => 1,
            OperandFormat::Byte
            | OperandFormat::WideSmall
            | OperandFormat::Word
            | OperandFormat::Float
            | OperandFormat::Branch
            | OperandFormat::Ptr
            | OperandFormat::Long
            | OperandFormat::Double
            | OperandFormat::PrefixWord => 2,
            OperandFormat::Ptr2 => 3,
            OperandFormat::Switch | OperandFormat::Escape => 0,
        },
    }
}

const fn build_table(encoding: Encoding) -> [u8; 512] {
    let mut table = [0u8; 512];
    let mut index = 0;
    while index < Opcode::ALL.len() {
        let op = Opcode::ALL[index];
        table[op as usize] = format_length(op.format(), encoding) as u8;
        index += 1;
    }
    table
}

pub static BYTECODE_LENGTHS: [u8; 512] = build_table(Encoding::Bytecode);

pub static THREADED_LENGTHS: [u8; 512] = build_table(Encoding::DirectThreaded);

pub fn length(opcode: u16, encoding: Encoding) -> usize {
    let table = match encoding {
        Encoding::Bytecode => &BYTECODE_LENGTHS,
        Encoding::DirectThreaded => &THREADED_LENGTHS,
    };
    table.get(opcode as usize).copied().unwrap_or(0) as usize
}

pub const WIDE_SMALL_BYTES: usize = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_report_zero() {
        for encoding in [Encoding::Bytecode, Encoding::DirectThreaded] {
            assert_eq!(length(Opcode::Switch as u16, encoding), 0);
            assert_eq!(length(Opcode::Wide as u16, encoding), 0);
            assert_eq!(length(Opcode::Prefix as u16, encoding), 0);
        }
    }

    #[test]
    fn known_lengths() {
        assert_eq!(length(Opcode::Nop as u16, Encoding::Bytecode), 1);
        assert_eq!(length(Opcode::Iload as u16, Encoding::Bytecode), 2);
        assert_eq!(length(Opcode::LdcI8 as u16, Encoding::Bytecode), 9);
        assert_eq!(length(Opcode::Beq as u16, Encoding::Bytecode), 5);
        assert_eq!(length(Opcode::Set2d as u16, Encoding::Bytecode), 6);
        assert_eq!(length(Opcode::Get2d as u16, Encoding::DirectThreaded), 1);
        assert_eq!(length(Opcode::CallNative as u16, Encoding::DirectThreaded), 3);
        assert_eq!(length(0x1FF, Encoding::Bytecode), 0);
    }
}
