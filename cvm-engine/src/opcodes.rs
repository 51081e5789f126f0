#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandFormat {
    None,
    Byte,
    Word,
    Long,
    Float,
    Double,
    Branch,
    Ptr,
    Ptr2,
    WideSmall,
    Switch,
    Escape,
    PrefixNone,
    PrefixWord,
}

macro_rules! define_opcodes {
    ($($name:ident = $value:literal, $mnemonic:literal, $format:ident;)*) => {
        /// CVM opcodes. Primary opcodes use their byte value; prefixed
        /// opcodes are numbered `0x100 + second byte`.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn parse_mnemonic(text: &str) -> Option<Self> {
                match text {
                    $($mnemonic => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub const fn format(self) -> OperandFormat {
                match self {
                    $(Opcode::$name => OperandFormat::$format,)*
                }
            }
        }
    };
}

define_opcodes! {
    Nop = 0x00, "nop", None;
    Iload0 = 0x01, "iload_0", None;
    Iload1 = 0x02, "iload_1", None;
    Iload2 = 0x03, "iload_2", None;
    Iload3 = 0x04, "iload_3", None;
    Iload = 0x05, "iload", WideSmall;
    Pload0 = 0x06, "pload_0", None;
    Pload1 = 0x07, "pload_1", None;
    Pload2 = 0x08, "pload_2", None;
    Pload3 = 0x09, "pload_3", None;
    Pload = 0x0A, "pload", WideSmall;
    Istore0 = 0x0B, "istore_0", None;
    Istore1 = 0x0C, "istore_1", None;
    Istore2 = 0x0D, "istore_2", None;
    Istore3 = 0x0E, "istore_3", None;
    Istore = 0x0F, "istore", WideSmall;
    Pstore0 = 0x10, "pstore_0", None;
    Pstore1 = 0x11, "pstore_1", None;
    Pstore2 = 0x12, "pstore_2", None;
    Pstore3 = 0x13, "pstore_3", None;
    Pstore = 0x14, "pstore", WideSmall;
    Waddr = 0x17, "waddr", WideSmall;
    Bread = 0x21, "bread", None;
    Ubread = 0x22, "ubread", None;
    Sread = 0x23, "sread", None;
    Usread = 0x24, "usread", None;
    Iread = 0x25, "iread", None;
    Dread = 0x27, "dread", None;
    Pread = 0x28, "pread", None;
    Bwrite = 0x2A, "bwrite", None;
    Swrite = 0x2B, "swrite", None;
    Iwrite = 0x2C, "iwrite", None;
    Dwrite = 0x2E, "dwrite", None;
    Pwrite = 0x2F, "pwrite", None;
    BwriteR = 0x31, "bwrite_r", None;
    SwriteR = 0x32, "swrite_r", None;
    IwriteR = 0x33, "iwrite_r", None;
    DwriteR = 0x35, "dwrite_r", None;
    PwriteR = 0x36, "pwrite_r", None;
    Dup = 0x38, "dup", None;
    Dup2 = 0x39, "dup2", None;
    Pop = 0x3C, "pop", None;
    Pop2 = 0x3D, "pop2", None;
    Iadd = 0x43, "iadd", None;
    Isub = 0x46, "isub", None;
    Imul = 0x49, "imul", None;
    Idiv = 0x4C, "idiv", None;
    IdivUn = 0x4D, "idiv_un", None;
    Irem = 0x4E, "irem", None;
    IremUn = 0x4F, "irem_un", None;
    Ineg = 0x50, "ineg", None;
    Ladd = 0x51, "ladd", None;
    Lsub = 0x54, "lsub", None;
    Lmul = 0x57, "lmul", None;
    Ldiv = 0x5A, "ldiv", None;
    LdivUn = 0x5B, "ldiv_un", None;
    Lrem = 0x5C, "lrem", None;
    LremUn = 0x5D, "lrem_un", None;
    Lneg = 0x5E, "lneg", None;
    Fadd = 0x5F, "fadd", None;
    Fsub = 0x60, "fsub", None;
    Fmul = 0x61, "fmul", None;
    Fdiv = 0x62, "fdiv", None;
    Frem = 0x63, "frem", None;
    Fneg = 0x64, "fneg", None;
    Iand = 0x65, "iand", None;
    Ior = 0x66, "ior", None;
    Ixor = 0x67, "ixor", None;
    Inot = 0x68, "inot", None;
    Ishl = 0x69, "ishl", None;
    Ishr = 0x6A, "ishr", None;
    IshrUn = 0x6B, "ishr_un", None;
    Land = 0x6C, "land", None;
    Lor = 0x6D, "lor", None;
    Lxor = 0x6E, "lxor", None;
    Lnot = 0x6F, "lnot", None;
    Lshl = 0x70, "lshl", None;
    Lshr = 0x71, "lshr", None;
    LshrUn = 0x72, "lshr_un", None;
    I2b = 0x73, "i2b", None;
    I2ub = 0x74, "i2ub", None;
    I2s = 0x75, "i2s", None;
    I2us = 0x76, "i2us", None;
    I2l = 0x77, "i2l", None;
    Iu2l = 0x78, "iu2l", None;
    I2f = 0x79, "i2f", None;
    Iu2f = 0x7A, "iu2f", None;
    L2i = 0x7B, "l2i", None;
    L2f = 0x7C, "l2f", None;
    Lu2f = 0x7D, "lu2f", None;
    F2i = 0x7E, "f2i", None;
    F2iu = 0x7F, "f2iu", None;
    F2l = 0x80, "f2l", None;
    F2lu = 0x81, "f2lu", None;
    F2f = 0x82, "f2f", None;
    F2d = 0x83, "f2d", None;
    PaddOffset = 0x85, "padd_offset", Byte;
    PaddI4 = 0x87, "padd_i4", None;
    PaddI4R = 0x88, "padd_i4_r", None;
    Psub = 0x8B, "psub", None;
    PsubI4 = 0x8C, "psub_i4", None;
    Cknull = 0x8E, "cknull", None;
    Ldnull = 0x91, "ldnull", None;
    LdcI4M1 = 0x92, "ldc_i4_m1", None;
    LdcI40 = 0x93, "ldc_i4_0", None;
    LdcI41 = 0x94, "ldc_i4_1", None;
    LdcI42 = 0x95, "ldc_i4_2", None;
    LdcI43 = 0x96, "ldc_i4_3", None;
    LdcI44 = 0x97, "ldc_i4_4", None;
    LdcI45 = 0x98, "ldc_i4_5", None;
    LdcI46 = 0x99, "ldc_i4_6", None;
    LdcI47 = 0x9A, "ldc_i4_7", None;
    LdcI48 = 0x9B, "ldc_i4_8", None;
    LdcI4S = 0x9C, "ldc_i4_s", Byte;
    LdcI4 = 0x9D, "ldc_i4", Word;
    LdcI8 = 0x9E, "ldc_i8", Long;
    LdcR4 = 0x9F, "ldc_r4", Float;
    LdcR8 = 0xA0, "ldc_r8", Double;
    Br = 0xA1, "br", Branch;
    Beq = 0xA2, "beq", Branch;
    Bne = 0xA3, "bne", Branch;
    Blt = 0xA4, "blt", Branch;
    BltUn = 0xA5, "blt_un", Branch;
    Ble = 0xA6, "ble", Branch;
    BleUn = 0xA7, "ble_un", Branch;
    Bgt = 0xA8, "bgt", Branch;
    BgtUn = 0xA9, "bgt_un", Branch;
    Bge = 0xAA, "bge", Branch;
    BgeUn = 0xAB, "bge_un", Branch;
    Brtrue = 0xAC, "brtrue", Branch;
    Brfalse = 0xAD, "brfalse", Branch;
    Brnull = 0xAE, "brnull", Branch;
    Brnonnull = 0xAF, "brnonnull", Branch;
    BrPeq = 0xB0, "br_peq", Branch;
    BrPne = 0xB1, "br_pne", Branch;
    Switch = 0xB3, "switch", Switch;
    BreadElem = 0xB4, "bread_elem", None;
    UbreadElem = 0xB5, "ubread_elem", None;
    SreadElem = 0xB6, "sread_elem", None;
    UsreadElem = 0xB7, "usread_elem", None;
    IreadElem = 0xB8, "iread_elem", None;
    PreadElem = 0xB9, "pread_elem", None;
    BwriteElem = 0xBA, "bwrite_elem", None;
    SwriteElem = 0xBB, "swrite_elem", None;
    IwriteElem = 0xBC, "iwrite_elem", None;
    PwriteElem = 0xBD, "pwrite_elem", None;
    ElemAddrShiftI4 = 0xBE, "elem_addr_shift_i4", Byte;
    ElemAddrMulI4 = 0xBF, "elem_addr_mul_i4", Word;
    ArrayLen = 0xC2, "array_len", None;
    BreadField = 0xC3, "bread_field", Word;
    UbreadField = 0xC4, "ubread_field", Word;
    SreadField = 0xC5, "sread_field", Word;
    UsreadField = 0xC6, "usread_field", Word;
    IreadField = 0xC7, "iread_field", Word;
    PreadField = 0xC8, "pread_field", Word;
    BwriteField = 0xC9, "bwrite_field", Word;
    SwriteField = 0xCA, "swrite_field", Word;
    IwriteField = 0xCB, "iwrite_field", Word;
    PwriteField = 0xCC, "pwrite_field", Word;
    PreadThis = 0xCD, "pread_this", Word;
    IreadThis = 0xCE, "iread_this", Word;
    Call = 0xCF, "call", Ptr;
    CallCtor = 0xD0, "call_ctor", Ptr;
    CallNative = 0xD1, "call_native", Ptr2;
    CallNativeVoid = 0xD2, "call_native_void", Ptr2;
    CallNativeRaw = 0xD3, "call_native_raw", Ptr2;
    CallNativeVoidRaw = 0xD4, "call_native_void_raw", Ptr2;
    Return = 0xD7, "return", None;
    Return1 = 0xD8, "return_1", None;
    Return2 = 0xD9, "return_2", None;
    ReturnN = 0xDA, "return_n", Word;
    New = 0xE7, "new", Ptr;
    Wide = 0xFD, "wide", Escape;
    Prefix = 0xFF, "prefix", Escape;
    Icmp = 0x101, "icmp", PrefixNone;
    IcmpUn = 0x102, "icmp_un", PrefixNone;
    Lcmp = 0x103, "lcmp", PrefixNone;
    LcmpUn = 0x104, "lcmp_un", PrefixNone;
    Fcmpl = 0x105, "fcmpl", PrefixNone;
    Fcmpg = 0x106, "fcmpg", PrefixNone;
    Pcmp = 0x107, "pcmp", PrefixNone;
    Seteq = 0x108, "seteq", PrefixNone;
    Setne = 0x109, "setne", PrefixNone;
    Setlt = 0x10A, "setlt", PrefixNone;
    Setle = 0x10B, "setle", PrefixNone;
    Setgt = 0x10C, "setgt", PrefixNone;
    Setge = 0x10D, "setge", PrefixNone;
    LreadElem = 0x10E, "lread_elem", PrefixNone;
    DreadElem = 0x110, "dread_elem", PrefixNone;
    LwriteElem = 0x111, "lwrite_elem", PrefixNone;
    DwriteElem = 0x113, "dwrite_elem", PrefixNone;
    Get2d = 0x114, "get2d", PrefixNone;
    Set2d = 0x115, "set2d", PrefixWord;
    Throw = 0x11F, "throw", PrefixNone;
    UnrollMethod = 0x15B, "unroll_method", PrefixNone;
}

impl Opcode {
    pub fn is_prefixed(self) -> bool {
        (self as u16) >= 0x100
    }

    pub fn low_byte(self) -> u8 {
        (self as u16 & 0xFF) as u8
    }

    pub fn is_branch(self) -> bool {
        matches!(self.format(), OperandFormat::Branch | OperandFormat::Switch)
    }

    pub fn ends_flow(self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::Switch
                | Opcode::Return
                | Opcode::Return1
                | Opcode::Return2
                | Opcode::ReturnN
                | Opcode::Throw
        )
    }

    pub fn implied_local(self) -> Option<u32> {
        match self {
            Opcode::Iload0 | Opcode::Pload0 | Opcode::Istore0 | Opcode::Pstore0 => Some(0),
            Opcode::Iload1 | Opcode::Pload1 | Opcode::Istore1 | Opcode::Pstore1 => Some(1),
            Opcode::Iload2 | Opcode::Pload2 | Opcode::Istore2 | Opcode::Pstore2 => Some(2),
            Opcode::Iload3 | Opcode::Pload3 | Opcode::Istore3 | Opcode::Pstore3 => Some(3),
            _ => None,
        }
    }

    pub fn implied_constant(self) -> Option<i32> {
        match self {
            Opcode::LdcI4M1 => Some(-1),
            Opcode::LdcI40 => Some(0),
            Opcode::LdcI41 => Some(1),
            Opcode::LdcI42 => Some(2),
            Opcode::LdcI43 => Some(3),
            Opcode::LdcI44 => Some(4),
            Opcode::LdcI45 => Some(5),
            Opcode::LdcI46 => Some(6),
            Opcode::LdcI47 => Some(7),
            Opcode::LdcI48 => Some(8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_round_trip() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::parse_mnemonic(op.mnemonic()), Some(op));
            assert_eq!(Opcode::from_u16(op as u16), Some(op));
        }
    }

    #[test]
    fn prefixed_numbering_matches_second_byte() {
        assert!(Opcode::Get2d.is_prefixed());
        assert_eq!(Opcode::Get2d.low_byte(), 0x14);
        assert_eq!(Opcode::UnrollMethod.low_byte(), 0x5B);
        assert!(!Opcode::Iadd.is_prefixed());
        assert_eq!(Opcode::from_u16(0x100), None);
    }
}
