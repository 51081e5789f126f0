use std::collections::HashMap;

use crate::lengths::{self, WIDE_SMALL_BYTES};
use crate::opcodes::{Opcode, OperandFormat};

/// One operand stack slot. 32-bit values occupy the low half; pointers,
/// 64-bit integers and native floats fill the word.
pub type Word = u64;

pub const WORD_SIZE: usize = 8;

const END_PREFIX_BYTE: u8 = 0x00;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Encoding {
    #[cfg_attr(not(feature = "direct-threaded"), default)]
    Bytecode,
    #[cfg_attr(feature = "direct-threaded", default)]
    DirectThreaded,
}

impl Encoding {
    pub const fn unit(self) -> usize {
        match self {
            Encoding::Bytecode => 1,
            Encoding::DirectThreaded => WORD_SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Bytecode => "bytecode",
            Encoding::DirectThreaded => "threaded",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "bytecode" | "byte" => Some(Encoding::Bytecode),
            "threaded" | "direct" | "direct-threaded" => Some(Encoding::DirectThreaded),
            _ => None,
        }
    }
}

#[repr(C)]
struct LabelTable([u8; 512]);

static INTERPRETER_LABELS: LabelTable = LabelTable([0; 512]);

pub fn label_for_opcode(opcode: u16) -> Word {
    (INTERPRETER_LABELS.0.as_ptr() as usize + (opcode as usize & 0x1FF)) as Word
}

pub fn opcode_for_label(word: Word) -> Option<u16> {
    let base = INTERPRETER_LABELS.0.as_ptr() as usize as Word;
    if word >= base && word < base + 512 {
        Some((word - base) as u16)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    Truncated { pc: usize },
    InvalidOpcode { pc: usize, value: u16 },
    InvalidLabel { pc: usize },
    InvalidWide { pc: usize },
    InvalidTarget { pc: usize, target: i64 },
    UnboundLabel(usize),
    LabelBoundTwice(usize),
    DisplacementOverflow { pc: usize },
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::Truncated { pc } => write!(f, "truncated instruction at {pc}"),
            FormatError::InvalidOpcode { pc, value } => {
                write!(f, "invalid opcode 0x{value:03X} at {pc}")
            }
            FormatError::InvalidLabel { pc } => write!(f, "word at {pc} is not an opcode label"),
            FormatError::InvalidWide { pc } => write!(f, "invalid wide form at {pc}"),
            FormatError::InvalidTarget { pc, target } => {
                write!(f, "branch at {pc} targets {target}, not an instruction start")
            }
            FormatError::UnboundLabel(id) => write!(f, "label L{id} is never bound"),
            FormatError::LabelBoundTwice(id) => write!(f, "label L{id} is bound twice"),
            FormatError::DisplacementOverflow { pc } => {
                write!(f, "branch displacement at {pc} does not fit 32 bits")
            }
        }
    }
}

impl std::error::Error for FormatError {}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Float(f64),
    Target(usize),
    Pair(u32, u32),
    Switch { count: u32, default: usize },
}

impl Operand {
    pub fn int(&self) -> i64 {
        match self {
            Operand::Int(value) => *value,
            _ => 0,
        }
    }

    pub fn target(&self) -> usize {
        match self {
            Operand::Target(target) => *target,
            Operand::Switch { default, .. } => *default,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Insn {
    pub opcode: Opcode,
    pub pc: usize,
    pub len: usize,
    pub operand: Operand,
    pub wide: bool,
}

impl Insn {
    pub fn next_pc(&self) -> usize {
        self.pc + self.len
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decoded {
    Insn(Insn),
    End,
}

#[derive(Clone, Copy, Debug)]
pub struct CodeView<'a> {
    pub bytes: &'a [u8],
    pub encoding: Encoding,
}

impl<'a> CodeView<'a> {
    pub fn new(bytes: &'a [u8], encoding: Encoding) -> Self {
        Self { bytes, encoding }
    }

    fn byte(&self, at: usize) -> Result<u8, FormatError> {
        self.bytes
            .get(at)
            .copied()
            .ok_or(FormatError::Truncated { pc: at })
    }

    fn array<const N: usize>(&self, at: usize) -> Result<[u8; N], FormatError> {
        let end = at.checked_add(N).ok_or(FormatError::Truncated { pc: at })?;
        let slice = self
            .bytes
            .get(at..end)
            .ok_or(FormatError::Truncated { pc: at })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_i32(&self, at: usize) -> Result<i32, FormatError> {
        Ok(i32::from_le_bytes(self.array::<4>(at)?))
    }

    fn read_u32(&self, at: usize) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array::<4>(at)?))
    }

    fn read_i64(&self, at: usize) -> Result<i64, FormatError> {
        Ok(i64::from_le_bytes(self.array::<8>(at)?))
    }

    pub fn read_word(&self, at: usize) -> Result<Word, FormatError> {
        Ok(Word::from_ne_bytes(self.array::<8>(at)?))
    }

    fn operand_word(&self, pc: usize, index: usize) -> Result<Word, FormatError> {
        self.read_word(pc + index * WORD_SIZE)
    }

    pub fn opcode_at(&self, pc: usize) -> Result<u16, FormatError> {
        match self.encoding {
            Encoding::Bytecode => {
                let first = self.byte(pc)?;
                match first {
                    0xFF => {
                        let second = self.byte(pc + 1)?;
                        if second == END_PREFIX_BYTE {
                            Ok(Opcode::Prefix as u16)
                        } else {
                            Ok(0x100 | second as u16)
                        }
                    }
                    0xFD => Ok(self.byte(pc + 1)? as u16),
                    other => Ok(other as u16),
                }
            }
            Encoding::DirectThreaded => {
                let word = self.read_word(pc)?;
                opcode_for_label(word).ok_or(FormatError::InvalidLabel { pc })
            }
        }
    }

    pub fn decode(&self, pc: usize) -> Result<Decoded, FormatError> {
        match self.encoding {
            Encoding::Bytecode => self.decode_bytecode(pc),
            Encoding::DirectThreaded => self.decode_threaded(pc),
        }
    }

    fn lookup(pc: usize, value: u16) -> Result<Opcode, FormatError> {
        Opcode::from_u16(value).ok_or(FormatError::InvalidOpcode { pc, value })
    }

    fn target(pc: usize, rel: i64) -> Result<usize, FormatError> {
        let target = pc as i64 + rel;
        if target < 0 {
            return Err(FormatError::InvalidTarget { pc, target });
        }
        Ok(target as usize)
    }

    fn decode_bytecode(&self, pc: usize) -> Result<Decoded, FormatError> {
        let first = self.byte(pc)?;
        if first == Opcode::Wide as u8 {
            let opcode = Self::lookup(pc, self.byte(pc + 1)? as u16)?;
            if opcode.format() != OperandFormat::WideSmall {
                return Err(FormatError::InvalidWide { pc });
            }
            let value = self.read_u32(pc + 2)?;
            return Ok(Decoded::Insn(Insn {
                opcode,
                pc,
                len: WIDE_SMALL_BYTES,
                operand: Operand::Int(value as i64),
                wide: true,
            }));
        }
        if first == Opcode::Prefix as u8 {
            let second = self.byte(pc + 1)?;
            if second == END_PREFIX_BYTE {
                return Ok(Decoded::End);
            }
            let opcode = Self::lookup(pc, 0x100 | second as u16)?;
            let operand = match opcode.format() {
                OperandFormat::PrefixWord => Operand::Int(self.read_i32(pc + 2)? as i64),
                _ => Operand::None,
            };
            let len = lengths::length(opcode as u16, Encoding::Bytecode);
            return Ok(Decoded::Insn(Insn {
                opcode,
                pc,
                len,
                operand,
                wide: false,
            }));
        }

        let opcode = Self::lookup(pc, first as u16)?;
        let mut len = lengths::length(opcode as u16, Encoding::Bytecode);
        let operand = match opcode.format() {
            OperandFormat::None | OperandFormat::Escape | OperandFormat::PrefixNone => {
                Operand::None
            }
            OperandFormat::Byte => Operand::Int(self.byte(pc + 1)? as i8 as i64),
            OperandFormat::WideSmall => Operand::Int(self.byte(pc + 1)? as i64),
            OperandFormat::Word | OperandFormat::PrefixWord => {
                Operand::Int(self.read_i32(pc + 1)? as i64)
            }
            OperandFormat::Long => Operand::Int(self.read_i64(pc + 1)?),
            OperandFormat::Float => {
                Operand::Float(f32::from_bits(self.read_u32(pc + 1)?) as f64)
            }
            OperandFormat::Double => {
                Operand::Float(f64::from_bits(self.read_i64(pc + 1)? as u64))
            }
            OperandFormat::Branch => {
                Operand::Target(Self::target(pc, self.read_i32(pc + 1)? as i64)?)
            }
            OperandFormat::Ptr => Operand::Int(self.read_u32(pc + 1)? as i64),
            OperandFormat::Ptr2 => Operand::Pair(self.read_u32(pc + 1)?, self.read_u32(pc + 5)?),
            OperandFormat::Switch => {
                let count = self.read_u32(pc + 1)?;
                let default = Self::target(pc, self.read_i32(pc + 5)? as i64)?;
                len = 9 + 4 * count as usize;
                if pc + len > self.bytes.len() {
                    return Err(FormatError::Truncated { pc });
                }
                Operand::Switch { count, default }
            }
        };
        Ok(Decoded::Insn(Insn {
            opcode,
            pc,
            len,
            operand,
            wide: false,
        }))
    }

    fn decode_threaded(&self, pc: usize) -> Result<Decoded, FormatError> {
        let value = self.opcode_at(pc)?;
        if value == Opcode::Prefix as u16 {
            return Ok(Decoded::End);
        }
        let opcode = Self::lookup(pc, value)?;
        let mut len = lengths::length(value, Encoding::DirectThreaded) * WORD_SIZE;
        let operand = match opcode.format() {
            OperandFormat::None | OperandFormat::Escape | OperandFormat::PrefixNone => {
                Operand::None
            }
            OperandFormat::Byte
            | OperandFormat::WideSmall
            | OperandFormat::Word
            | OperandFormat::Long
            | OperandFormat::Ptr
            | OperandFormat::PrefixWord => Operand::Int(self.operand_word(pc, 1)? as i64),
            OperandFormat::Float => {
                Operand::Float(f32::from_bits(self.operand_word(pc, 1)? as u32) as f64)
            }
            OperandFormat::Double => Operand::Float(f64::from_bits(self.operand_word(pc, 1)?)),
            OperandFormat::Branch => {
                Operand::Target(Self::target(pc, self.operand_word(pc, 1)? as i64)?)
            }
            OperandFormat::Ptr2 => Operand::Pair(
                self.operand_word(pc, 1)? as u32,
                self.operand_word(pc, 2)? as u32,
            ),
            OperandFormat::Switch => {
                let count = self.operand_word(pc, 1)? as u32;
                let default = Self::target(pc, self.operand_word(pc, 2)? as i64)?;
                len = (3 + count as usize) * WORD_SIZE;
                if pc + len > self.bytes.len() {
                    return Err(FormatError::Truncated { pc });
                }
                Operand::Switch { count, default }
            }
        };
        Ok(Decoded::Insn(Insn {
            opcode,
            pc,
            len,
            operand,
            wide: false,
        }))
    }

    pub fn switch_target(&self, insn: &Insn, index: u32) -> Result<usize, FormatError> {
        let rel = match self.encoding {
            Encoding::Bytecode => self.read_i32(insn.pc + 9 + 4 * index as usize)? as i64,
            Encoding::DirectThreaded => self.operand_word(insn.pc, 3 + index as usize)? as i64,
        };
        Self::target(insn.pc, rel)
    }

    pub fn instructions(&self) -> Result<Vec<Insn>, FormatError> {
        let mut out = Vec::new();
        let mut pc = 0usize;
        while pc < self.bytes.len() {
            match self.decode(pc)? {
                Decoded::Insn(insn) => {
                    pc = insn.next_pc();
                    out.push(insn);
                }
                Decoded::End => break,
            }
        }
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

struct Fixup {
    at: usize,
    base: usize,
    label: Label,
}

#[derive(Default)]
pub struct CodeBuilder {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    error: Option<FormatError>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        let position = self.code.len();
        match self.labels.get_mut(label.0) {
            Some(slot @ None) => *slot = Some(position),
            _ => {
                self.error.get_or_insert(FormatError::LabelBoundTwice(label.0));
            }
        }
    }

    fn emit_opcode(&mut self, opcode: Opcode) {
        if opcode.is_prefixed() {
            self.code.push(Opcode::Prefix as u8);
        }
        self.code.push(opcode.low_byte());
    }

    fn emit_rel(&mut self, base: usize, label: Label) {
        let at = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup { at, base, label });
    }

    pub fn op(&mut self, opcode: Opcode) {
        self.emit_opcode(opcode);
    }

    pub fn ldc_i4(&mut self, value: i32) {
        match value {
            -1..=8 => {
                let opcode = Opcode::from_u16((Opcode::LdcI40 as i32 + value) as u16)
                    .unwrap_or(Opcode::LdcI4M1);
                self.emit_opcode(opcode);
            }
            -128..=127 => {
                self.emit_opcode(Opcode::LdcI4S);
                self.code.push(value as i8 as u8);
            }
            _ => {
                self.emit_opcode(Opcode::LdcI4);
                self.code.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    pub fn ldc_i8(&mut self, value: i64) {
        self.emit_opcode(Opcode::LdcI8);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn ldc_r4(&mut self, value: f32) {
        self.emit_opcode(Opcode::LdcR4);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn ldc_r8(&mut self, value: f64) {
        self.emit_opcode(Opcode::LdcR8);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn local(&mut self, family: Opcode, index: u32) {
        let short_base = match family {
            Opcode::Iload => Some(Opcode::Iload0),
            Opcode::Pload => Some(Opcode::Pload0),
            Opcode::Istore => Some(Opcode::Istore0),
            Opcode::Pstore => Some(Opcode::Pstore0),
            _ => None,
        };
        if let Some(base) = short_base {
            if index < 4 {
                if let Some(opcode) = Opcode::from_u16(base as u16 + index as u16) {
                    self.emit_opcode(opcode);
                    return;
                }
            }
        }
        if index <= u8::MAX as u32 {
            self.emit_opcode(family);
            self.code.push(index as u8);
        } else {
            self.code.push(Opcode::Wide as u8);
            self.code.push(family as u8);
            self.code.extend_from_slice(&index.to_le_bytes());
        }
    }

    pub fn byte(&mut self, opcode: Opcode, value: u8) {
        self.emit_opcode(opcode);
        self.code.push(value);
    }

    pub fn word(&mut self, opcode: Opcode, value: i32) {
        self.emit_opcode(opcode);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn ptr(&mut self, opcode: Opcode, index: u32) {
        self.emit_opcode(opcode);
        self.code.extend_from_slice(&index.to_le_bytes());
    }

    pub fn ptr2(&mut self, opcode: Opcode, first: u32, second: u32) {
        self.emit_opcode(opcode);
        self.code.extend_from_slice(&first.to_le_bytes());
        self.code.extend_from_slice(&second.to_le_bytes());
    }

    pub fn branch(&mut self, opcode: Opcode, label: Label) {
        let base = self.code.len();
        self.emit_opcode(opcode);
        self.emit_rel(base, label);
    }

    pub fn switch(&mut self, cases: &[Label], default: Label) {
        let base = self.code.len();
        self.emit_opcode(Opcode::Switch);
        self.code
            .extend_from_slice(&(cases.len() as u32).to_le_bytes());
        self.emit_rel(base, default);
        for &case in cases {
            self.emit_rel(base, case);
        }
    }

    pub fn finish(mut self) -> Result<Vec<u8>, FormatError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for fixup in &self.fixups {
            let target = self
                .labels
                .get(fixup.label.0)
                .copied()
                .flatten()
                .ok_or(FormatError::UnboundLabel(fixup.label.0))?;
            let rel = i32::try_from(target as i64 - fixup.base as i64)
                .map_err(|_| FormatError::DisplacementOverflow { pc: fixup.base })?;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(self.code)
    }
}

pub struct Reencoded {
    pub code: Vec<u8>,
    pub pc_map: HashMap<usize, usize>,
    pub body_start: usize,
}

fn encoded_len(insn: &Insn, encoding: Encoding) -> usize {
    match (insn.opcode.format(), encoding) {
        (OperandFormat::Switch, Encoding::Bytecode) => insn.len,
        (OperandFormat::Switch, Encoding::DirectThreaded) => {
            let count = match insn.operand {
                Operand::Switch { count, .. } => count as usize,
                _ => 0,
            };
            (3 + count) * WORD_SIZE
        }
        (OperandFormat::WideSmall, Encoding::Bytecode) if insn.operand.int() > 0xFF => {
            WIDE_SMALL_BYTES
        }
        (_, encoding) => lengths::length(insn.opcode as u16, encoding) * encoding.unit(),
    }
}

fn push_rel(out: &mut Vec<u8>, encoding: Encoding, pc: usize, rel: i64) -> Result<(), FormatError> {
    match encoding {
        Encoding::Bytecode => {
            let rel = i32::try_from(rel).map_err(|_| FormatError::DisplacementOverflow { pc })?;
            out.extend_from_slice(&rel.to_le_bytes());
        }
        Encoding::DirectThreaded => out.extend_from_slice(&(rel as Word).to_ne_bytes()),
    }
    Ok(())
}

fn push_operand(out: &mut Vec<u8>, encoding: Encoding, bytes: &[u8], value: Word) {
    match encoding {
        Encoding::Bytecode => out.extend_from_slice(bytes),
        Encoding::DirectThreaded => out.extend_from_slice(&value.to_ne_bytes()),
    }
}

fn push_opcode(out: &mut Vec<u8>, encoding: Encoding, opcode: Opcode) {
    match encoding {
        Encoding::Bytecode => {
            if opcode.is_prefixed() {
                out.push(Opcode::Prefix as u8);
            }
            out.push(opcode.low_byte());
        }
        Encoding::DirectThreaded => {
            out.extend_from_slice(&label_for_opcode(opcode as u16).to_ne_bytes())
        }
    }
}

pub fn push_end_sentinel(out: &mut Vec<u8>, encoding: Encoding) {
    match encoding {
        Encoding::Bytecode => out.extend_from_slice(&[Opcode::Prefix as u8, END_PREFIX_BYTE]),
        Encoding::DirectThreaded => {
            out.extend_from_slice(&label_for_opcode(Opcode::Prefix as u16).to_ne_bytes())
        }
    }
}

pub fn reencode(
    source: &CodeView<'_>,
    insns: &[Insn],
    encoding: Encoding,
    prologue: &[Opcode],
) -> Result<Reencoded, FormatError> {
    let mut pc_map = HashMap::with_capacity(insns.len() + 1);
    let mut position: usize = prologue
        .iter()
        .map(|op| lengths::length(*op as u16, encoding) * encoding.unit())
        .sum();
    let body_start = position;
    for insn in insns {
        pc_map.insert(insn.pc, position);
        position += encoded_len(insn, encoding);
    }
    let source_end = insns.last().map(|insn| insn.next_pc()).unwrap_or(0);
    pc_map.insert(source_end, position);

    let map_target = |pc: usize, target: usize| -> Result<usize, FormatError> {
        pc_map.get(&target).copied().ok_or(FormatError::InvalidTarget {
            pc,
            target: target as i64,
        })
    };

    let mut out = Vec::with_capacity(position + WORD_SIZE);
    for op in prologue {
        push_opcode(&mut out, encoding, *op);
    }
    for insn in insns {
        let new_pc = pc_map[&insn.pc];
        debug_assert_eq!(out.len(), new_pc);
        let wide = encoding == Encoding::Bytecode
            && insn.opcode.format() == OperandFormat::WideSmall
            && insn.operand.int() > 0xFF;
        if wide {
            out.push(Opcode::Wide as u8);
            out.push(insn.opcode as u8);
            out.extend_from_slice(&(insn.operand.int() as u32).to_le_bytes());
            continue;
        }
        push_opcode(&mut out, encoding, insn.opcode);
        match insn.opcode.format() {
            OperandFormat::None | OperandFormat::PrefixNone | OperandFormat::Escape => {}
            OperandFormat::Byte | OperandFormat::WideSmall => {
                let value = insn.operand.int();
                push_operand(&mut out, encoding, &[value as u8], value as Word);
            }
            OperandFormat::Word | OperandFormat::PrefixWord => {
                let value = insn.operand.int() as i32;
                push_operand(&mut out, encoding, &value.to_le_bytes(), value as i64 as Word);
            }
            OperandFormat::Ptr => {
                let value = insn.operand.int() as u32;
                push_operand(&mut out, encoding, &value.to_le_bytes(), value as Word);
            }
            OperandFormat::Long => {
                let value = insn.operand.int();
                push_operand(&mut out, encoding, &value.to_le_bytes(), value as Word);
            }
            OperandFormat::Float => {
                let bits = match insn.operand {
                    Operand::Float(value) => (value as f32).to_bits(),
                    _ => 0,
                };
                push_operand(&mut out, encoding, &bits.to_le_bytes(), bits as Word);
            }
            OperandFormat::Double => {
                let bits = match insn.operand {
                    Operand::Float(value) => value.to_bits(),
                    _ => 0,
                };
                push_operand(&mut out, encoding, &bits.to_le_bytes(), bits);
            }
            OperandFormat::Ptr2 => {
                let (first, second) = match insn.operand {
                    Operand::Pair(first, second) => (first, second),
                    _ => (0, 0),
                };
                push_operand(&mut out, encoding, &first.to_le_bytes(), first as Word);
                push_operand(&mut out, encoding, &second.to_le_bytes(), second as Word);
            }
            OperandFormat::Branch => {
                let target = map_target(insn.pc, insn.operand.target())?;
                push_rel(&mut out, encoding, insn.pc, target as i64 - new_pc as i64)?;
            }
            OperandFormat::Switch => {
                let count = match insn.operand {
                    Operand::Switch { count, .. } => count,
                    _ => 0,
                };
                push_operand(&mut out, encoding, &count.to_le_bytes(), count as Word);
                let default = map_target(insn.pc, insn.operand.target())?;
                push_rel(&mut out, encoding, insn.pc, default as i64 - new_pc as i64)?;
                for index in 0..count {
                    let case = map_target(insn.pc, source.switch_target(insn, index)?)?;
                    push_rel(&mut out, encoding, insn.pc, case as i64 - new_pc as i64)?;
                }
            }
        }
    }
    push_end_sentinel(&mut out, encoding);
    Ok(Reencoded {
        code: out,
        pc_map,
        body_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut builder = CodeBuilder::new();
        let top = builder.new_label();
        let done = builder.new_label();
        builder.bind(top);
        builder.local(Opcode::Iload, 0);
        builder.local(Opcode::Iload, 300);
        builder.ldc_i4(1000);
        builder.op(Opcode::Iadd);
        builder.branch(Opcode::Brtrue, done);
        builder.switch(&[top, done], done);
        builder.bind(done);
        builder.op(Opcode::Get2d);
        builder.word(Opcode::Set2d, 1);
        builder.op(Opcode::Return);
        builder.finish().expect("sample should assemble")
    }

    #[test]
    fn builder_picks_short_and_wide_forms() {
        let code = sample();
        let view = CodeView::new(&code, Encoding::Bytecode);
        let insns = view.instructions().expect("decode");
        assert_eq!(insns[0].opcode, Opcode::Iload0);
        assert_eq!(insns[1].opcode, Opcode::Iload);
        assert!(insns[1].wide);
        assert_eq!(insns[1].operand, Operand::Int(300));
        assert_eq!(insns[2].opcode, Opcode::LdcI4);
        assert_eq!(insns[2].operand, Operand::Int(1000));
    }

    #[test]
    fn threaded_reencoding_preserves_branch_targets() {
        let code = sample();
        let source = CodeView::new(&code, Encoding::Bytecode);
        let insns = source.instructions().expect("decode");
        let threaded = reencode(&source, &insns, Encoding::DirectThreaded, &[Opcode::UnrollMethod])
            .expect("reencode");
        let view = CodeView::new(&threaded.code, Encoding::DirectThreaded);
        let decoded = view.instructions().expect("decode threaded");
        assert_eq!(decoded[0].opcode, Opcode::UnrollMethod);
        assert_eq!(decoded.len(), insns.len() + 1);

        let brtrue = decoded
            .iter()
            .find(|insn| insn.opcode == Opcode::Brtrue)
            .expect("brtrue present");
        let get2d = decoded
            .iter()
            .find(|insn| insn.opcode == Opcode::Get2d)
            .expect("get2d present");
        assert_eq!(brtrue.operand.target(), get2d.pc);

        let switch = decoded
            .iter()
            .find(|insn| insn.opcode == Opcode::Switch)
            .expect("switch present");
        assert_eq!(view.switch_target(switch, 0).expect("case 0"), threaded.body_start);
        assert_eq!(view.switch_target(switch, 1).expect("case 1"), get2d.pc);
    }

    #[test]
    fn sentinel_decodes_as_end_in_both_encodings() {
        for encoding in [Encoding::Bytecode, Encoding::DirectThreaded] {
            let mut out = Vec::new();
            push_end_sentinel(&mut out, encoding);
            let view = CodeView::new(&out, encoding);
            assert_eq!(view.decode(0).expect("decode"), Decoded::End);
            assert_eq!(view.opcode_at(0).expect("opcode"), Opcode::Prefix as u16);
        }
    }

    #[test]
    fn unbound_label_is_reported() {
        let mut builder = CodeBuilder::new();
        let label = builder.new_label();
        builder.branch(Opcode::Br, label);
        assert!(matches!(builder.finish(), Err(FormatError::UnboundLabel(_))));
    }
}
