use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::sync::OnceLock;

use regex::Regex;

use crate::exception::ExceptionKind;
use crate::format::{CodeBuilder, CodeView, Encoding, FormatError, Label, Operand};
use crate::image::{
    ExceptionRegion, Image, ImplKind, MethodDef, MethodId, PInvokeRecord, TypeDef, TypeId,
    ValueType,
};
use crate::opcodes::{Opcode, OperandFormat};

pub const DEFAULT_TYPE: &str = "Program";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    Syntax { line: usize, message: String },
    UnknownMnemonic { line: usize, mnemonic: String },
    UnknownSymbol { line: usize, name: String },
    DuplicateLabel(String),
    UnknownLabel(String),
    Format(FormatError),
}

impl fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblerError::Syntax { line, message } => write!(f, "line {line}: {message}"),
            AssemblerError::UnknownMnemonic { line, mnemonic } => {
                write!(f, "line {line}: unknown instruction '{mnemonic}'")
            }
            AssemblerError::UnknownSymbol { line, name } => {
                write!(f, "line {line}: unknown method or type '{name}'")
            }
            AssemblerError::DuplicateLabel(name) => write!(f, "label '{name}' defined twice"),
            AssemblerError::UnknownLabel(name) => write!(f, "label '{name}' is never defined"),
            AssemblerError::Format(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for AssemblerError {}

impl From<FormatError> for AssemblerError {
    fn from(err: FormatError) -> Self {
        AssemblerError::Format(err)
    }
}

type AsmResult<T> = Result<T, AssemblerError>;

fn syntax(line: usize, message: impl Into<String>) -> AssemblerError {
    AssemblerError::Syntax {
        line,
        message: message.into(),
    }
}

struct Patterns {
    label: Regex,
    instruction: Regex,
    header: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        label: Regex::new(r"^([A-Za-z_$][\w$.]*):$").expect("label pattern should compile"),
        instruction: Regex::new(r"^([a-z][a-z0-9_.]*)(?:\s+(.+))?$")
            .expect("instruction pattern should compile"),
        header: Regex::new(
            r"^(?:(?P<owner>[A-Za-z_][\w]*)::)?(?P<name>[A-Za-z_.][\w.]*)\s*\((?P<params>[^)]*)\)\s*(?:->\s*(?P<ret>\w+))?(?P<flags>.*)$",
        )
        .expect("header pattern should compile"),
    })
}

#[derive(Default)]
struct Symbols {
    methods: HashMap<String, MethodId>,
    types: HashMap<String, TypeId>,
}

impl Symbols {
    fn method(&self, line: usize, text: &str) -> AsmResult<u32> {
        if let Some(id) = self.methods.get(text) {
            return Ok(id.0);
        }
        parse_int(text)
            .map(|value| value as u32)
            .ok_or_else(|| AssemblerError::UnknownSymbol {
                line,
                name: text.to_string(),
            })
    }

    fn ty(&self, line: usize, text: &str) -> AsmResult<u32> {
        if let Some(id) = self.types.get(text) {
            return Ok(id.0);
        }
        parse_int(text)
            .map(|value| value as u32)
            .ok_or_else(|| AssemblerError::UnknownSymbol {
                line,
                name: text.to_string(),
            })
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    if negative && magnitude > i64::MIN.unsigned_abs() {
        return None;
    }
    let value = magnitude as i64;
    Some(if negative { value.wrapping_neg() } else { value })
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(at) => &line[..at],
        None => line,
    }
    .trim()
}

pub fn assemble(text: &str) -> AsmResult<Vec<u8>> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, strip_comment(line)))
        .filter(|(_, line)| !line.is_empty())
        .collect();
    let body = assemble_body(&lines, &Symbols::default())?;
    if let Some(&(line, _)) = body.catches.first() {
        return Err(syntax(line, "'.catch' needs a method declaration"));
    }
    Ok(body.code)
}

struct Body {
    code: Vec<u8>,
    catches: Vec<(usize, String)>,
    labels: HashMap<String, usize>,
}

struct LabelTable {
    labels: HashMap<String, Label>,
    bound: HashMap<String, usize>,
}

impl LabelTable {
    fn get(&mut self, builder: &mut CodeBuilder, name: &str) -> Label {
        *self
            .labels
            .entry(name.to_string())
            .or_insert_with(|| builder.new_label())
    }
}

fn assemble_body(lines: &[(usize, &str)], symbols: &Symbols) -> AsmResult<Body> {
    let patterns = patterns();
    let mut builder = CodeBuilder::new();
    let mut table = LabelTable {
        labels: HashMap::new(),
        bound: HashMap::new(),
    };
    let mut catches = Vec::new();

    for &(line, text) in lines {
        if let Some(rest) = text.strip_prefix(".catch") {
            catches.push((line, rest.trim().to_string()));
            continue;
        }
        if let Some(captures) = patterns.label.captures(text) {
            let name = &captures[1];
            if table.bound.contains_key(name) {
                return Err(AssemblerError::DuplicateLabel(name.to_string()));
            }
            let label = table.get(&mut builder, name);
            table.bound.insert(name.to_string(), builder.position());
            builder.bind(label);
            continue;
        }
        let captures = patterns
            .instruction
            .captures(text)
            .ok_or_else(|| syntax(line, format!("cannot parse '{text}'")))?;
        let mnemonic = &captures[1];
        let operand = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let opcode =
            Opcode::parse_mnemonic(mnemonic).ok_or_else(|| AssemblerError::UnknownMnemonic {
                line,
                mnemonic: mnemonic.to_string(),
            })?;
        emit(&mut builder, &mut table, symbols, line, opcode, operand)?;
    }

    for name in table.labels.keys() {
        if !table.bound.contains_key(name) {
            return Err(AssemblerError::UnknownLabel(name.clone()));
        }
    }
    Ok(Body {
        code: builder.finish()?,
        catches,
        labels: table.bound,
    })
}

fn int_operand(line: usize, opcode: Opcode, operand: &str) -> AsmResult<i64> {
    parse_int(operand)
        .ok_or_else(|| syntax(line, format!("'{}' expects an integer operand", opcode.mnemonic())))
}

fn emit(
    builder: &mut CodeBuilder,
    table: &mut LabelTable,
    symbols: &Symbols,
    line: usize,
    opcode: Opcode,
    operand: &str,
) -> AsmResult<()> {
    let format = opcode.format();
    let takes_operand = !matches!(
        format,
        OperandFormat::None | OperandFormat::PrefixNone | OperandFormat::Escape
    );
    if !takes_operand && !operand.is_empty() {
        return Err(syntax(line, format!("'{}' takes no operand", opcode.mnemonic())));
    }
    if takes_operand && operand.is_empty() {
        return Err(syntax(line, format!("'{}' needs an operand", opcode.mnemonic())));
    }
    match format {
        OperandFormat::None | OperandFormat::PrefixNone => builder.op(opcode),
        OperandFormat::Escape => {
            return Err(syntax(line, "escape bytes are emitted implicitly"));
        }
        OperandFormat::Byte if opcode == Opcode::LdcI4S => {
            builder.ldc_i4(int_operand(line, opcode, operand)? as i32)
        }
        OperandFormat::Byte => {
            let value = int_operand(line, opcode, operand)?;
            let value = u8::try_from(value)
                .or_else(|_| i8::try_from(value).map(|value| value as u8))
                .map_err(|_| syntax(line, format!("'{value}' does not fit in a byte")))?;
            builder.byte(opcode, value);
        }
        OperandFormat::Word | OperandFormat::PrefixWord => {
            builder.word(opcode, int_operand(line, opcode, operand)? as i32)
        }
        OperandFormat::Long => builder.ldc_i8(int_operand(line, opcode, operand)?),
        OperandFormat::Float | OperandFormat::Double => {
            let value: f64 = operand
                .parse()
                .map_err(|_| syntax(line, format!("'{operand}' is not a number")))?;
            if format == OperandFormat::Float {
                builder.ldc_r4(value as f32);
            } else {
                builder.ldc_r8(value);
            }
        }
        OperandFormat::WideSmall => {
            let index = int_operand(line, opcode, operand)?;
            let index = u32::try_from(index)
                .map_err(|_| syntax(line, format!("local index {index} out of range")))?;
            builder.local(opcode, index);
        }
        OperandFormat::Branch => {
            let label = table.get(builder, operand);
            builder.branch(opcode, label);
        }
        OperandFormat::Ptr => {
            let index = if opcode == Opcode::New {
                symbols.ty(line, operand)?
            } else {
                symbols.method(line, operand)?
            };
            builder.ptr(opcode, index);
        }
        OperandFormat::Ptr2 => {
            let parts: Vec<&str> = operand
                .split([',', ' ', '\t'])
                .filter(|part| !part.is_empty())
                .collect();
            let [first, second] = parts.as_slice() else {
                return Err(syntax(line, format!("'{}' expects two operands", opcode.mnemonic())));
            };
            let first = int_operand(line, opcode, first)? as u32;
            let second = int_operand(line, opcode, second)? as u32;
            builder.ptr2(opcode, first, second);
        }
        OperandFormat::Switch => {
            let names: Vec<&str> = operand.split(',').map(str::trim).collect();
            let Some((default, cases)) = names.split_last() else {
                return Err(syntax(line, "'switch' needs a default label"));
            };
            let cases: Vec<Label> = cases.iter().map(|name| table.get(builder, name)).collect();
            let default = table.get(builder, default);
            builder.switch(&cases, default);
        }
    }
    Ok(())
}

fn parse_type(line: usize, text: &str) -> AsmResult<ValueType> {
    match text {
        "i32" | "int" | "bool" => Ok(ValueType::I32),
        "i64" | "long" => Ok(ValueType::I64),
        "ptr" | "ref" => Ok(ValueType::Ptr),
        "f64" | "double" => Ok(ValueType::F64),
        other => Err(syntax(line, format!("unknown type '{other}'"))),
    }
}

fn parse_kind(line: usize, text: &str) -> AsmResult<Option<ExceptionKind>> {
    if text.is_empty() || text == "*" {
        return Ok(None);
    }
    ExceptionKind::ALL
        .iter()
        .copied()
        .find(|kind| {
            let full = kind.type_name();
            let short = full.rsplit('.').next().unwrap_or(full);
            text == full || text == short || Some(text) == short.strip_suffix("Exception")
        })
        .map(Some)
        .ok_or_else(|| syntax(line, format!("unknown exception kind '{text}'")))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HeaderKind {
    Method,
    Internal,
    PInvoke,
}

struct Header<'a> {
    line: usize,
    kind: HeaderKind,
    module: Option<&'a str>,
    owner: &'a str,
    name: &'a str,
    params: Vec<ValueType>,
    ret: Option<ValueType>,
    locals: u32,
    this: bool,
    ctor: bool,
    vararg: bool,
    alias: Option<&'a str>,
    no_mangle: bool,
    body: Vec<(usize, &'a str)>,
}

fn parse_header(line: usize, kind: HeaderKind, text: &str) -> AsmResult<Header<'_>> {
    let (module, text) = if kind == HeaderKind::PInvoke {
        let text = text.trim_start();
        let end = text.find(char::is_whitespace).unwrap_or(text.len());
        (Some(&text[..end]), text[end..].trim_start())
    } else {
        (None, text.trim())
    };
    if module.is_some_and(str::is_empty) {
        return Err(syntax(line, "'.pinvoke' needs a module name"));
    }
    let captures = patterns()
        .header
        .captures(text)
        .ok_or_else(|| syntax(line, format!("cannot parse method header '{text}'")))?;
    let params = captures
        .name("params")
        .map(|m| m.as_str())
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|param| !param.is_empty())
        .map(|param| parse_type(line, param))
        .collect::<AsmResult<Vec<_>>>()?;
    let ret = match captures.name("ret").map(|m| m.as_str()) {
        None | Some("void") => None,
        Some(ret) => Some(parse_type(line, ret)?),
    };
    let mut header = Header {
        line,
        kind,
        module,
        owner: captures.name("owner").map_or(DEFAULT_TYPE, |m| m.as_str()),
        name: captures.name("name").map_or("", |m| m.as_str()),
        params,
        ret,
        locals: 0,
        this: false,
        ctor: false,
        vararg: false,
        alias: None,
        no_mangle: false,
        body: Vec::new(),
    };
    let mut flags = captures
        .name("flags")
        .map_or("", |m| m.as_str())
        .split_whitespace();
    while let Some(flag) = flags.next() {
        match flag {
            "locals" => {
                header.locals = flags
                    .next()
                    .and_then(parse_int)
                    .and_then(|value| u32::try_from(value).ok())
                    .ok_or_else(|| syntax(line, "'locals' needs a count"))?;
            }
            "alias" => {
                header.alias = Some(flags.next().ok_or_else(|| syntax(line, "'alias' needs a name"))?);
            }
            "this" => header.this = true,
            "ctor" => header.ctor = true,
            "vararg" => header.vararg = true,
            "nomangle" => header.no_mangle = true,
            other => return Err(syntax(line, format!("unknown method flag '{other}'"))),
        }
    }
    Ok(header)
}

impl Header<'_> {
    fn qualified(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }

    fn definition(&self, owner: TypeId, code: Vec<u8>) -> MethodDef {
        let mut def = match self.kind {
            HeaderKind::Method => MethodDef::bytecode(
                self.name,
                owner,
                self.params.clone(),
                self.ret,
                self.locals,
                code,
            ),
            HeaderKind::Internal => MethodDef::external(
                self.name,
                owner,
                self.params.clone(),
                self.ret,
                ImplKind::Runtime,
                true,
                None,
            ),
            HeaderKind::PInvoke => {
                let mut record = PInvokeRecord::new(self.module.unwrap_or_default());
                if let Some(alias) = self.alias {
                    record = record.alias(alias);
                }
                record.no_mangle = self.no_mangle;
                MethodDef::external(
                    self.name,
                    owner,
                    self.params.clone(),
                    self.ret,
                    ImplKind::Il,
                    false,
                    Some(record),
                )
            }
        };
        if self.ctor {
            def = def.constructor();
        } else if self.this {
            def = def.with_this();
        }
        if self.vararg {
            def = def.vararg();
        }
        def
    }
}

pub fn assemble_image(name: &str, text: &str) -> AsmResult<Image> {
    let mut image = Image::new(name);
    let mut symbols = Symbols::default();
    let mut headers: Vec<Header<'_>> = Vec::new();
    let mut cctors: Vec<(usize, &str, &str)> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let text = strip_comment(raw);
        if text.is_empty() {
            continue;
        }
        if let Some(rest) = text.strip_prefix(".type") {
            let mut parts = rest.split_whitespace();
            let (Some(type_name), Some(size)) = (parts.next(), parts.next()) else {
                return Err(syntax(line, "'.type' needs a name and an instance size"));
            };
            let size = parse_int(size)
                .and_then(|size| u32::try_from(size).ok())
                .ok_or_else(|| syntax(line, format!("bad instance size '{size}'")))?;
            let id = image.add_type(TypeDef::new(type_name, size));
            symbols.types.insert(type_name.to_string(), id);
        } else if let Some(rest) = text.strip_prefix(".method") {
            headers.push(parse_header(line, HeaderKind::Method, rest)?);
        } else if let Some(rest) = text.strip_prefix(".internal") {
            headers.push(parse_header(line, HeaderKind::Internal, rest)?);
        } else if let Some(rest) = text.strip_prefix(".pinvoke") {
            headers.push(parse_header(line, HeaderKind::PInvoke, rest)?);
        } else if let Some(rest) = text.strip_prefix(".cctor") {
            let mut parts = rest.split_whitespace();
            let (Some(ty), Some(method)) = (parts.next(), parts.next()) else {
                return Err(syntax(line, "'.cctor' needs a type and a method"));
            };
            cctors.push((line, ty, method));
        } else {
            match headers.last_mut() {
                Some(header) if header.kind == HeaderKind::Method => {
                    header.body.push((line, text));
                }
                _ => return Err(syntax(line, "instruction outside a '.method' body")),
            }
        }
    }

    let mut ids = Vec::with_capacity(headers.len());
    for header in &headers {
        let owner = match symbols.types.get(header.owner) {
            Some(&owner) => owner,
            None => {
                let owner = image.add_type(TypeDef::new(header.owner, 0));
                symbols.types.insert(header.owner.to_string(), owner);
                owner
            }
        };
        let id = image.add_method(header.definition(owner, Vec::new()));
        symbols.methods.insert(header.qualified(), id);
        symbols.methods.entry(header.name.to_string()).or_insert(id);
        ids.push((id, owner));
    }

    for (header, &(id, owner)) in headers.iter().zip(&ids) {
        if header.kind != HeaderKind::Method {
            continue;
        }
        let body = assemble_body(&header.body, &symbols)?;
        let mut regions = Vec::with_capacity(body.catches.len());
        for (line, directive) in &body.catches {
            let parts: Vec<&str> = directive.split_whitespace().collect();
            if !(3..=4).contains(&parts.len()) {
                return Err(syntax(*line, "'.catch' needs try, end and handler labels"));
            }
            let position = |name: &str| {
                body.labels
                    .get(name)
                    .copied()
                    .ok_or_else(|| AssemblerError::UnknownLabel(name.to_string()))
            };
            regions.push(ExceptionRegion {
                try_start: position(parts[0])?,
                try_end: position(parts[1])?,
                handler: position(parts[2])?,
                catch: parse_kind(*line, parts.get(3).copied().unwrap_or(""))?,
            });
        }
        let def = header.definition(owner, body.code).with_regions(regions);
        image.set_method(id, def);
        tracing::trace!(method = %header.qualified(), line = header.line, "assembled");
    }

    for (line, ty, method) in cctors {
        let ty = *symbols.types.get(ty).ok_or_else(|| AssemblerError::UnknownSymbol {
            line,
            name: ty.to_string(),
        })?;
        let method = symbols.method(line, method)?;
        image.set_cctor(ty, MethodId(method));
    }
    Ok(image)
}

pub fn disassemble(code: &[u8], encoding: Encoding) -> Result<String, FormatError> {
    let view = CodeView::new(code, encoding);
    let insns = view.instructions()?;
    let mut targets = BTreeSet::new();
    for insn in &insns {
        match insn.operand {
            Operand::Target(target) => {
                targets.insert(target);
            }
            Operand::Switch { count, default } => {
                targets.insert(default);
                for index in 0..count {
                    targets.insert(view.switch_target(insn, index)?);
                }
            }
            _ => {}
        }
    }

    let mut out = String::new();
    for insn in &insns {
        if targets.contains(&insn.pc) {
            let _ = writeln!(out, "L{}:", insn.pc);
        }
        let _ = write!(out, "    {:04}: {}", insn.pc, insn.opcode.mnemonic());
        match insn.operand {
            Operand::None => {}
            Operand::Int(value) => {
                let _ = write!(out, " {value}");
            }
            Operand::Float(value) => {
                let _ = write!(out, " {value:?}");
            }
            Operand::Target(target) => {
                let _ = write!(out, " L{target}");
            }
            Operand::Pair(first, second) => {
                let _ = write!(out, " {first}, {second}");
            }
            Operand::Switch { count, default } => {
                out.push(' ');
                for index in 0..count {
                    let _ = write!(out, "L{}, ", view.switch_target(insn, index)?);
                }
                let _ = write!(out, "L{default}");
            }
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn listing_source(listing: &str) -> String {
    listing
        .lines()
        .map(|line| match line.trim_start().split_once(": ") {
            Some((offset, rest)) if offset.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => line.trim(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_are_chosen_from_operands() {
        let code = assemble(
            "
            iload 2      ; becomes iload_2
            ldc_i4_s 5   ; becomes ldc_i4_5
            iadd
            return_1
            ",
        )
        .expect("body should assemble");
        let listing = disassemble(&code, Encoding::Bytecode).expect("disassemble");
        assert!(listing.contains("iload_2"), "listing:\n{listing}");
        assert!(listing.contains("ldc_i4_5"), "listing:\n{listing}");
    }

    #[test]
    fn labels_must_be_bound_once() {
        assert_eq!(
            assemble("br nowhere"),
            Err(AssemblerError::UnknownLabel("nowhere".to_string()))
        );
        assert_eq!(
            assemble("a:\na:\nreturn"),
            Err(AssemblerError::DuplicateLabel("a".to_string()))
        );
    }

    #[test]
    fn operand_arity_is_checked() {
        assert!(matches!(
            assemble("iadd 3"),
            Err(AssemblerError::Syntax { line: 1, .. })
        ));
        assert!(matches!(
            assemble("frobnicate"),
            Err(AssemblerError::UnknownMnemonic { .. })
        ));
    }

    #[test]
    fn integers_accept_hex_and_sign() {
        assert_eq!(parse_int("0x10"), Some(16));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int("x"), None);
    }

    #[test]
    fn exception_kinds_parse_by_short_name() {
        assert_eq!(
            parse_kind(1, "DivideByZero").expect("kind"),
            Some(ExceptionKind::DivideByZero)
        );
        assert_eq!(
            parse_kind(1, "System.NullReferenceException").expect("kind"),
            Some(ExceptionKind::NullReference)
        );
        assert_eq!(parse_kind(1, "*").expect("kind"), None);
    }

    #[test]
    fn image_resolves_methods_types_and_regions() {
        let image = assemble_image(
            "demo",
            "
            .type Point 16
            .method Program::main() -> i32
                new Point
                pop
                call helper
                return_1
            .method helper() -> i32
            start:
                ldc_i4_1
                ldc_i4_0
                idiv
                return_1
            handler:
                pop
                ldc_i4 42
                return_1
            .catch start handler handler DivideByZero
            .internal Runtime::NewArray(i32, i32) -> ptr
            ",
        )
        .expect("image should assemble");
        let main = image.find_method("Program::main").expect("main");
        let helper = image.find_method("helper").expect("helper");
        assert_ne!(main, helper);
        assert!(image.find_method("Runtime::NewArray").is_some());
        assert!(image.types().any(|(_, ty)| ty.name == "Point"));
    }

    #[test]
    fn stray_instructions_are_rejected() {
        assert!(matches!(
            assemble_image("bad", "iadd"),
            Err(AssemblerError::Syntax { line: 1, .. })
        ));
    }
}
