use std::sync::{Arc, Mutex, OnceLock};

use crate::converter::MethodCode;
use crate::exception::ExceptionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Fixed { size: u32 },
    Unresolved(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub layout: Layout,
    pub cctor: Option<MethodId>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Fixed { size },
            cctor: None,
        }
    }

    pub fn instance_size(&self) -> Option<u32> {
        match self.layout {
            Layout::Fixed { size } => Some(size),
            Layout::Unresolved(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    Ptr,
    F64,
}

impl ValueType {
    pub fn is_integer_class(self) -> bool {
        !matches!(self, ValueType::F64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CallConv {
    #[default]
    Default,
    VarArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImplKind {
    Il,
    OptIl,
    Runtime,
    Native,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CharSet {
    #[default]
    Ansi,
    Unicode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PInvokeRecord {
    pub module: String,
    pub alias: Option<String>,
    pub no_mangle: bool,
    pub charset: CharSet,
}

impl PInvokeRecord {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            alias: None,
            no_mangle: false,
            charset: CharSet::Ansi,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub handler: usize,
    pub catch: Option<ExceptionKind>,
}

impl ExceptionRegion {
    pub fn covers(&self, pc: usize) -> bool {
        pc >= self.try_start && pc < self.try_end
    }

    pub fn catches(&self, kind: ExceptionKind) -> bool {
        self.catch.is_none_or(|catch| catch == kind)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MethodBody {
    Bytecode {
        code: Vec<u8>,
        regions: Vec<ExceptionRegion>,
        locals: u32,
    },
    External {
        kind: ImplKind,
        internal_call: bool,
        pinvoke: Option<PInvokeRecord>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodDef {
    pub name: String,
    pub owner: TypeId,
    pub has_this: bool,
    pub is_ctor: bool,
    pub params: Vec<ValueType>,
    pub ret: Option<ValueType>,
    pub call_conv: CallConv,
    pub body: MethodBody,
}

impl MethodDef {
    pub fn bytecode(
        name: impl Into<String>,
        owner: TypeId,
        params: Vec<ValueType>,
        ret: Option<ValueType>,
        locals: u32,
        code: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            has_this: false,
            is_ctor: false,
            params,
            ret,
            call_conv: CallConv::Default,
            body: MethodBody::Bytecode {
                code,
                regions: Vec::new(),
                locals,
            },
        }
    }

    pub fn external(
        name: impl Into<String>,
        owner: TypeId,
        params: Vec<ValueType>,
        ret: Option<ValueType>,
        kind: ImplKind,
        internal_call: bool,
        pinvoke: Option<PInvokeRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            has_this: false,
            is_ctor: false,
            params,
            ret,
            call_conv: CallConv::Default,
            body: MethodBody::External {
                kind,
                internal_call,
                pinvoke,
            },
        }
    }

    pub fn with_this(mut self) -> Self {
        self.has_this = true;
        self
    }

    pub fn constructor(mut self) -> Self {
        self.has_this = true;
        self.is_ctor = true;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.call_conv = CallConv::VarArg;
        self
    }

    pub fn with_regions(mut self, new_regions: Vec<ExceptionRegion>) -> Self {
        if let MethodBody::Bytecode { regions, .. } = &mut self.body {
            *regions = new_regions;
        }
        self
    }

    pub fn arg_words(&self) -> u32 {
        self.params.len() as u32 + u32::from(self.has_this)
    }

    pub fn pinvoke(&self) -> Option<&PInvokeRecord> {
        match &self.body {
            MethodBody::External { pinvoke, .. } => pinvoke.as_ref(),
            MethodBody::Bytecode { .. } => None,
        }
    }
}

pub struct Method {
    pub id: MethodId,
    pub def: MethodDef,
    pub(crate) entry: OnceLock<Arc<MethodCode>>,
}

impl Method {
    pub fn entry(&self) -> Option<&Arc<MethodCode>> {
        self.entry.get()
    }
}

pub struct Image {
    pub name: String,
    types: Vec<TypeDef>,
    methods: Vec<Method>,
    pub(crate) metadata: Mutex<()>,
}

impl Image {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
            methods: Vec::new(),
            metadata: Mutex::new(()),
        }
    }

    pub fn add_type(&mut self, def: TypeDef) -> TypeId {
        self.types.push(def);
        TypeId(self.types.len() as u32 - 1)
    }

    pub fn add_method(&mut self, def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(Method {
            id,
            def,
            entry: OnceLock::new(),
        });
        id
    }

    pub fn set_method(&mut self, id: MethodId, def: MethodDef) -> bool {
        match self.methods.get_mut(id.0 as usize) {
            Some(method) if method.entry.get().is_none() => {
                method.def = def;
                true
            }
            _ => false,
        }
    }

    pub fn set_cctor(&mut self, ty: TypeId, cctor: MethodId) {
        if let Some(def) = self.types.get_mut(ty.0 as usize) {
            def.cctor = Some(cctor);
        }
    }

    pub fn ty(&self, id: TypeId) -> Option<&TypeDef> {
        self.types.get(id.0 as usize)
    }

    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }

    pub fn types(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(index, def)| (TypeId(index as u32), def))
    }

    pub fn qualified_name(&self, id: MethodId) -> String {
        match self.method(id) {
            Some(method) => {
                let owner = self
                    .ty(method.def.owner)
                    .map(|ty| ty.name.as_str())
                    .unwrap_or("?");
                format!("{owner}::{}", method.def.name)
            }
            None => format!("<method {}>", id.0),
        }
    }

    pub fn find_method(&self, name: &str) -> Option<MethodId> {
        self.methods
            .iter()
            .find(|method| {
                method.def.name == name || self.qualified_name(method.id) == name
            })
            .map(|method| method.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_bare_and_qualified_name() {
        let mut image = Image::new("demo");
        let program = image.add_type(TypeDef::new("Program", 0));
        let main = image.add_method(MethodDef::bytecode(
            "main",
            program,
            Vec::new(),
            Some(ValueType::I32),
            0,
            Vec::new(),
        ));
        assert_eq!(image.find_method("main"), Some(main));
        assert_eq!(image.find_method("Program::main"), Some(main));
        assert_eq!(image.find_method("Other::main"), None);
    }

    #[test]
    fn arg_words_count_this() {
        let def = MethodDef::bytecode("get", TypeId(0), vec![ValueType::I32], None, 0, Vec::new())
            .with_this();
        assert_eq!(def.arg_words(), 2);
    }
}
