pub mod assembler;
pub mod cache;
pub mod config;
pub mod converter;
pub mod engine;
pub mod exception;
pub mod format;
pub mod heap;
pub mod image;
pub mod interp;
pub mod lengths;
pub mod machine;
pub mod opcodes;
pub mod unroll;

pub use assembler::{AssemblerError, assemble, assemble_image, disassemble};
pub use cache::{CacheError, CodeSlot, MethodCache};
pub use config::{EngineConfig, UnrollConfig};
pub use converter::{ConvertError, MethodCode, convert};
pub use engine::Engine;
pub use exception::{EngineError, EngineResult, ExceptionKind, ManagedException};
pub use format::{CodeBuilder, CodeView, Encoding, FormatError, Word};
pub use image::{
    ExceptionRegion, Image, ImplKind, MethodDef, MethodId, PInvokeRecord, TypeDef, TypeId,
    ValueType,
};
pub use interp::Thread;
pub use opcodes::Opcode;
pub use unroll::UnrollOutcome;
