use crate::format::FormatError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExceptionKind {
    DivideByZero = 1,
    Arithmetic = 2,
    NullReference = 3,
    IndexOutOfRange = 4,
    Verification = 5,
    EntryPointNotFound = 6,
    NotImplemented = 7,
    OutOfMemory = 8,
    TypeInitialization = 9,
    DllNotFound = 10,
    StackOverflow = 11,
    User = 12,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 12] = [
        ExceptionKind::DivideByZero,
        ExceptionKind::Arithmetic,
        ExceptionKind::NullReference,
        ExceptionKind::IndexOutOfRange,
        ExceptionKind::Verification,
        ExceptionKind::EntryPointNotFound,
        ExceptionKind::NotImplemented,
        ExceptionKind::OutOfMemory,
        ExceptionKind::TypeInitialization,
        ExceptionKind::DllNotFound,
        ExceptionKind::StackOverflow,
        ExceptionKind::User,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    pub fn type_name(self) -> &'static str {
        match self {
            ExceptionKind::DivideByZero => "System.DivideByZeroException",
            ExceptionKind::Arithmetic => "System.ArithmeticException",
            ExceptionKind::NullReference => "System.NullReferenceException",
            ExceptionKind::IndexOutOfRange => "System.IndexOutOfRangeException",
            ExceptionKind::Verification => "System.Security.VerificationException",
            ExceptionKind::EntryPointNotFound => "System.EntryPointNotFoundException",
            ExceptionKind::NotImplemented => "System.NotImplementedException",
            ExceptionKind::OutOfMemory => "System.OutOfMemoryException",
            ExceptionKind::TypeInitialization => "System.TypeInitializationException",
            ExceptionKind::DllNotFound => "System.DllNotFoundException",
            ExceptionKind::StackOverflow => "System.StackOverflowException",
            ExceptionKind::User => "System.Exception",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ExceptionKind::DivideByZero => "Attempted to divide by zero.",
            ExceptionKind::Arithmetic => "Arithmetic operation resulted in an overflow.",
            ExceptionKind::NullReference => {
                "Object reference not set to an instance of an object."
            }
            ExceptionKind::IndexOutOfRange => "Index was outside the bounds of the array.",
            ExceptionKind::Verification => "Operation could destabilize the runtime.",
            ExceptionKind::EntryPointNotFound => "Entry point was not found.",
            ExceptionKind::NotImplemented => "The method or operation is not implemented.",
            ExceptionKind::OutOfMemory => {
                "Insufficient memory to continue the execution of the program."
            }
            ExceptionKind::TypeInitialization => "The type initializer threw an exception.",
            ExceptionKind::DllNotFound => "Unable to load DLL.",
            ExceptionKind::StackOverflow => "Operation caused a stack overflow.",
            ExceptionKind::User => "Exception of type 'System.Exception' was thrown.",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedException {
    pub kind: ExceptionKind,
    pub message: String,
}

impl ManagedException {
    pub fn new(kind: ExceptionKind) -> Self {
        Self {
            kind,
            message: kind.default_message().to_string(),
        }
    }

    pub fn with_message(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn dll_not_found(module: &str) -> Self {
        Self::with_message(
            ExceptionKind::DllNotFound,
            format!("Unable to load DLL '{module}'."),
        )
    }
}

impl std::fmt::Display for ManagedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.type_name(), self.message)
    }
}

impl std::error::Error for ManagedException {}

impl From<ExceptionKind> for ManagedException {
    fn from(kind: ExceptionKind) -> Self {
        ManagedException::new(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InvalidImage(String),
    InvalidMethod(u32),
    Format(FormatError),
    InvalidProgram {
        method: String,
        pc: usize,
        reason: String,
    },
    Uncaught(ManagedException),
    Cache(String),
    Os(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidImage(message) => write!(f, "invalid image: {message}"),
            EngineError::InvalidMethod(id) => write!(f, "invalid method id {id}"),
            EngineError::Format(err) => write!(f, "format error: {err}"),
            EngineError::InvalidProgram {
                method,
                pc,
                reason,
            } => write!(f, "invalid program in '{method}' at {pc}: {reason}"),
            EngineError::Uncaught(exception) => write!(f, "uncaught exception: {exception}"),
            EngineError::Cache(message) => write!(f, "method cache error: {message}"),
            EngineError::Os(message) => write!(f, "os error: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FormatError> for EngineError {
    fn from(err: FormatError) -> Self {
        EngineError::Format(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for kind in ExceptionKind::ALL {
            assert_eq!(ExceptionKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ExceptionKind::from_code(0), None);
    }

    #[test]
    fn display_includes_type_name() {
        let exception = ManagedException::new(ExceptionKind::DivideByZero);
        assert_eq!(
            exception.to_string(),
            "System.DivideByZeroException: Attempted to divide by zero."
        );
        assert_eq!(
            ManagedException::dll_not_found("libmissing").message,
            "Unable to load DLL 'libmissing'."
        );
    }
}
