use crate::exception::ManagedException;
use crate::format::Word;
use crate::heap::Heap;
use crate::image::ValueType;

use super::ConvertError;
use super::internal::InternalFn;

pub const MAX_INT_ARGS: usize = 6;
pub const MAX_FLOAT_ARGS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallClass {
    Int,
    Float,
}

#[derive(Clone, Debug)]
pub enum Thunk {
    Native {
        name: String,
        addr: usize,
        params: Vec<ValueType>,
        ret: Option<ValueType>,
        class: CallClass,
    },
    Internal { name: String, func: InternalFn },
}

impl Thunk {
    pub fn native(
        name: &str,
        addr: usize,
        params: &[ValueType],
        ret: Option<ValueType>,
    ) -> Result<Self, ConvertError> {
        let ints = params.iter().all(|param| param.is_integer_class());
        let floats = params.iter().all(|param| *param == ValueType::F64);
        let float_ret = ret == Some(ValueType::F64);
        let class = if ints && !float_ret && params.len() <= MAX_INT_ARGS {
            CallClass::Int
        } else if floats && (float_ret || ret.is_none()) && params.len() <= MAX_FLOAT_ARGS {
            CallClass::Float
        } else {
            return Err(ConvertError::NotImplemented(format!(
                "no native calling sequence for {name}{params:?}"
            )));
        };
        Ok(Thunk::Native {
            name: name.to_string(),
            addr,
            params: params.to_vec(),
            ret,
            class,
        })
    }

    pub fn internal(name: &str, func: InternalFn) -> Self {
        Thunk::Internal {
            name: name.to_string(),
            func,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Thunk::Native { name, .. } | Thunk::Internal { name, .. } => name,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Thunk::Internal { .. })
    }

    pub fn invoke(&self, heap: &Heap, args: &[Word]) -> Result<Word, ManagedException> {
        match self {
            Thunk::Internal { func, .. } => func(heap, args),
            Thunk::Native {
                addr,
                params,
                ret,
                class,
                ..
            } => {
                let args = &args[..params.len().min(args.len())];
                // SAFETY: the address was resolved for this signature and the
                // argument count matches the class limits checked at binding.
                let raw = unsafe {
                    match class {
                        CallClass::Int => call_int(*addr, args),
                        CallClass::Float => call_float(*addr, args),
                    }
                };
                Ok(match ret {
                    Some(ValueType::I32) => raw as u32 as Word,
                    Some(_) => raw,
                    None => 0,
                })
            }
        }
    }
}

type I0 = unsafe extern "C" fn() -> Word;
type I1 = unsafe extern "C" fn(Word) -> Word;
type I2 = unsafe extern "C" fn(Word, Word) -> Word;
type I3 = unsafe extern "C" fn(Word, Word, Word) -> Word;
type I4 = unsafe extern "C" fn(Word, Word, Word, Word) -> Word;
type I5 = unsafe extern "C" fn(Word, Word, Word, Word, Word) -> Word;
type I6 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word) -> Word;

unsafe fn call_int(addr: usize, a: &[Word]) -> Word {
    unsafe {
        match a.len() {
            0 => std::mem::transmute::<usize, I0>(addr)(),
            1 => std::mem::transmute::<usize, I1>(addr)(a[0]),
            2 => std::mem::transmute::<usize, I2>(addr)(a[0], a[1]),
            3 => std::mem::transmute::<usize, I3>(addr)(a[0], a[1], a[2]),
            4 => std::mem::transmute::<usize, I4>(addr)(a[0], a[1], a[2], a[3]),
            5 => std::mem::transmute::<usize, I5>(addr)(a[0], a[1], a[2], a[3], a[4]),
            _ => std::mem::transmute::<usize, I6>(addr)(a[0], a[1], a[2], a[3], a[4], a[5]),
        }
    }
}

type F0 = unsafe extern "C" fn() -> f64;
type F1 = unsafe extern "C" fn(f64) -> f64;
type F2 = unsafe extern "C" fn(f64, f64) -> f64;
type F3 = unsafe extern "C" fn(f64, f64, f64) -> f64;

unsafe fn call_float(addr: usize, a: &[Word]) -> Word {
    let f = |index: usize| f64::from_bits(a[index]);
    let result = unsafe {
        match a.len() {
            0 => std::mem::transmute::<usize, F0>(addr)(),
            1 => std::mem::transmute::<usize, F1>(addr)(f(0)),
            2 => std::mem::transmute::<usize, F2>(addr)(f(0), f(1)),
            _ => std::mem::transmute::<usize, F3>(addr)(f(0), f(1), f(2)),
        }
    };
    result.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add3(a: Word, b: Word, c: Word) -> Word {
        a + b + c
    }

    extern "C" fn hypot(a: f64, b: f64) -> f64 {
        (a * a + b * b).sqrt()
    }

    #[test]
    fn integer_class_call() {
        let params = [ValueType::I32, ValueType::I64, ValueType::Ptr];
        let thunk = Thunk::native("add3", add3 as usize, &params, Some(ValueType::I64))
            .expect("int class");
        let heap = Heap::default();
        assert_eq!(thunk.invoke(&heap, &[1, 2, 3]).expect("call"), 6);
    }

    #[test]
    fn float_class_call() {
        let params = [ValueType::F64, ValueType::F64];
        let thunk = Thunk::native("hypot", hypot as usize, &params, Some(ValueType::F64))
            .expect("float class");
        let heap = Heap::default();
        let result = thunk
            .invoke(&heap, &[3f64.to_bits(), 4f64.to_bits()])
            .expect("call");
        assert_eq!(f64::from_bits(result), 5.0);
    }

    #[test]
    fn mixed_and_oversized_signatures_are_rejected() {
        let mixed = [ValueType::I32, ValueType::F64];
        assert!(matches!(
            Thunk::native("mixed", 0, &mixed, None),
            Err(ConvertError::NotImplemented(_))
        ));
        let many = [ValueType::F64; 4];
        assert!(Thunk::native("many", 0, &many, Some(ValueType::F64)).is_err());
        let seven = [ValueType::I32; 7];
        assert!(Thunk::native("seven", 0, &seven, None).is_err());
    }
}
