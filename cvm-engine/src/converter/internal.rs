use std::collections::HashMap;

use crate::exception::ManagedException;
use crate::format::Word;
use crate::heap::Heap;

pub type InternalFn = fn(&Heap, &[Word]) -> Result<Word, ManagedException>;

#[derive(Clone, Default)]
pub struct InternalCalls {
    calls: HashMap<String, InternalFn>,
    ctors: HashMap<String, InternalFn>,
}

impl InternalCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime() -> Self {
        let mut calls = Self::new();
        calls.register("Runtime::NewArray", new_array);
        calls.register("Runtime::NewArray2D", new_array_2d);
        calls.register("Runtime::NewArray2DBounds", new_array_2d_bounds);
        calls
    }

    pub fn register(&mut self, name: impl Into<String>, func: InternalFn) {
        self.calls.insert(name.into(), func);
    }

    pub fn register_ctor(&mut self, name: impl Into<String>, func: InternalFn) {
        self.ctors.insert(name.into(), func);
    }

    pub fn lookup(&self, name: &str) -> Option<InternalFn> {
        self.calls.get(name).copied()
    }

    pub fn lookup_ctor(&self, name: &str) -> Option<InternalFn> {
        self.ctors.get(name).copied()
    }
}

fn int(args: &[Word], index: usize) -> i32 {
    args.get(index).copied().unwrap_or(0) as u32 as i32
}

fn new_array(heap: &Heap, args: &[Word]) -> Result<Word, ManagedException> {
    heap.new_array(int(args, 0) as u32, int(args, 1))
}

fn new_array_2d(heap: &Heap, args: &[Word]) -> Result<Word, ManagedException> {
    heap.new_array_2d(int(args, 0) as u32, 0, int(args, 1), 0, int(args, 2))
}

fn new_array_2d_bounds(heap: &Heap, args: &[Word]) -> Result<Word, ManagedException> {
    heap.new_array_2d(
        int(args, 0) as u32,
        int(args, 1),
        int(args, 2),
        int(args, 3),
        int(args, 4),
    )
}
