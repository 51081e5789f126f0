use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::exception::{ExceptionKind, ManagedException};
use crate::format::{WORD_SIZE, Word};

/// 1-D array: `i32` length followed by the elements at a word boundary.
pub const ARRAY_LENGTH_OFFSET: i32 = 0;
pub const ARRAY_DATA_OFFSET: i32 = 8;

/// 2-D array header. The element data lives in a separate block whose
/// address is stored at offset 0.
pub const MARRAY_DATA_OFFSET: i32 = 0;
pub const MARRAY_ELEM_SIZE_OFFSET: i32 = 8;
pub const MARRAY_BOUNDS_OFFSET: i32 = 12;
pub const MARRAY_BOUND_SIZE: i32 = 12;
pub const MARRAY_LOWER_OFFSET: i32 = 0;
pub const MARRAY_SIZE_OFFSET: i32 = 4;
pub const MARRAY_MULT_OFFSET: i32 = 8;
pub const MARRAY_HEADER_BYTES: usize = 40;

pub const fn marray_bound(dim: i32, field: i32) -> i32 {
    MARRAY_BOUNDS_OFFSET + dim * MARRAY_BOUND_SIZE + field
}

pub const EXCEPTION_KIND_OFFSET: i32 = 0;
pub const EXCEPTION_OBJECT_BYTES: usize = 8;

pub const DEFAULT_HEAP_LIMIT: usize = 256 << 20;

pub struct Heap {
    blocks: Mutex<Vec<Box<[u64]>>>,
    used: AtomicUsize,
    limit: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_LIMIT)
    }
}

impl Heap {
    pub fn new(limit: usize) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            used: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn alloc(&self, bytes: usize) -> Result<Word, ManagedException> {
        let words = bytes.div_ceil(WORD_SIZE).max(1);
        let rounded = words * WORD_SIZE;
        let previous = self.used.fetch_add(rounded, Ordering::Relaxed);
        if previous.saturating_add(rounded) > self.limit {
            self.used.fetch_sub(rounded, Ordering::Relaxed);
            return Err(ManagedException::new(ExceptionKind::OutOfMemory));
        }
        let mut block = vec![0u64; words].into_boxed_slice();
        let addr = block.as_mut_ptr() as Word;
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(block);
        Ok(addr)
    }

    pub fn new_object(&self, size: u32) -> Result<Word, ManagedException> {
        self.alloc(size as usize)
    }

    pub fn new_array(&self, elem_size: u32, length: i32) -> Result<Word, ManagedException> {
        let length = usize::try_from(length)
            .map_err(|_| ManagedException::new(ExceptionKind::Arithmetic))?;
        let bytes = (elem_size as usize)
            .checked_mul(length)
            .and_then(|data| data.checked_add(ARRAY_DATA_OFFSET as usize))
            .ok_or_else(|| ManagedException::new(ExceptionKind::OutOfMemory))?;
        let array = self.alloc(bytes)?;
        // SAFETY: freshly allocated block of at least eight bytes.
        unsafe { write_raw::<i32>(array + ARRAY_LENGTH_OFFSET as Word, length as i32) };
        Ok(array)
    }

    pub fn new_array_2d(
        &self,
        elem_size: u32,
        lower0: i32,
        length0: i32,
        lower1: i32,
        length1: i32,
    ) -> Result<Word, ManagedException> {
        if length0 < 0 || length1 < 0 {
            return Err(ManagedException::new(ExceptionKind::Arithmetic));
        }
        let bytes = (elem_size as usize)
            .checked_mul(length0 as usize)
            .and_then(|size| size.checked_mul(length1 as usize))
            .ok_or_else(|| ManagedException::new(ExceptionKind::OutOfMemory))?;
        let data = self.alloc(bytes)?;
        let header = self.alloc(MARRAY_HEADER_BYTES)?;
        // SAFETY: the header block is MARRAY_HEADER_BYTES long.
        unsafe {
            write_raw::<Word>(header + MARRAY_DATA_OFFSET as Word, data);
            write_raw::<i32>(header + MARRAY_ELEM_SIZE_OFFSET as Word, elem_size as i32);
            write_raw::<i32>(header + marray_bound(0, MARRAY_LOWER_OFFSET) as Word, lower0);
            write_raw::<i32>(header + marray_bound(0, MARRAY_SIZE_OFFSET) as Word, length0);
            write_raw::<i32>(header + marray_bound(0, MARRAY_MULT_OFFSET) as Word, length1);
            write_raw::<i32>(header + marray_bound(1, MARRAY_LOWER_OFFSET) as Word, lower1);
            write_raw::<i32>(header + marray_bound(1, MARRAY_SIZE_OFFSET) as Word, length1);
            write_raw::<i32>(header + marray_bound(1, MARRAY_MULT_OFFSET) as Word, 1);
        }
        Ok(header)
    }

    pub fn new_exception(&self, kind: ExceptionKind) -> Result<Word, ManagedException> {
        let object = self.alloc(EXCEPTION_OBJECT_BYTES)?;
        // SAFETY: freshly allocated exception object.
        unsafe { write_raw::<u32>(object + EXCEPTION_KIND_OFFSET as Word, kind.code()) };
        Ok(object)
    }
}

/// Kind stored in an exception object; unknown codes read as
/// [`ExceptionKind::User`].
///
/// # Safety
/// `object` must be a non-null address of at least four readable bytes.
pub unsafe fn exception_kind(object: Word) -> ExceptionKind {
    let code = unsafe { read_raw::<u32>(object + EXCEPTION_KIND_OFFSET as Word) };
    ExceptionKind::from_code(code).unwrap_or(ExceptionKind::User)
}

/// # Safety
/// `addr` must be valid for reads of `T`.
pub unsafe fn read_raw<T: Copy>(addr: Word) -> T {
    unsafe { (addr as usize as *const T).read_unaligned() }
}

/// # Safety
/// `addr` must be valid for writes of `T`.
pub unsafe fn write_raw<T>(addr: Word, value: T) {
    unsafe { (addr as usize as *mut T).write_unaligned(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_record_length_and_are_zeroed() {
        let heap = Heap::default();
        let array = heap.new_array(4, 3).expect("array");
        unsafe {
            assert_eq!(read_raw::<i32>(array), 3);
            for index in 0..3 {
                assert_eq!(read_raw::<i32>(array + 8 + index * 4), 0);
            }
        }
        assert_eq!(
            heap.new_array(4, -1).expect_err("negative length").kind,
            ExceptionKind::Arithmetic
        );
    }

    #[test]
    fn marray_header_layout() {
        let heap = Heap::default();
        let array = heap.new_array_2d(4, 1, 4, 2, 5).expect("2d array");
        unsafe {
            assert_ne!(read_raw::<Word>(array), 0);
            assert_eq!(read_raw::<i32>(array + 8), 4);
            assert_eq!(read_raw::<i32>(array + 12), 1);
            assert_eq!(read_raw::<i32>(array + 16), 4);
            assert_eq!(read_raw::<i32>(array + 20), 5);
            assert_eq!(read_raw::<i32>(array + 24), 2);
            assert_eq!(read_raw::<i32>(array + 28), 5);
            assert_eq!(read_raw::<i32>(array + 32), 1);
        }
    }

    #[test]
    fn limit_raises_out_of_memory() {
        let heap = Heap::new(64);
        heap.alloc(64).expect("fits");
        assert_eq!(
            heap.alloc(8).expect_err("over limit").kind,
            ExceptionKind::OutOfMemory
        );
    }
}
