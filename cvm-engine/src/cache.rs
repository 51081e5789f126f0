use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Dispatch word shadowing one code unit of a converted method. Zero means
/// "interpret"; anything else is the address of an unrolled block that
/// starts at that unit.
#[derive(Debug, Default)]
pub struct CodeSlot(AtomicUsize);

impl CodeSlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Publishes `addr`. The block must be fully written and flushed first;
    /// the release store pairs with the interpreter's acquire load.
    pub fn install(&self, addr: usize) {
        self.0.store(addr, Ordering::Release);
    }

    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_installed(&self) -> bool {
        self.load() != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Exhausted { requested: usize, remaining: usize },
    Os(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Exhausted {
                requested,
                remaining,
            } => write!(
                f,
                "method cache exhausted: requested {requested} bytes, {remaining} remaining"
            ),
            CacheError::Os(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CacheError {}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug)]
pub struct Reservation {
    ptr: *mut u8,
    len: usize,
}

impl Reservation {
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct MethodCache {
    base: *mut u8,
    capacity: usize,
    page: usize,
    next: Mutex<usize>,
}

// SAFETY: the arena pointer is only written through page-aligned
// reservations handed out under `next`, and published code is immutable.
unsafe impl Send for MethodCache {}
unsafe impl Sync for MethodCache {}

impl MethodCache {
    pub fn new(size: usize) -> CacheResult<Self> {
        let page = page_size();
        let capacity = size.max(page).div_ceil(page) * page;
        let base = alloc_executable_region(capacity)?;
        tracing::debug!(capacity, page, "method cache mapped");
        Ok(Self {
            base,
            capacity,
            page,
            next: Mutex::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.capacity
    }

    pub fn reserve(&self, len: usize) -> CacheResult<Reservation> {
        let rounded = len.max(1).div_ceil(self.page) * self.page;
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = self.capacity - *next;
        if rounded > remaining {
            return Err(CacheError::Exhausted {
                requested: len,
                remaining,
            });
        }
        // SAFETY: `*next + rounded <= capacity`.
        let ptr = unsafe { self.base.add(*next) };
        *next += rounded;
        Ok(Reservation { ptr, len: rounded })
    }

    pub fn commit(&self, reservation: Reservation, code: &[u8]) -> CacheResult<usize> {
        if code.len() > reservation.len {
            return Err(CacheError::Exhausted {
                requested: code.len(),
                remaining: reservation.len,
            });
        }
        write_machine_code(reservation.ptr, code)?;
        finalize_executable_region(reservation.ptr, reservation.len)?;
        Ok(reservation.addr())
    }

    pub fn install(&self, code: &[u8]) -> CacheResult<usize> {
        let reservation = self.reserve(code.len())?;
        self.commit(reservation, code)
    }
}

impl Drop for MethodCache {
    fn drop(&mut self) {
        if let Err(err) = free_executable_region(self.base, self.capacity) {
            tracing::warn!("failed to unmap method cache: {err}");
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

fn write_machine_code(ptr: *mut u8, code: &[u8]) -> CacheResult<()> {
    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(target_os = "macos"))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }

    Ok(())
}

#[cfg(target_os = "windows")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> CacheResult<()> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(CacheError::Os(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(CacheError::Os(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> CacheResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(CacheError::Os(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(all(unix, not(target_os = "macos")), target_os = "windows")))]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> CacheResult<()> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> CacheResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(CacheError::Os(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> CacheResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(CacheError::Os(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> CacheResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CacheError::Os(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> CacheResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CacheError::Os(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> CacheResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(CacheError::Os(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_executable_region(_len: usize) -> CacheResult<*mut u8> {
    Err(CacheError::Os(
        "executable memory allocation not implemented for this platform".to_string(),
    ))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> CacheResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_install_is_visible() {
        let slot = CodeSlot::new();
        assert!(!slot.is_installed());
        slot.install(0x1000);
        assert_eq!(slot.load(), 0x1000);
    }

    #[test]
    fn reservations_are_page_aligned_and_exhaust() {
        let cache = MethodCache::new(1).expect("map cache");
        let page = cache.capacity();
        let first = cache.reserve(10).expect("first reservation");
        assert_eq!(first.addr() % page, 0);
        assert_eq!(cache.remaining(), 0);
        let err = cache.reserve(1).expect_err("exhausted");
        assert!(matches!(err, CacheError::Exhausted { remaining: 0, .. }));
    }

    #[cfg(all(target_arch = "x86_64", any(unix, target_os = "windows")))]
    #[test]
    fn committed_code_executes() {
        let cache = MethodCache::new(1 << 16).expect("map cache");
        // mov eax, 42; ret
        let addr = cache
            .install(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
            .expect("install");
        let entry: extern "C" fn() -> i32 = unsafe { std::mem::transmute(addr) };
        assert_eq!(entry(), 42);
    }
}
