use std::sync::{Mutex, PoisonError};

use crate::image::{CharSet, PInvokeRecord};

struct Module {
    name: String,
    handle: Option<usize>,
}

#[derive(Default)]
pub struct ModuleList {
    modules: Mutex<Vec<Module>>,
}

impl ModuleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, name: &str) -> Option<usize> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
        {
            return module.handle;
        }
        let handle = candidates(name).iter().find_map(|path| sys::open(path));
        match handle {
            Some(_) => tracing::debug!(module = name, "loaded module"),
            None => tracing::warn!(module = name, "unable to load module"),
        }
        modules.push(Module {
            name: name.to_string(),
            handle,
        });
        handle
    }

    pub fn len(&self) -> usize {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, handle: usize, record: &PInvokeRecord, method: &str) -> Option<usize> {
        let base = record.alias.as_deref().unwrap_or(method);
        if let Some(addr) = sys::symbol(handle, base) {
            return Some(addr);
        }
        if cfg!(windows) && !record.no_mangle {
            let suffix = match record.charset {
                CharSet::Ansi => 'A',
                CharSet::Unicode => 'W',
            };
            return sys::symbol(handle, &format!("{base}{suffix}"));
        }
        None
    }
}

fn candidates(name: &str) -> Vec<String> {
    let mut out = vec![name.to_string()];
    if name.contains(['/', '\\']) || name.contains('.') {
        return out;
    }
    if cfg!(windows) {
        out.push(format!("{name}.dll"));
    } else if cfg!(target_os = "macos") {
        out.push(format!("{name}.dylib"));
        out.push(format!("lib{name}.dylib"));
    } else {
        out.push(format!("{name}.so"));
        out.push(format!("lib{name}.so"));
        out.push(format!("{name}.so.6"));
    }
    out
}

#[cfg(unix)]
mod sys {
    use std::ffi::CString;

    pub fn open(path: &str) -> Option<usize> {
        let path = CString::new(path).ok()?;
        // SAFETY: `path` is a valid C string; the handle is never closed.
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };
        (!handle.is_null()).then_some(handle as usize)
    }

    pub fn symbol(handle: usize, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        // SAFETY: `handle` came from `dlopen` and stays open.
        let addr = unsafe { libc::dlsym(handle as *mut libc::c_void, name.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::CString;

    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    pub fn open(path: &str) -> Option<usize> {
        let path = CString::new(path).ok()?;
        // SAFETY: `path` is a valid C string; the module is never freed.
        let handle = unsafe { LoadLibraryA(path.as_ptr() as *const u8) };
        (!handle.is_null()).then_some(handle as usize)
    }

    pub fn symbol(handle: usize, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        // SAFETY: `handle` came from `LoadLibraryA` and stays loaded.
        let addr = unsafe { GetProcAddress(handle as _, name.as_ptr() as *const u8) };
        addr.map(|addr| addr as usize)
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    pub fn open(_path: &str) -> Option<usize> {
        None
    }

    pub fn symbol(_handle: usize, _name: &str) -> Option<usize> {
        None
    }
}
