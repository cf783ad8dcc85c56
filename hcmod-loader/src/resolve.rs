use core::ffi::c_void;
use std::ffi::CString;

/// Runtime-provided symbol table.
///
/// The execution layer implements this to hand out its barrier, SIMD and
/// printf entry points. Anything it does not know is looked up in the host
/// process's dynamic symbols as a last resort.
pub trait RuntimeSymbols: Sync {
    fn resolve(&self, name: &str) -> Option<*const c_void>;
}

/// Resolver with no runtime entry points; external symbols then only resolve
/// through `dlsym`. Mostly useful for inspection tools and tests.
impl RuntimeSymbols for () {
    fn resolve(&self, _name: &str) -> Option<*const c_void> {
        None
    }
}

/// Look up `name` in the host process's dynamic symbols.
pub(crate) fn dlsym_default(name: &str) -> Option<*const c_void> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: RTLD_DEFAULT with a valid NUL-terminated name.
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
    if ptr.is_null() { None } else { Some(ptr as *const c_void) }
}
